//! Socket layers: composable stages on top of a TCP stream
//!
//! Every stage offers the same non-blocking capability set as the raw
//! socket and forwards to the stage below it. A stage that cannot make
//! progress returns [`io::ErrorKind::WouldBlock`] and records what it is
//! waiting for in [`Pending`]; the driver turns that into readiness
//! [`Events`] once the wait is over.

use socket2::SockRef;
use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::trace;

/// What a stack is waiting for after returning would-block
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    /// Waiting for the socket to become readable
    pub read: bool,
    /// Waiting for the socket to become writable
    pub write: bool,
    /// Reads are throttled until this instant
    pub read_at: Option<Instant>,
    /// Writes are throttled until this instant
    pub write_at: Option<Instant>,
}

impl Pending {
    /// Earliest throttle deadline
    pub fn wakeup(&self) -> Option<Instant> {
        match (self.read_at, self.write_at) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }
}

/// Readiness delivered to a stack
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Events {
    /// Reading may make progress
    pub read: bool,
    /// Writing may make progress
    pub write: bool,
}

impl Events {
    /// Whether no direction is set
    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// One stage of a data connection
pub trait Layer: Send {
    /// Short stage name for logging
    fn name(&self) -> &'static str;

    /// Stage below this one, `None` for the raw socket
    fn next(&self) -> Option<&dyn Layer>;

    /// Mutable access to the stage below
    fn next_mut(&mut self) -> Option<&mut dyn Layer>;

    /// Read application data; `Ok(0)` at end of stream
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write application data
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Gracefully close the sending side; would-block while in progress
    fn shutdown(&mut self) -> io::Result<()>;

    /// Advance stage handshakes; `Ok` once application data can flow
    fn handshake(&mut self) -> io::Result<()> {
        self.next_mut().map_or(Ok(()), |next| next.handshake())
    }

    /// Conditions the stack waits for
    fn pending(&self) -> Pending {
        self.next().map(|next| next.pending()).unwrap_or_default()
    }

    /// Deliver readiness to the stack
    fn on_events(&mut self, events: Events) {
        if let Some(next) = self.next_mut() {
            next.on_events(events);
        }
    }

    /// Whether a TLS stage resumed a session, `None` without TLS
    fn session_resumed(&self) -> Option<bool> {
        self.next().and_then(|next| next.session_resumed())
    }
}

/// Bottom stage over a tokio TCP stream
///
/// The stream is shared with the driver, which awaits its readiness.
pub struct RawLayer {
    stream: Arc<TcpStream>,
    read_blocked: bool,
    write_blocked: bool,
    shut: bool,
}

impl RawLayer {
    /// Wrap `stream`; the stack starts out waiting for readability
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self {
            stream,
            read_blocked: true,
            write_blocked: false,
            shut: false,
        }
    }
}

impl Layer for RawLayer {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn next(&self) -> Option<&dyn Layer> {
        None
    }

    fn next_mut(&mut self) -> Option<&mut dyn Layer> {
        None
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.stream.try_read(buf);
        if matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            self.read_blocked = true;
        }
        result
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.stream.try_write(buf);
        if matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            self.write_blocked = true;
        }
        result
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if !self.shut {
            SockRef::from(&*self.stream).shutdown(Shutdown::Write)?;
            self.shut = true;
            trace!("Shut down sending side of the data connection");
        }
        Ok(())
    }

    fn pending(&self) -> Pending {
        Pending {
            read: self.read_blocked,
            write: self.write_blocked,
            ..Pending::default()
        }
    }

    fn on_events(&mut self, events: Events) {
        if events.read {
            self.read_blocked = false;
        }
        if events.write {
            self.write_blocked = false;
        }
    }
}

/// Adapter exposing a layer through `std::io` traits
pub(crate) struct LayerIo<'a>(pub &'a mut dyn Layer);

impl io::Read for LayerIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl io::Write for LayerIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn would_block() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}

pub(crate) fn is_would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// In-memory stage for exercising the layers above the socket
#[cfg(test)]
pub(crate) mod testing {
    use super::{would_block, Layer, Pending};
    use std::collections::VecDeque;
    use std::io;

    /// Scripted peer: `incoming` is what the peer sent, `outgoing` collects writes
    #[derive(Debug, Default)]
    pub struct MemoryLayer {
        pub incoming: VecDeque<u8>,
        pub outgoing: Vec<u8>,
        pub peer_closed: bool,
        pub shut: bool,
        /// Bytes accepted per write call, unlimited when `None`
        pub write_limit: Option<usize>,
        pub writes: usize,
        pub read_blocked: bool,
    }

    impl MemoryLayer {
        pub fn with_incoming(data: &[u8]) -> Self {
            Self {
                incoming: data.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl Layer for MemoryLayer {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn next(&self) -> Option<&dyn Layer> {
            None
        }

        fn next_mut(&mut self) -> Option<&mut dyn Layer> {
            None
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.incoming.is_empty() {
                if self.peer_closed {
                    return Ok(0);
                }
                self.read_blocked = true;
                return Err(would_block());
            }
            let n = buf.len().min(self.incoming.len());
            for (slot, byte) in buf.iter_mut().zip(self.incoming.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
            if n == 0 && !buf.is_empty() {
                return Err(would_block());
            }
            self.outgoing.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn shutdown(&mut self) -> io::Result<()> {
            self.shut = true;
            Ok(())
        }

        fn pending(&self) -> Pending {
            Pending {
                read: self.read_blocked,
                ..Pending::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_pending_wakeup_picks_earliest() {
        let now = Instant::now();
        let later = now + std::time::Duration::from_millis(50);
        let pending = Pending {
            read_at: Some(later),
            write_at: Some(now),
            ..Pending::default()
        };
        assert_eq!(pending.wakeup(), Some(now));
        assert_eq!(Pending::default().wakeup(), None);
    }

    #[tokio::test]
    async fn test_raw_layer_tracks_would_block() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = Arc::new(client.unwrap());
        let (mut server, _) = server.unwrap();

        let mut raw = RawLayer::new(Arc::clone(&client));
        raw.on_events(Events {
            read: true,
            write: true,
        });
        assert_eq!(raw.pending(), Pending::default());

        let mut buf = [0u8; 16];
        let err = raw.read(&mut buf).unwrap_err();
        assert!(is_would_block(&err));
        assert!(raw.pending().read);

        server.write_all(b"ping").await.unwrap();
        client.readable().await.unwrap();
        raw.on_events(Events {
            read: true,
            write: false,
        });
        assert_eq!(raw.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        assert_eq!(raw.write(b"pong").unwrap(), 4);
        raw.shutdown().unwrap();
        let mut echoed = Vec::new();
        server.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"pong");
    }
}
