//! Proxy stage for passive data connections
//!
//! The socket below is connected to the proxy; the stage then asks the
//! proxy to open a tunnel to the real data endpoint. The handshake is
//! non-blocking and resumes wherever the socket would block.

use crate::layer::{is_would_block, Layer, Pending};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, trace};

/// Upper bound on an HTTP proxy response header
const MAX_HTTP_HEADER: usize = 16 * 1024;

const SOCKS_VERSION: u8 = 5;

/// Supported proxy protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// HTTP/1.1 `CONNECT`
    Http,
    /// SOCKS5 `CONNECT`
    Socks5,
}

/// Proxy used by the control connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Protocol spoken with the proxy
    pub kind: ProxyType,
    /// Proxy host name or address
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// User name, enables authentication when set
    pub user: Option<String>,
    /// Password for `user`
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Proxy without authentication
    pub fn new(kind: ProxyType, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            user: None,
            password: None,
        }
    }

    /// Authenticate as `user`
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Proxy handshake failures
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Transport error while talking to the proxy
    #[error("{0}")]
    Io(#[source] io::Error),

    /// Proxy closed the connection before the tunnel was up
    #[error("Proxy closed the connection during the handshake")]
    Closed,

    /// HTTP proxy answered with something other than 200
    #[error("Proxy refused the tunnel: {0}")]
    HttpStatus(String),

    /// Reply could not be parsed
    #[error("Malformed proxy reply")]
    Malformed,

    /// SOCKS5 proxy accepted none of the offered methods
    #[error("Proxy accepted none of the offered authentication methods")]
    NoAcceptableMethod,

    /// SOCKS5 username/password authentication was rejected
    #[error("Proxy authentication failed")]
    AuthFailed,

    /// SOCKS5 connect request failed
    #[error("Proxy could not connect to the target, reply code {0}")]
    ConnectFailed(u8),

    /// Value does not fit a one byte SOCKS5 length field
    #[error("Value too long for SOCKS5: {0}")]
    TooLong(&'static str),
}

impl ProxyError {
    /// Whether `err` originates from a proxy handshake
    pub fn is_proxy_error(err: &io::Error) -> bool {
        err.get_ref().is_some_and(|inner| inner.is::<Self>())
    }
}

impl From<ProxyError> for io::Error {
    fn from(err: ProxyError) -> Self {
        let kind = match &err {
            ProxyError::Io(e) => e.kind(),
            ProxyError::Closed => io::ErrorKind::UnexpectedEof,
            ProxyError::AuthFailed => io::ErrorKind::PermissionDenied,
            ProxyError::ConnectFailed(_) | ProxyError::HttpStatus(_) => {
                io::ErrorKind::ConnectionRefused
            }
            _ => io::ErrorKind::InvalidData,
        };
        Self::new(kind, err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    HttpResponse,
    SocksMethod,
    SocksAuth,
    SocksReplyHead,
    SocksReplyTail(usize),
    Done,
}

/// Stage tunnelling through an HTTP or SOCKS5 proxy
pub struct ProxyLayer {
    next: Box<dyn Layer>,
    config: ProxyConfig,
    target_host: String,
    target_port: u16,
    stage: Stage,
    out: Vec<u8>,
    out_pos: usize,
    inbuf: Vec<u8>,
    leftover: Vec<u8>,
}

impl ProxyLayer {
    /// Tunnel to `target_host:target_port` through the proxy `next` is connected to
    pub fn new(
        next: Box<dyn Layer>,
        config: ProxyConfig,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        let mut layer = Self {
            next,
            config,
            target_host: target_host.into(),
            target_port,
            stage: Stage::Done,
            out: Vec::new(),
            out_pos: 0,
            inbuf: Vec::new(),
            leftover: Vec::new(),
        };
        match layer.config.kind {
            ProxyType::Http => {
                layer.out = layer.http_request().into_bytes();
                layer.stage = Stage::HttpResponse;
            }
            ProxyType::Socks5 => {
                let method = if layer.config.user.is_some() { 2 } else { 0 };
                layer.out = vec![SOCKS_VERSION, 1, method];
                layer.stage = Stage::SocksMethod;
            }
        }
        debug!(
            kind = ?layer.config.kind,
            proxy = %layer.config.host,
            "Connecting to {}:{} through proxy",
            layer.target_host,
            layer.target_port
        );
        layer
    }

    fn authority(&self) -> String {
        match self.target_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.target_port),
            _ => format!("{}:{}", self.target_host, self.target_port),
        }
    }

    fn http_request(&self) -> String {
        let authority = self.authority();
        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(user) = &self.config.user {
            let password = self.config.password.as_deref().unwrap_or_default();
            let credentials = STANDARD.encode(format!("{user}:{password}"));
            request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
        }
        request.push_str("\r\n");
        request
    }

    fn socks_auth_request(&self) -> Result<Vec<u8>, ProxyError> {
        let user = self.config.user.as_deref().unwrap_or_default().as_bytes();
        let password = self.config.password.as_deref().unwrap_or_default().as_bytes();
        let user_len = u8::try_from(user.len()).map_err(|_| ProxyError::TooLong("user name"))?;
        let password_len =
            u8::try_from(password.len()).map_err(|_| ProxyError::TooLong("password"))?;
        let mut request = Vec::with_capacity(3 + user.len() + password.len());
        request.extend_from_slice(&[1, user_len]);
        request.extend_from_slice(user);
        request.push(password_len);
        request.extend_from_slice(password);
        Ok(request)
    }

    fn socks_connect_request(&self) -> Result<Vec<u8>, ProxyError> {
        let mut request = vec![SOCKS_VERSION, 1, 0];
        match self.target_host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(1);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(4);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                let host = self.target_host.as_bytes();
                let len = u8::try_from(host.len()).map_err(|_| ProxyError::TooLong("host name"))?;
                request.extend_from_slice(&[3, len]);
                request.extend_from_slice(host);
            }
        }
        request.extend_from_slice(&self.target_port.to_be_bytes());
        Ok(request)
    }

    fn send(&mut self, data: Vec<u8>) {
        self.out = data;
        self.out_pos = 0;
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.out_pos < self.out.len() {
            let n = self.next.write(&self.out[self.out_pos..])?;
            if n == 0 {
                return Err(ProxyError::Closed.into());
            }
            self.out_pos += n;
        }
        self.out.clear();
        self.out_pos = 0;
        Ok(())
    }

    /// Read until `inbuf` holds exactly `need` bytes
    fn fill(&mut self, need: usize) -> io::Result<()> {
        let mut chunk = [0u8; 256];
        while self.inbuf.len() < need {
            let wanted = (need - self.inbuf.len()).min(chunk.len());
            let n = self.next.read(&mut chunk[..wanted])?;
            if n == 0 {
                return Err(ProxyError::Closed.into());
            }
            self.inbuf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn read_http_response(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 1024];
        loop {
            let n = self.next.read(&mut chunk)?;
            if n == 0 {
                return Err(ProxyError::Closed.into());
            }
            self.inbuf.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_header_end(&self.inbuf) {
                let header = String::from_utf8_lossy(&self.inbuf[..end]).into_owned();
                let status_line = header.lines().next().unwrap_or_default().to_string();
                trace!(status = %status_line, "Proxy response");
                let mut parts = status_line.split_whitespace();
                let version_ok = parts.next().is_some_and(|v| v.starts_with("HTTP/1."));
                if !version_ok {
                    return Err(ProxyError::Malformed.into());
                }
                if parts.next() != Some("200") {
                    return Err(ProxyError::HttpStatus(status_line).into());
                }
                self.leftover = self.inbuf.split_off(end + 4);
                self.inbuf.clear();
                return Ok(());
            }
            if self.inbuf.len() > MAX_HTTP_HEADER {
                return Err(ProxyError::Malformed.into());
            }
        }
    }

    fn advance(&mut self) -> io::Result<()> {
        loop {
            self.flush()?;
            match self.stage {
                Stage::Done => return Ok(()),
                Stage::HttpResponse => {
                    self.read_http_response()?;
                    self.stage = Stage::Done;
                }
                Stage::SocksMethod => {
                    self.fill(2)?;
                    let reply = std::mem::take(&mut self.inbuf);
                    if reply[0] != SOCKS_VERSION {
                        return Err(ProxyError::Malformed.into());
                    }
                    match reply[1] {
                        0 => {
                            let request = self.socks_connect_request()?;
                            self.send(request);
                            self.stage = Stage::SocksReplyHead;
                        }
                        2 if self.config.user.is_some() => {
                            let request = self.socks_auth_request()?;
                            self.send(request);
                            self.stage = Stage::SocksAuth;
                        }
                        _ => return Err(ProxyError::NoAcceptableMethod.into()),
                    }
                }
                Stage::SocksAuth => {
                    self.fill(2)?;
                    let reply = std::mem::take(&mut self.inbuf);
                    if reply[1] != 0 {
                        return Err(ProxyError::AuthFailed.into());
                    }
                    let request = self.socks_connect_request()?;
                    self.send(request);
                    self.stage = Stage::SocksReplyHead;
                }
                Stage::SocksReplyHead => {
                    // Header plus the first byte of the bound address
                    self.fill(5)?;
                    let head = std::mem::take(&mut self.inbuf);
                    if head[0] != SOCKS_VERSION {
                        return Err(ProxyError::Malformed.into());
                    }
                    if head[1] != 0 {
                        return Err(ProxyError::ConnectFailed(head[1]).into());
                    }
                    let remaining = match head[3] {
                        1 => 4 - 1 + 2,
                        3 => usize::from(head[4]) + 2,
                        4 => 16 - 1 + 2,
                        _ => return Err(ProxyError::Malformed.into()),
                    };
                    self.stage = Stage::SocksReplyTail(remaining);
                }
                Stage::SocksReplyTail(remaining) => {
                    self.fill(remaining)?;
                    self.inbuf.clear();
                    self.stage = Stage::Done;
                }
            }
        }
    }

    fn not_connected() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "proxy handshake not complete")
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

impl Layer for ProxyLayer {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn next(&self) -> Option<&dyn Layer> {
        Some(self.next.as_ref())
    }

    fn next_mut(&mut self) -> Option<&mut dyn Layer> {
        Some(self.next.as_mut())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stage != Stage::Done {
            return Err(Self::not_connected());
        }
        if !self.leftover.is_empty() {
            let n = buf.len().min(self.leftover.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            return Ok(n);
        }
        self.next.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stage != Stage::Done {
            return Err(Self::not_connected());
        }
        self.next.write(buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.next.shutdown()
    }

    fn handshake(&mut self) -> io::Result<()> {
        self.next.handshake()?;
        let was_done = self.stage == Stage::Done;
        match self.advance() {
            Ok(()) => {
                if !was_done {
                    debug!("Proxy tunnel established");
                }
                Ok(())
            }
            Err(e) if is_would_block(&e) || ProxyError::is_proxy_error(&e) => Err(e),
            Err(e) => Err(ProxyError::Io(e).into()),
        }
    }

    fn pending(&self) -> Pending {
        self.next.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::testing::MemoryLayer;
    use crate::layer::is_would_block;

    /// Stage forwarding to a shared memory peer so tests can script replies mid-handshake
    struct SharedLayer(std::sync::Arc<parking_lot::Mutex<MemoryLayer>>);

    impl Layer for SharedLayer {
        fn name(&self) -> &'static str {
            "shared"
        }
        fn next(&self) -> Option<&dyn Layer> {
            None
        }
        fn next_mut(&mut self) -> Option<&mut dyn Layer> {
            None
        }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.lock().read(buf)
        }
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().write(buf)
        }
        fn shutdown(&mut self) -> io::Result<()> {
            self.0.lock().shutdown()
        }
    }

    fn shared() -> (
        std::sync::Arc<parking_lot::Mutex<MemoryLayer>>,
        Box<dyn Layer>,
    ) {
        let peer = std::sync::Arc::new(parking_lot::Mutex::new(MemoryLayer::default()));
        (std::sync::Arc::clone(&peer), Box::new(SharedLayer(peer)))
    }

    #[test]
    fn test_http_connect_with_credentials() {
        let (peer, next) = shared();
        let config = ProxyConfig::new(ProxyType::Http, "proxy", 3128).with_credentials("bob", "s3cret");
        let mut layer = ProxyLayer::new(next, config, "198.51.100.7", 40001);

        let err = layer.handshake().unwrap_err();
        assert!(is_would_block(&err));
        let request = String::from_utf8(std::mem::take(&mut peer.lock().outgoing)).unwrap();
        assert_eq!(
            request,
            "CONNECT 198.51.100.7:40001 HTTP/1.1\r\nHost: 198.51.100.7:40001\r\n\
             Proxy-Authorization: Basic Ym9iOnMzY3JldA==\r\n\r\n"
        );

        let mut buf = [0u8; 8];
        assert_eq!(layer.read(&mut buf).unwrap_err().kind(), io::ErrorKind::NotConnected);

        peer.lock()
            .incoming
            .extend(b"HTTP/1.1 200 Connection established\r\n\r\nDATA".iter());
        layer.handshake().unwrap();
        assert_eq!(layer.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"DATA");
        assert!(is_would_block(&layer.read(&mut buf).unwrap_err()));
    }

    #[test]
    fn test_http_connect_refused() {
        let mut memory = MemoryLayer::with_incoming(b"HTTP/1.0 403 Forbidden\r\nX: y\r\n\r\n");
        memory.peer_closed = true;
        let config = ProxyConfig::new(ProxyType::Http, "proxy", 8080);
        let mut layer = ProxyLayer::new(Box::new(memory), config, "[::1]", 21);
        let err = layer.handshake().unwrap_err();
        assert!(ProxyError::is_proxy_error(&err));
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn test_http_ipv6_authority() {
        let config = ProxyConfig::new(ProxyType::Http, "proxy", 8080);
        let layer = ProxyLayer::new(Box::new(MemoryLayer::default()), config, "2001:db8::1", 990);
        assert!(layer.http_request().starts_with("CONNECT [2001:db8::1]:990 HTTP/1.1\r\n"));
    }

    #[test]
    fn test_socks5_with_authentication() {
        let (peer, next) = shared();
        let config = ProxyConfig::new(ProxyType::Socks5, "proxy", 1080).with_credentials("u", "pw");
        let mut layer = ProxyLayer::new(next, config, "10.0.0.5", 0x1234);

        assert!(is_would_block(&layer.handshake().unwrap_err()));
        assert_eq!(std::mem::take(&mut peer.lock().outgoing), [5, 1, 2]);

        peer.lock().incoming.extend([5, 2]);
        assert!(is_would_block(&layer.handshake().unwrap_err()));
        assert_eq!(
            std::mem::take(&mut peer.lock().outgoing),
            [1, 1, b'u', 2, b'p', b'w']
        );

        peer.lock().incoming.extend([1, 0]);
        assert!(is_would_block(&layer.handshake().unwrap_err()));
        assert_eq!(
            std::mem::take(&mut peer.lock().outgoing),
            [5, 1, 0, 1, 10, 0, 0, 5, 0x12, 0x34]
        );

        // Reply split across reads, bound address as a domain name
        peer.lock().incoming.extend([5, 0, 0, 3]);
        assert!(is_would_block(&layer.handshake().unwrap_err()));
        peer.lock().incoming.extend([4, b'h', b'o', b's', b't', 0, 21, b'!']);
        layer.handshake().unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(layer.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'!');
    }

    #[test]
    fn test_socks5_domain_target() {
        let mut memory = MemoryLayer::with_incoming(&[5, 0, 5, 0, 0, 1, 127, 0, 0, 1, 0, 80]);
        memory.peer_closed = true;
        let config = ProxyConfig::new(ProxyType::Socks5, "proxy", 1080);
        let mut layer = ProxyLayer::new(Box::new(memory), config, "ftp.example", 2121);
        layer.handshake().unwrap();
        assert_eq!(
            layer.socks_connect_request().unwrap(),
            [&[5u8, 1, 0, 3, 11][..], b"ftp.example", &[8, 73]].concat()
        );
    }

    #[rstest::rstest]
    #[case(&[5, 0xff], io::ErrorKind::InvalidData)]
    #[case(&[5, 0, 5, 1, 0, 1, 0, 0, 0, 0, 0, 0], io::ErrorKind::ConnectionRefused)]
    #[case(&[4, 0], io::ErrorKind::InvalidData)]
    #[case(&[5], io::ErrorKind::UnexpectedEof)]
    fn test_socks5_failures(#[case] reply: &[u8], #[case] kind: io::ErrorKind) {
        let mut memory = MemoryLayer::with_incoming(reply);
        memory.peer_closed = true;
        let config = ProxyConfig::new(ProxyType::Socks5, "proxy", 1080);
        let mut layer = ProxyLayer::new(Box::new(memory), config, "10.1.1.1", 20);
        let err = layer.handshake().unwrap_err();
        assert!(ProxyError::is_proxy_error(&err));
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn test_debug_hides_password() {
        let config = ProxyConfig::new(ProxyType::Http, "proxy", 1).with_credentials("u", "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
