//! Async driver of the transfer socket
//!
//! Turns tokio readiness, throttle deadlines, reader/writer events and
//! control commands into calls of the non-blocking handlers.

use super::{apply_buffer_sizes, Dial, Endpoint, TransferSocket};
use crate::control::Command;
use crate::layer::Events;
use ferroxfer_config::EngineOptions;
use ferroxfer_types::TransferEndReason;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::pin::Pin;
use std::time::Instant;
use tokio::io::Interest;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, trace, warn};

impl TransferSocket {
    /// Drive the data connection until the transfer ended
    ///
    /// Connects or accepts as prepared by the setup calls, then pumps data
    /// until an end reason is latched and a graceful shutdown finished.
    /// `commands` carries [`Command`]s from the control connection; once
    /// it closes the socket keeps running without it.
    pub async fn run(&mut self, commands: &mut UnboundedReceiver<Command>) -> TransferEndReason {
        let mut commands_open = true;
        self.establish(commands, &mut commands_open).await;

        while !self.end_reason.is_ended() || self.shutdown_pending {
            if self.layer.is_none() {
                break;
            }
            self.pump_once(commands, &mut commands_open).await;
        }

        if !self.end_reason.is_ended() {
            warn!("Data connection closed before the transfer ended");
            self.transfer_end(TransferEndReason::TransferFailure);
        }
        self.reset_socket();
        self.end_reason
    }

    /// Accept or connect, serving events and commands meanwhile
    async fn establish(
        &mut self,
        commands: &mut UnboundedReceiver<Command>,
        commands_open: &mut bool,
    ) {
        let (mut establishing, active): (ConnectFuture, bool) =
            match std::mem::replace(&mut self.endpoint, Endpoint::Idle) {
                Endpoint::Idle => return,
                Endpoint::Listening(listener) => (Box::pin(accept(listener)), true),
                Endpoint::Connecting(dial) => {
                    (Box::pin(connect(dial, self.ctx.options().clone())), false)
                }
            };

        loop {
            tokio::select! {
                result = &mut establishing => {
                    match result {
                        Ok(stream) if active => self.on_accept(stream),
                        Ok(stream) => self.on_connected_stream(stream),
                        Err(e) if active => {
                            error!("Could not accept connection: {e}");
                            self.transfer_end(TransferEndReason::TransferFailure);
                        }
                        Err(e) => {
                            error!("The data connection could not be established: {e}");
                            self.transfer_end(TransferEndReason::TransferFailure);
                        }
                    }
                    return;
                }
                Some(event) = self.aio_rx.recv() => self.on_aio_event(event),
                command = commands.recv(), if *commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => *commands_open = false,
                },
            }
        }
    }

    async fn pump_once(
        &mut self,
        commands: &mut UnboundedReceiver<Command>,
        commands_open: &mut bool,
    ) {
        let pending = self.layer.as_ref().map(|layer| layer.pending()).unwrap_or_default();
        let interest = match (pending.read, pending.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        let stream = self.stream.clone();
        let wakeup = pending.wakeup();
        let repoll = self.repoll_read || self.repoll_write;

        tokio::select! {
            ready = wait_ready(stream.as_deref(), interest), if stream.is_some() && interest.is_some() => {
                match ready {
                    Ok(events) => self.dispatch(events),
                    Err(e) => self.on_socket_error(&e),
                }
            }
            () = sleep_until(wakeup), if wakeup.is_some() => {
                let now = Instant::now();
                let events = Events {
                    read: pending.read_at.is_some_and(|at| at <= now),
                    write: pending.write_at.is_some_and(|at| at <= now),
                };
                trace!(?events, "Throttle elapsed");
                self.dispatch(events);
            }
            () = tokio::task::yield_now(), if repoll => self.repoll(),
            Some(event) = self.aio_rx.recv() => self.on_aio_event(event),
            command = commands.recv(), if *commands_open => match command {
                Some(command) => self.handle_command(command),
                None => *commands_open = false,
            },
        }
    }

    fn repoll(&mut self) {
        let read = std::mem::take(&mut self.repoll_read);
        let write = std::mem::take(&mut self.repoll_write);
        if read {
            self.on_receive();
        }
        if write && !self.end_reason.is_ended() {
            self.on_send();
        }
    }

    /// Route readiness through the stack, then to the handlers
    fn dispatch(&mut self, events: Events) {
        let Some(layer) = self.layer.as_mut() else {
            return;
        };
        layer.on_events(events);

        if self.handshaking {
            self.continue_handshake();
            return;
        }
        if self.end_reason.is_ended() {
            if self.shutdown_pending {
                self.begin_shutdown();
            } else if events.read {
                self.on_receive();
            }
            return;
        }
        if events.read {
            self.on_receive();
        }
        if events.write && !self.end_reason.is_ended() {
            self.on_send();
        }
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

async fn accept(listener: TcpListener) -> io::Result<TcpStream> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let (stream, peer) = listener.accept().await?;
    trace!(%peer, "Incoming data connection");
    Ok(stream)
}

async fn connect(dial: Dial, options: EngineOptions) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((dial.host.as_str(), dial.port))
        .await?
        .collect();
    let addr = dial
        .bind
        .and_then(|bind| addrs.iter().find(|addr| addr.is_ipv6() == bind.is_ipv6()))
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Could not resolve '{}'", dial.host),
            )
        })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    apply_buffer_sizes(&options, &socket);
    if let Some(bind) = dial.bind.filter(|bind| bind.is_ipv6() == addr.is_ipv6()) {
        if let Err(e) = socket.bind(&SocketAddr::new(bind, 0).into()) {
            warn!("Could not bind data connection to {bind}: {e}");
        }
    }
    socket.set_nonblocking(true)?;

    debug!(%addr, "Connecting data connection");
    TcpSocket::from_std_stream(socket.into()).connect(addr).await
}

async fn wait_ready(stream: Option<&TcpStream>, interest: Option<Interest>) -> io::Result<Events> {
    let (Some(stream), Some(interest)) = (stream, interest) else {
        return std::future::pending().await;
    };
    let ready = stream.ready(interest).await?;
    Ok(Events {
        read: ready.is_readable() || ready.is_read_closed(),
        write: ready.is_writable() || ready.is_write_closed(),
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
