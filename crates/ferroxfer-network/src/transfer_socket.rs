//! Data connection state machine
//!
//! A [`TransferSocket`] owns one data connection: it sets up the listening
//! or connecting socket, builds the layer stack on top of it and pumps data
//! between the stack and the bound reader, writer or listing parser. The
//! handlers in this module never block; [`TransferSocket::run`] drives them
//! from socket readiness, reader/writer events and control commands.

mod driver;

use crate::activity::ActivityLayer;
use crate::context::NetworkContext;
use crate::control::{AsyncRequest, Capability, Command, ControlChannel, ListingParser};
use crate::layer::{is_would_block, Layer, RawLayer};
use crate::proxy::{ProxyError, ProxyLayer};
use crate::rate_limit::RateLimitedLayer;
use crate::tls::TlsLayer;
use ferroxfer_config::EngineOptions;
use ferroxfer_io::{AsciiReader, AsciiWriter, Buffer, ReadResult, Reader, WriteBufferResult, Writer};
use ferroxfer_types::{AioEvent, AioResult, Error, Notification, Result, TransferEndReason};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, trace, warn};

/// Reads or writes per readiness notification before yielding
const MAX_PUMP_ITERATIONS: usize = 100;

/// Read size for directory listings
const LISTING_CHUNK: usize = 4096;

/// What the data connection carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Local reader to the peer
    Upload,
    /// Peer to a local writer
    Download,
    /// Peer to a listing parser
    List,
    /// Peer sends at most one byte to prove resume support
    ResumeTest,
}

/// Coarse lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Nothing set up yet
    Idle,
    /// Waiting for the peer to connect
    Listening,
    /// Connecting to the peer
    Connecting,
    /// Layers built, handshaking or held by an activity block
    Connected,
    /// Data is flowing
    Streaming,
    /// Transfer end reason latched
    Ended,
}

/// Address a passive data connection dials
#[derive(Debug, Clone)]
struct Dial {
    host: String,
    port: u16,
    bind: Option<IpAddr>,
}

enum Endpoint {
    Idle,
    Listening(std::net::TcpListener),
    Connecting(Dial),
}

/// One data connection
pub struct TransferSocket {
    ctx: NetworkContext,
    control: Arc<dyn ControlChannel>,
    mode: TransferMode,

    reader: Option<Box<dyn Reader>>,
    writer: Option<Box<dyn Writer>>,
    parser: Option<Box<dyn ListingParser>>,
    aio_tx: UnboundedSender<AioEvent>,
    aio_rx: UnboundedReceiver<AioEvent>,

    endpoint: Endpoint,
    /// Data endpoint behind the proxy
    proxy_target: Option<(String, u16)>,
    stream: Option<Arc<TcpStream>>,
    layer: Option<Box<dyn Layer>>,
    handshaking: bool,
    connected: bool,

    activity_block: u32,
    postponed_receive: bool,
    postponed_send: bool,
    repoll_read: bool,
    repoll_write: bool,

    end_reason: TransferEndReason,
    shutdown_pending: bool,
    made_progress: u8,

    write_buffer: Option<Buffer>,
    read_eof: bool,
    sent: usize,
    resume_test_count: usize,
}

impl TransferSocket {
    /// New socket in `mode`; pumping is held until [`TransferSocket::set_active`]
    pub fn new(ctx: NetworkContext, control: Arc<dyn ControlChannel>, mode: TransferMode) -> Self {
        let (aio_tx, aio_rx) = unbounded_channel();
        Self {
            ctx,
            control,
            mode,
            reader: None,
            writer: None,
            parser: None,
            aio_tx,
            aio_rx,
            endpoint: Endpoint::Idle,
            proxy_target: None,
            stream: None,
            layer: None,
            handshaking: false,
            connected: false,
            activity_block: 1,
            postponed_receive: false,
            postponed_send: false,
            repoll_read: false,
            repoll_write: false,
            end_reason: TransferEndReason::None,
            shutdown_pending: false,
            made_progress: 0,
            write_buffer: None,
            read_eof: false,
            sent: 0,
            resume_test_count: 0,
        }
    }

    /// Transfer mode
    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Latched end reason, [`TransferEndReason::None`] while running
    pub fn end_reason(&self) -> TransferEndReason {
        self.end_reason
    }

    /// Stall diagnostics: 0 nothing moved, 1 first would-block seen, 2 data moved
    pub fn made_progress(&self) -> u8 {
        self.made_progress
    }

    /// Current lifecycle state
    pub fn state(&self) -> SocketState {
        if self.end_reason.is_ended() {
            return SocketState::Ended;
        }
        if self.layer.is_some() {
            return if self.connected && self.activity_block == 0 {
                SocketState::Streaming
            } else {
                SocketState::Connected
            };
        }
        match self.endpoint {
            Endpoint::Idle => SocketState::Idle,
            Endpoint::Listening(_) => SocketState::Listening,
            Endpoint::Connecting(_) => SocketState::Connecting,
        }
    }

    /// Bind the source of an upload
    ///
    /// With `ascii` the data is converted to CRLF line endings on the way
    /// out. Replaces any bound writer.
    pub fn set_reader(&mut self, reader: Box<dyn Reader>, ascii: bool) {
        let mut reader: Box<dyn Reader> = if ascii {
            Box::new(AsciiReader::new(reader, self.ctx.options().buffer_size))
        } else {
            reader
        };
        reader.set_handler(Some(Arc::new(self.aio_tx.clone())));
        if let Some(mut writer) = self.writer.take() {
            writer.close();
        }
        self.sent = 0;
        self.reader = Some(reader);
    }

    /// Bind the sink of a download
    ///
    /// With `ascii` CRLF line endings are collapsed on the way in. Replaces
    /// any bound reader.
    pub fn set_writer(&mut self, writer: Box<dyn Writer>, ascii: bool) {
        let mut writer: Box<dyn Writer> = if ascii {
            Box::new(AsciiWriter::new(writer))
        } else {
            writer
        };
        writer.set_handler(Some(Arc::new(self.aio_tx.clone())));
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        self.write_buffer = None;
        self.writer = Some(writer);
    }

    /// Bind the consumer of a directory listing
    pub fn set_listing_parser(&mut self, parser: Box<dyn ListingParser>) {
        self.parser = Some(parser);
    }

    /// Take back the reader after the transfer
    pub fn take_reader(&mut self) -> Option<Box<dyn Reader>> {
        let mut reader = self.reader.take()?;
        reader.set_handler(None);
        Some(reader)
    }

    /// Take back the writer after the transfer
    pub fn take_writer(&mut self) -> Option<Box<dyn Writer>> {
        let mut writer = self.writer.take()?;
        writer.set_handler(None);
        Some(writer)
    }

    /// Take back the listing parser after the transfer
    pub fn take_listing_parser(&mut self) -> Option<Box<dyn ListingParser>> {
        self.parser.take()
    }

    /// Drop the connection and every socket
    fn reset_socket(&mut self) {
        self.endpoint = Endpoint::Idle;
        self.layer = None;
        self.stream = None;
        self.handshaking = false;
        self.shutdown_pending = false;
        self.repoll_read = false;
        self.repoll_write = false;
        self.write_buffer = None;
    }

    fn create_listener(&self, ipv6: bool, port: u16) -> io::Result<std::net::TcpListener> {
        let (domain, any) = if ipv6 {
            (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        } else {
            (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        apply_buffer_sizes(self.ctx.options(), &socket);
        socket.bind(&SocketAddr::new(any, port).into())?;
        socket.listen(1)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn create_socket_server(&self, ipv6: bool) -> Option<std::net::TcpListener> {
        let options = self.ctx.options();
        if !options.limit_ports {
            return match self.create_listener(ipv6, 0) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    debug!("Could not listen on an ephemeral port: {e}");
                    None
                }
            };
        }
        self.ctx.ports().try_ports(options.limit_ports_low, options.limit_ports_high, |port| {
            match self.create_listener(ipv6, port) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    debug!("Could not listen on port {port}: {e}");
                    None
                }
            }
        })
    }

    /// Listen for the peer and return the argument of the PORT/EPRT command
    ///
    /// `ip` is the local address advertised to the peer.
    pub fn setup_active_transfer(&mut self, ip: &str) -> Result<String> {
        self.reset_socket();
        let ipv6 = self.control.local_addr().is_ipv6();

        let Some(listener) = self.create_socket_server(ipv6) else {
            warn!("CreateSocketServer failed");
            return Err(Error::network("Could not create a listening socket"));
        };
        let local = listener.local_addr().map_err(|e| {
            warn!("GetLocalPort failed: {e}");
            Error::network(format!("Failed to get local port: {e}"))
        })?;

        let mut port = i32::from(local.port());
        let options = self.ctx.options();
        if options.limit_ports {
            port += options.limit_ports_offset;
            if port <= 0 || port >= 65536 {
                warn!("Port outside valid range");
                return Err(Error::network(format!("Port {port} outside valid range")));
            }
        }

        let arguments = if ipv6 {
            format!("|2|{ip}|{port}|")
        } else {
            format!("{},{},{}", ip.replace('.', ","), port / 256, port % 256)
        };
        debug!(local = %local, "Listening for data connection");
        self.endpoint = Endpoint::Listening(listener);
        Ok(arguments)
    }

    /// Prepare connecting to `host:port` announced by the peer
    ///
    /// Without a proxy `host` must be an IP address. The connection itself
    /// is made by [`TransferSocket::run`].
    pub fn setup_passive_transfer(&mut self, host: &str, port: u16) -> Result<()> {
        self.reset_socket();
        let control_local = self.control.local_addr().ip();
        let control_peer = self.control.peer_addr().ip();

        let dial = if let Some(proxy) = self.control.proxy() {
            debug!("Binding data connection source IP to control connection source IP {control_local}");
            self.proxy_target = Some((host.to_string(), port));
            Dial {
                host: proxy.host,
                port: proxy.port,
                bind: Some(control_local),
            }
        } else {
            let ip: IpAddr = host
                .parse()
                .map_err(|_| Error::network(format!("Invalid data connection address '{host}'")))?;
            let bind = if ip == control_peer || ip.to_canonical() == control_peer.to_canonical() {
                debug!("Binding data connection source IP to control connection source IP {control_local}");
                Some(control_local)
            } else {
                warn!(
                    "Destination IP of data connection does not match peer IP of control connection. Not binding source address of data connection."
                );
                None
            };
            self.proxy_target = None;
            Dial {
                host: ip.to_string(),
                port,
                bind,
            }
        };
        self.endpoint = Endpoint::Connecting(dial);
        Ok(())
    }

    /// Build the layer stack over a connected stream
    fn init_layers(&mut self, stream: TcpStream, active: bool) -> Result<()> {
        let stream = Arc::new(stream);
        let mut layer: Box<dyn Layer> = Box::new(RawLayer::new(Arc::clone(&stream)));
        layer = Box::new(ActivityLayer::new(layer, Arc::clone(self.ctx.activity())));
        layer = Box::new(RateLimitedLayer::new(layer, Arc::clone(self.ctx.rate_limiter())));

        if !active {
            if let Some(proxy) = self.control.proxy() {
                let Some((host, port)) = self.proxy_target.clone() else {
                    warn!("Could not get peer address of control connection.");
                    return Err(Error::proxy("No data connection target for the proxy"));
                };
                layer = Box::new(ProxyLayer::new(layer, proxy, host, port));
            }
        }

        if let Some(tls) = self.control.tls() {
            // No Nagle while handshaking
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not disable Nagle's algorithm: {e}");
            }
            layer = Box::new(TlsLayer::new(layer, &tls, self.ctx.options().min_tls_version)?);
        }

        self.stream = Some(stream);
        self.attach(layer);
        Ok(())
    }

    /// Install a layer stack and start its handshake
    pub(crate) fn attach(&mut self, layer: Box<dyn Layer>) {
        self.layer = Some(layer);
        self.handshaking = true;
        self.connected = false;
    }

    fn on_accept(&mut self, stream: TcpStream) {
        self.control.set_alive();
        match stream.peer_addr() {
            Ok(peer) => debug!(%peer, "Accepted data connection"),
            Err(_) => debug!("Accepted data connection"),
        }
        self.endpoint = Endpoint::Idle;
        match self.init_layers(stream, true) {
            Ok(()) => self.continue_handshake(),
            Err(e) => {
                error!("{e}");
                self.transfer_end(TransferEndReason::TransferFailure);
            }
        }
    }

    fn on_connected_stream(&mut self, stream: TcpStream) {
        self.endpoint = Endpoint::Idle;
        match self.init_layers(stream, false) {
            Ok(()) => self.continue_handshake(),
            Err(e) => {
                error!("{e}");
                self.transfer_end(TransferEndReason::TransferFailure);
            }
        }
    }

    /// Advance the layer handshakes
    pub(crate) fn continue_handshake(&mut self) {
        let Some(layer) = self.layer.as_mut() else {
            return;
        };
        match layer.handshake() {
            Ok(()) => {
                self.handshaking = false;
                self.on_connect();
            }
            Err(e) if is_would_block(&e) => {}
            Err(e) => {
                if ProxyError::is_proxy_error(&e) {
                    error!("Proxy handshake failed: {e}");
                } else {
                    error!("The data connection could not be established: {e}");
                }
                self.transfer_end(TransferEndReason::TransferFailure);
            }
        }
    }

    fn on_connect(&mut self) {
        self.control.set_alive();
        debug!("Data connection established");
        self.connected = true;

        let resumed = self.layer.as_ref().and_then(|layer| layer.session_resumed());
        if let Some(resumed) = resumed {
            let capability = self.control.tls_resumption();
            if resumed {
                if capability != Capability::Yes {
                    self.ctx.engine().notify(Notification::TlsSessionResumed);
                    self.control.set_tls_resumption(Capability::Yes);
                }
            } else if capability == Capability::Yes {
                self.transfer_end(TransferEndReason::FailedTlsResumption);
                return;
            } else if capability == Capability::Unknown {
                // Hold until the user confirms
                self.activity_block += 1;
                self.control.send_async_request(AsyncRequest::TlsNoResumption);
            }
            if let Some(stream) = &self.stream {
                if let Err(e) = stream.set_nodelay(false) {
                    debug!("Could not re-enable Nagle's algorithm: {e}");
                }
            }
        }

        if self.activity_block == 0 {
            self.trigger_postponed_events();
        }
        self.on_send();
    }

    fn note_progress(&mut self) {
        if self.made_progress == 0 {
            self.made_progress = 2;
            self.ctx.engine().transfer_status().set_made_progress();
        }
    }

    fn fail_read(&mut self, e: &io::Error) {
        error!("Could not read from transfer socket: {e}");
        self.transfer_end(TransferEndReason::TransferFailure);
    }

    /// Socket became readable
    pub(crate) fn on_receive(&mut self) {
        trace!(mode = ?self.mode, "on_receive");
        if self.layer.is_none() || self.handshaking {
            return;
        }
        if self.activity_block > 0 {
            debug!("Postponing receive");
            self.postponed_receive = true;
            return;
        }

        if !self.end_reason.is_ended() {
            match self.mode {
                TransferMode::List => return self.receive_listing(),
                TransferMode::Download => return self.receive_download(),
                TransferMode::ResumeTest => return self.receive_resume_test(),
                TransferMode::Upload => {}
            }
        }

        let mut discard = [0u8; 1024];
        let Some(layer) = self.layer.as_mut() else {
            return;
        };
        let result = layer.read(&mut discard);
        if self.end_reason.is_ended() {
            match result {
                Ok(0) => self.reset_socket(),
                Err(e) if !is_would_block(&e) => self.reset_socket(),
                _ => {}
            }
            return;
        }
        match result {
            Ok(n) if n > 0 => {
                error!("Received data from the server during an upload");
                self.transfer_end(TransferEndReason::TransferFailure);
            }
            Err(e) if !is_would_block(&e) => self.fail_read(&e),
            _ => {}
        }
    }

    fn receive_listing(&mut self) {
        let mut chunk = [0u8; LISTING_CHUNK];
        for _ in 0..MAX_PUMP_ITERATIONS {
            let Some(layer) = self.layer.as_mut() else {
                return;
            };
            match layer.read(&mut chunk) {
                Err(e) => {
                    if !is_would_block(&e) {
                        self.fail_read(&e);
                    }
                    return;
                }
                Ok(0) => {
                    self.transfer_end(TransferEndReason::Successful);
                    return;
                }
                Ok(n) => {
                    let accepted = self
                        .parser
                        .as_mut()
                        .is_some_and(|parser| parser.add_data(&chunk[..n]));
                    if !accepted {
                        self.transfer_end(TransferEndReason::TransferFailure);
                        return;
                    }
                    self.control.set_alive();
                    self.note_progress();
                    self.ctx.engine().transfer_status().update(n as u64);
                }
            }
        }
        self.repoll_read = true;
    }

    fn receive_download(&mut self) {
        if self.read_eof {
            self.finalize_write();
            return;
        }
        let mut last: io::Result<usize> = Ok(0);
        for _ in 0..MAX_PUMP_ITERATIONS {
            if !self.check_next_write_buffer() {
                return;
            }
            last = self.read_into_buffer();
            match last {
                Ok(n) if n > 0 => {
                    self.control.set_alive();
                    self.note_progress();
                }
                _ => break,
            }
        }

        match last {
            Err(e) if is_would_block(&e) => {}
            Err(e) => self.fail_read(&e),
            Ok(0) => self.finalize_write(),
            Ok(_) => self.repoll_read = true,
        }
    }

    fn read_into_buffer(&mut self) -> io::Result<usize> {
        let (Some(layer), Some(buffer)) = (self.layer.as_mut(), self.write_buffer.as_mut()) else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let n = layer.read(buffer.spare_mut())?;
        buffer.commit(n);
        Ok(n)
    }

    fn receive_resume_test(&mut self) {
        let mut tmp = [0u8; 2];
        loop {
            let Some(layer) = self.layer.as_mut() else {
                return;
            };
            match layer.read(&mut tmp) {
                Err(e) => {
                    if !is_would_block(&e) {
                        self.fail_read(&e);
                    }
                    return;
                }
                Ok(0) => {
                    if self.resume_test_count == 1 {
                        self.transfer_end(TransferEndReason::Successful);
                    } else {
                        warn!("Server incorrectly sent {} bytes", self.resume_test_count);
                        self.transfer_end(TransferEndReason::FailedResumeTest);
                    }
                    return;
                }
                Ok(n) => {
                    self.resume_test_count += n;
                    if self.resume_test_count > 1 {
                        warn!("Server incorrectly sent {} bytes", self.resume_test_count);
                        self.transfer_end(TransferEndReason::FailedResumeTest);
                        return;
                    }
                }
            }
        }
    }

    /// Socket became writable
    pub(crate) fn on_send(&mut self) {
        if self.layer.is_none() {
            trace!("Send without connection, ignoring");
            return;
        }
        if self.handshaking {
            return;
        }
        if self.activity_block > 0 {
            debug!("Postponing send");
            self.postponed_send = true;
            return;
        }
        if self.mode != TransferMode::Upload || self.end_reason.is_ended() {
            return;
        }

        let mut last: io::Result<usize> = Ok(0);
        for _ in 0..MAX_PUMP_ITERATIONS {
            if !self.check_next_read_buffer() {
                return;
            }
            last = self.write_chunk();
            match last {
                Ok(n) if n > 0 => {
                    self.control.set_alive();
                    if self.made_progress == 1 {
                        trace!("Made progress in on_send");
                        self.made_progress = 2;
                        self.ctx.engine().transfer_status().set_made_progress();
                    }
                    self.ctx.engine().transfer_status().update(n as u64);
                }
                _ => break,
            }
        }

        match last {
            Err(e) if is_would_block(&e) => {
                if self.made_progress == 0 {
                    trace!("First would-block in on_send");
                    self.made_progress = 1;
                    self.ctx.engine().transfer_status().set_made_progress();
                }
            }
            Err(e) => {
                error!("Could not write to transfer socket: {e}");
                self.transfer_end(TransferEndReason::TransferFailure);
            }
            Ok(n) if n > 0 => self.repoll_write = true,
            Ok(_) => {}
        }
    }

    fn write_chunk(&mut self) -> io::Result<usize> {
        let (Some(layer), Some(reader)) = (self.layer.as_mut(), self.reader.as_ref()) else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let n = layer.write(&reader.current()[self.sent..])?;
        self.sent += n;
        Ok(n)
    }

    /// Make sure unsent upload data is available; false stops pumping
    fn check_next_read_buffer(&mut self) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        if self.sent < reader.current().len() {
            return true;
        }

        let eof = match reader.read() {
            ReadResult::Ok(chunk) => chunk.is_empty(),
            ReadResult::Wait => return false,
            ReadResult::Error => {
                self.transfer_end(TransferEndReason::TransferFailureCritical);
                return false;
            }
        };
        self.sent = 0;
        if !eof {
            return true;
        }

        let shutdown = self.layer.as_mut().map_or(Ok(()), |layer| layer.shutdown());
        match shutdown {
            Err(e) if !is_would_block(&e) => {
                error!("Could not shut down data connection: {e}");
                self.transfer_end(TransferEndReason::TransferFailure);
            }
            _ => self.transfer_end(TransferEndReason::Successful),
        }
        false
    }

    /// Make sure the download has room to read into; false stops pumping
    fn check_next_write_buffer(&mut self) -> bool {
        if self.write_buffer.as_ref().is_some_and(|buffer| buffer.remaining() > 0) {
            return true;
        }
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };
        match writer.get_write_buffer(self.write_buffer.take()) {
            WriteBufferResult::Ok(buffer) => {
                self.write_buffer = Some(buffer);
                true
            }
            WriteBufferResult::Wait => false,
            WriteBufferResult::Error => {
                self.transfer_end(TransferEndReason::TransferFailureCritical);
                false
            }
        }
    }

    fn finalize_write(&mut self) {
        if self.end_reason.is_ended() {
            return;
        }
        self.read_eof = true;
        let Some(writer) = self.writer.as_mut() else {
            self.transfer_end(TransferEndReason::TransferFailureCritical);
            return;
        };
        match writer.finalize(self.write_buffer.take()) {
            AioResult::Wait => {}
            AioResult::Ok => self.transfer_end(TransferEndReason::Successful),
            AioResult::Error => self.transfer_end(TransferEndReason::TransferFailureCritical),
        }
    }

    /// Reader or writer signalled readiness
    pub fn on_aio_event(&mut self, event: AioEvent) {
        match event {
            AioEvent::ReadReady(id) if self.reader.as_ref().is_some_and(|r| r.id() == id) => {
                self.on_input();
            }
            AioEvent::WriteReady(id) if self.writer.as_ref().is_some_and(|w| w.id() == id) => {
                self.on_write();
            }
            _ => trace!(?event, "Ignoring event from a detached reader or writer"),
        }
    }

    fn on_input(&mut self) {
        if self.activity_block > 0 || self.end_reason.is_ended() {
            return;
        }
        if self.mode == TransferMode::Upload {
            self.on_send();
        }
    }

    fn on_write(&mut self) {
        if self.activity_block > 0 || self.end_reason.is_ended() {
            return;
        }
        if self.mode == TransferMode::Download {
            self.on_receive();
        }
    }

    /// Apply a control command
    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetActive => self.set_active(),
            Command::ContinueWithoutSessionResumption => self.continue_without_session_resumption(),
        }
    }

    /// Release one activity hold
    pub fn set_active(&mut self) {
        if self.end_reason.is_ended() || self.activity_block == 0 {
            return;
        }
        self.activity_block -= 1;
        if self.layer.is_none() {
            return;
        }
        if self.connected {
            self.trigger_postponed_events();
        }
    }

    /// Accept a data connection that did not resume the TLS session
    pub fn continue_without_session_resumption(&mut self) {
        if self.activity_block > 0 {
            self.activity_block -= 1;
            self.trigger_postponed_events();
        }
    }

    fn trigger_postponed_events(&mut self) {
        if self.activity_block > 0 {
            return;
        }
        if self.postponed_receive {
            debug!("Executing postponed receive");
            self.postponed_receive = false;
            self.on_receive();
            if self.end_reason.is_ended() {
                return;
            }
        }
        if self.postponed_send {
            debug!("Executing postponed send");
            self.postponed_send = false;
            self.on_send();
        }
    }

    fn on_socket_error(&mut self, e: &io::Error) {
        debug!("Socket error: {e}");
        if self.end_reason.is_ended() {
            return;
        }
        error!("Transfer connection interrupted: {e}");
        self.transfer_end(TransferEndReason::TransferFailure);
    }

    /// Latch `reason`; only the first call has an effect
    pub(crate) fn transfer_end(&mut self, reason: TransferEndReason) {
        debug!(%reason, "Transfer end");
        if self.end_reason.is_ended() || !reason.is_ended() {
            return;
        }
        self.end_reason = reason;

        if reason.is_success() {
            self.begin_shutdown();
        } else {
            self.reset_socket();
        }
        self.control.transfer_ended(reason);
    }

    /// Start or continue the graceful shutdown after a successful transfer
    fn begin_shutdown(&mut self) {
        let Some(layer) = self.layer.as_mut() else {
            self.shutdown_pending = false;
            return;
        };
        match layer.shutdown() {
            Ok(()) => {
                trace!("Data connection shut down");
                self.shutdown_pending = false;
            }
            Err(e) if is_would_block(&e) => self.shutdown_pending = true,
            Err(e) => {
                debug!("Shutting down data connection failed: {e}");
                self.reset_socket();
            }
        }
    }
}

/// Socket buffer sizes must be set before bind or connect
fn apply_buffer_sizes(options: &EngineOptions, socket: &Socket) {
    if let Some(size) = options.recv_buffer_size() {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            debug!("Could not set receive buffer size to {size}: {e}");
        }
    }
    if let Some(size) = options.send_buffer_size() {
        if let Err(e) = socket.set_send_buffer_size(size) {
            debug!("Could not set send buffer size to {size}: {e}");
        }
    }
}

impl Drop for TransferSocket {
    fn drop(&mut self) {
        self.reset_socket();
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        if let Some(mut writer) = self.writer.take() {
            writer.close();
        }
    }
}

impl fmt::Debug for TransferSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSocket")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("activity_block", &self.activity_block)
            .field("end_reason", &self.end_reason)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::net::SocketAddr;

    /// Control channel double recording what the socket reports
    #[derive(Debug)]
    pub struct RecordingControl {
        pub local: SocketAddr,
        pub peer: SocketAddr,
        pub proxy: Option<crate::proxy::ProxyConfig>,
        pub tls: Option<crate::tls::TlsParams>,
        pub resumption: Mutex<Capability>,
        pub requests: Mutex<Vec<AsyncRequest>>,
        pub ended: Mutex<Vec<TransferEndReason>>,
    }

    impl Default for RecordingControl {
        fn default() -> Self {
            Self {
                local: "127.0.0.1:2100".parse().unwrap(),
                peer: "127.0.0.1:21".parse().unwrap(),
                proxy: None,
                tls: None,
                resumption: Mutex::new(Capability::Unknown),
                requests: Mutex::new(Vec::new()),
                ended: Mutex::new(Vec::new()),
            }
        }
    }

    impl ControlChannel for RecordingControl {
        fn local_addr(&self) -> SocketAddr {
            self.local
        }
        fn peer_addr(&self) -> SocketAddr {
            self.peer
        }
        fn proxy(&self) -> Option<crate::proxy::ProxyConfig> {
            self.proxy.clone()
        }
        fn tls(&self) -> Option<crate::tls::TlsParams> {
            self.tls.clone()
        }
        fn tls_resumption(&self) -> Capability {
            *self.resumption.lock()
        }
        fn set_tls_resumption(&self, capability: Capability) {
            *self.resumption.lock() = capability;
        }
        fn send_async_request(&self, request: AsyncRequest) {
            self.requests.lock().push(request);
        }
        fn transfer_ended(&self, reason: TransferEndReason) {
            self.ended.lock().push(reason);
        }
    }
}
