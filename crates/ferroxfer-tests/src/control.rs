//! Control connection double

use ferroxfer_network::{AsyncRequest, Capability, ControlChannel, ProxyConfig, TlsParams};
use ferroxfer_types::TransferEndReason;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Records everything a transfer socket reports to its control connection
#[derive(Debug)]
pub struct TestControl {
    local: SocketAddr,
    peer: SocketAddr,
    proxy: Option<ProxyConfig>,
    tls: Option<TlsParams>,
    resumption: Mutex<Capability>,
    requests: Mutex<Vec<AsyncRequest>>,
    ended: Mutex<Vec<TransferEndReason>>,
    alive: AtomicUsize,
}

impl TestControl {
    /// Control connection from `local` to `peer`
    pub fn new(local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            local,
            peer,
            proxy: None,
            tls: None,
            resumption: Mutex::new(Capability::Unknown),
            requests: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
            alive: AtomicUsize::new(0),
        }
    }

    /// IPv4 loopback on both ends
    pub fn loopback() -> Self {
        Self::new(
            SocketAddr::from(([127, 0, 0, 1], 50000)),
            SocketAddr::from(([127, 0, 0, 1], 21)),
        )
    }

    /// Route passive data connections through `proxy`
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Protect data connections with TLS
    pub fn with_tls(mut self, tls: TlsParams, resumption: Capability) -> Self {
        self.tls = Some(tls);
        self.resumption = Mutex::new(resumption);
        self
    }

    /// Async requests raised so far
    pub fn requests(&self) -> Vec<AsyncRequest> {
        self.requests.lock().clone()
    }

    /// End reasons reported so far
    pub fn ended(&self) -> Vec<TransferEndReason> {
        self.ended.lock().clone()
    }

    /// Number of keep-alive signals
    pub fn alive_count(&self) -> usize {
        self.alive.load(Ordering::Relaxed)
    }
}

impl ControlChannel for TestControl {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn proxy(&self) -> Option<ProxyConfig> {
        self.proxy.clone()
    }

    fn tls(&self) -> Option<TlsParams> {
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

    fn set_alive(&self) {
        self.alive.fetch_add(1, Ordering::Relaxed);
    }

    fn transfer_ended(&self, reason: TransferEndReason) {
        self.ended.lock().push(reason);
    }
}
