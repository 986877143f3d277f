//! Collaborators of the transfer socket on the control side

use crate::proxy::ProxyConfig;
use crate::tls::TlsParams;
use ferroxfer_types::TransferEndReason;
use std::net::SocketAddr;

/// What is known about a server capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capability {
    /// Not determined yet
    #[default]
    Unknown,
    /// Server supports it
    Yes,
    /// Server does not support it
    No,
}

/// Requests the transfer socket raises towards the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncRequest {
    /// The data connection did not resume the control TLS session; ask
    /// whether to continue anyway
    TlsNoResumption,
}

/// Commands sent to a running transfer socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// The control connection is ready, release one activity hold
    SetActive,
    /// The user accepted a data connection without session resumption
    ContinueWithoutSessionResumption,
}

/// Control connection as seen by a transfer socket
pub trait ControlChannel: Send + Sync {
    /// Local address of the control connection
    fn local_addr(&self) -> SocketAddr;

    /// Remote address of the control connection
    fn peer_addr(&self) -> SocketAddr;

    /// Proxy the control connection goes through
    fn proxy(&self) -> Option<ProxyConfig> {
        None
    }

    /// TLS parameters when the data channel is protected
    fn tls(&self) -> Option<TlsParams> {
        None
    }

    /// Recorded TLS session resumption capability of the server
    fn tls_resumption(&self) -> Capability {
        Capability::Unknown
    }

    /// Record the TLS session resumption capability of the server
    fn set_tls_resumption(&self, _capability: Capability) {}

    /// Raise a request that needs an answer before the transfer continues
    fn send_async_request(&self, request: AsyncRequest);

    /// The data connection made progress; resets control timeouts
    fn set_alive(&self) {}

    /// Terminal signal, delivered exactly once per transfer socket
    fn transfer_ended(&self, reason: TransferEndReason);
}

/// Consumer of directory listing data
pub trait ListingParser: Send {
    /// Feed received data; `false` aborts the listing
    fn add_data(&mut self, data: &[u8]) -> bool;
}

impl ListingParser for Vec<u8> {
    fn add_data(&mut self, data: &[u8]) -> bool {
        self.extend_from_slice(data);
        true
    }
}
