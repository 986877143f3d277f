//! TLS stage for protected data connections
//!
//! Built on a sans-I/O `rustls` client session that is fed through the
//! stage below. The control connection hands over its client configuration
//! so the data connection can resume the control session.

use crate::layer::{is_would_block, would_block, Events, Layer, LayerIo, Pending};
use ferroxfer_config::TlsVersion;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, HandshakeKind, ProtocolVersion};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// TLS parameters of the control connection
#[derive(Clone)]
pub struct TlsParams {
    /// Client configuration, including the session store shared with the control connection
    pub config: Arc<ClientConfig>,
    /// Name the server certificate is verified against
    pub server_name: String,
}

impl TlsParams {
    /// Parameters for `server_name`
    pub fn new(config: Arc<ClientConfig>, server_name: impl Into<String>) -> Self {
        Self {
            config,
            server_name: server_name.into(),
        }
    }
}

impl fmt::Debug for TlsParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsParams")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

fn tls_error(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Stage running a TLS client session
pub struct TlsLayer {
    next: Box<dyn Layer>,
    conn: ClientConnection,
    min_version: TlsVersion,
    established: bool,
    closing: bool,
}

impl TlsLayer {
    /// Start a client session over `next`
    pub fn new(
        next: Box<dyn Layer>,
        params: &TlsParams,
        min_version: TlsVersion,
    ) -> Result<Self, ferroxfer_types::Error> {
        let name = ServerName::try_from(params.server_name.clone()).map_err(|e| {
            ferroxfer_types::Error::tls(format!(
                "Invalid server name '{}': {}",
                params.server_name, e
            ))
        })?;
        let conn = ClientConnection::new(Arc::clone(&params.config), name).map_err(|e| {
            ferroxfer_types::Error::tls(format!("Failed to start TLS session: {e}"))
        })?;
        debug!(server = %params.server_name, ?min_version, "Starting TLS handshake");
        Ok(Self {
            next,
            conn,
            min_version,
            established: false,
            closing: false,
        })
    }

    /// Negotiated protocol version once the handshake is done
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.conn.protocol_version()
    }

    /// Push queued TLS records into the stage below
    fn flush(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut LayerIo(self.next.as_mut()))?;
        }
        Ok(())
    }

    /// Pull records from below; `false` once the transport reached end of stream
    fn fill(&mut self) -> io::Result<bool> {
        let n = self.conn.read_tls(&mut LayerIo(self.next.as_mut()))?;
        self.conn.process_new_packets().map_err(tls_error)?;
        Ok(n > 0)
    }

    fn check_version(&self) -> io::Result<()> {
        let version = self.conn.protocol_version();
        let acceptable = match self.min_version {
            TlsVersion::Tls12 => matches!(
                version,
                Some(ProtocolVersion::TLSv1_2 | ProtocolVersion::TLSv1_3)
            ),
            TlsVersion::Tls13 => version == Some(ProtocolVersion::TLSv1_3),
        };
        if acceptable {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Negotiated {version:?} is below the configured minimum TLS version"),
            ))
        }
    }
}

impl Layer for TlsLayer {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn next(&self) -> Option<&dyn Layer> {
        Some(self.next.as_ref())
    }

    fn next_mut(&mut self) -> Option<&mut dyn Layer> {
        Some(self.next.as_mut())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if is_would_block(&e) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!("Server did not properly shut down TLS connection");
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
            self.fill()?;
            // Alerts and key updates produced while processing
            if let Err(e) = self.flush() {
                if !is_would_block(&e) {
                    return Err(e);
                }
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush()?;
        let n = self.conn.writer().write(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(would_block());
        }
        match self.flush() {
            Err(e) if !is_would_block(&e) => Err(e),
            _ => Ok(n),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if !self.closing {
            trace!("Sending TLS close_notify");
            self.conn.send_close_notify();
            self.closing = true;
        }
        self.flush()?;
        self.next.shutdown()
    }

    fn handshake(&mut self) -> io::Result<()> {
        self.next.handshake()?;
        while self.conn.is_handshaking() {
            self.flush()?;
            if !self.conn.is_handshaking() {
                break;
            }
            if !self.fill()? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed during TLS handshake",
                ));
            }
        }
        self.flush()?;
        if !self.established {
            self.check_version()?;
            self.established = true;
            debug!(
                version = ?self.conn.protocol_version(),
                resumed = self.conn.handshake_kind() == Some(HandshakeKind::Resumed),
                "TLS handshake complete"
            );
        }
        Ok(())
    }

    fn pending(&self) -> Pending {
        self.next.pending()
    }

    fn on_events(&mut self, events: Events) {
        self.next.on_events(events);
        if events.write && self.established {
            if let Err(e) = self.flush() {
                if !is_would_block(&e) {
                    trace!("Deferred TLS flush failed: {e}");
                }
            }
        }
    }

    fn session_resumed(&self) -> Option<bool> {
        Some(self.conn.handshake_kind() == Some(HandshakeKind::Resumed))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;

    /// Self-signed certificate for `localhost`
    const CERT: &str = "MIIBuDCCAV+gAwIBAgIUQrGsJ85nTLIh6hJ9UCb5XggxOBMwCgYIKoZIzj0EAwIwFDESMBAGA1UEAwwJbG9jYWxob3N0MCAXDTI2MTAxOTE0MDk0NloYDzIxMjYwOTI1MTQwOTQ2WjAUMRIwEAYDVQQDDAlsb2NhbGhvc3QwWTATBgcqhkjOPQIBBggqhkjOPQMBBwNCAAREjKPlXxZ26mzAPns57racBPRh4Md6BVouTCxsmoned+ooMMKDjZS5VxjelL1JRKZUaiNRjfJh7TS1kU0g80aeo4GMMIGJMB0GA1UdDgQWBBQKrWoMEBFpnaiEx4EpxTqDgajHTTAfBgNVHSMEGDAWgBQKrWoMEBFpnaiEx4EpxTqDgajHTTAUBgNVHREEDTALgglsb2NhbGhvc3QwDAYDVR0TAQH/BAIwADAOBgNVHQ8BAf8EBAMCB4AwEwYDVR0lBAwwCgYIKwYBBQUHAwEwCgYIKoZIzj0EAwIDRwAwRAIgTSpsTPduq31S7d0KZC2rjQn4fEgeQtuyNv/bZY4pd+8CIDTTsmyLlDF61zN2e8dxmRQqxMtX/WI3g0aoINuh/J74";
    const KEY: &str = "MIGHAgEAMBMGByqGSM49AgEGCCqGSM49AwEHBG0wawIBAQQguBxk0Xh+AOhVZtC9x9Cppjq7d9LoPvu/FabkVZTSFIShRANCAAREjKPlXxZ26mzAPns57racBPRh4Md6BVouTCxsmoned+ooMMKDjZS5VxjelL1JRKZUaiNRjfJh7TS1kU0g80ae";

    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn cert() -> CertificateDer<'static> {
        CertificateDer::from(STANDARD.decode(CERT).unwrap())
    }

    pub fn client_config() -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(cert()).unwrap();
        Arc::new(
            ClientConfig::builder_with_provider(provider())
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    pub fn server_config() -> Arc<ServerConfig> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(STANDARD.decode(KEY).unwrap()));
        Arc::new(
            ServerConfig::builder_with_provider(provider())
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_no_client_auth()
                .with_single_cert(vec![cert()], key)
                .unwrap(),
        )
    }
}
