//! Data connections for ferroxfer
//!
//! This crate owns the network side of a file transfer:
//!
//! - **Layer stack**: raw socket, byte accounting, rate limiting, proxy
//!   handshakes and TLS, each a non-blocking [`Layer`] over the next
//! - **Transfer socket**: active and passive setup, the handshake and
//!   activity holds, and the data pump between the stack and a reader,
//!   writer or listing parser
//! - **Driver**: [`TransferSocket::run`] feeds socket readiness, throttle
//!   deadlines, reader/writer events and control commands to the socket
//!
//! # Examples
//!
//! ```rust,no_run
//! use ferroxfer_io::{EngineContext, FileWriterFactory, WriterFactory};
//! use ferroxfer_network::{
//!     AsyncRequest, Command, ControlChannel, NetworkContext, TransferMode, TransferSocket,
//! };
//! use ferroxfer_types::TransferEndReason;
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! struct Control;
//!
//! impl ControlChannel for Control {
//!     fn local_addr(&self) -> SocketAddr {
//!         "192.0.2.1:50000".parse().unwrap()
//!     }
//!     fn peer_addr(&self) -> SocketAddr {
//!         "192.0.2.2:21".parse().unwrap()
//!     }
//!     fn send_async_request(&self, _request: AsyncRequest) {}
//!     fn transfer_ended(&self, reason: TransferEndReason) {
//!         println!("transfer ended: {reason}");
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = NetworkContext::new(EngineContext::default());
//! let writer = FileWriterFactory::new("download.bin").open(ctx.engine(), 0, None, None, true)?;
//!
//! let mut socket = TransferSocket::new(ctx, Arc::new(Control), TransferMode::Download);
//! socket.set_writer(writer, false);
//! socket.setup_passive_transfer("192.0.2.2", 50123)?;
//!
//! let (commands, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! commands.send(Command::SetActive)?;
//! let reason = socket.run(&mut rx).await;
//! assert!(reason.is_success());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod activity;
pub mod context;
pub mod control;
pub mod layer;
pub mod ports;
pub mod proxy;
pub mod rate_limit;
pub mod tls;
pub mod transfer_socket;

pub use activity::{ActivityLayer, ActivityLogger};
pub use context::NetworkContext;
pub use control::{AsyncRequest, Capability, Command, ControlChannel, ListingParser};
pub use layer::{Events, Layer, Pending, RawLayer};
pub use ports::PortAllocator;
pub use proxy::{ProxyConfig, ProxyError, ProxyLayer, ProxyType};
pub use rate_limit::{Direction, RateLimitedLayer, RateLimiter};
pub use tls::{TlsLayer, TlsParams};
pub use transfer_socket::{SocketState, TransferMode, TransferSocket};
