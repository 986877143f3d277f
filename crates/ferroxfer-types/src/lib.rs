//! Core type system and error handling for ferroxfer
//!
//! This crate provides the foundational types shared by the transfer I/O
//! crates:
//!
//! - **Error handling**: [`Error`] with kinds and severity levels
//! - **Operation outcomes**: [`AioResult`] and the latched [`TransferEndReason`]
//! - **Events**: [`AioId`]-tagged readiness events and [`Notification`]s
//! - **Collaborators**: [`AioHandler`] and [`NotificationSink`]
//!
//! # Features
//!
//! - `async` (default): channel-backed collaborator implementations
//! - `serde`: Enable serialization support
//!
//! # Examples
//!
//! ```rust
//! use ferroxfer_types::{TransferEndReason, TransferStatus};
//!
//! let status = TransferStatus::new();
//! status.init(Some(4096), 0);
//! status.update(1024);
//! assert_eq!(status.transferred(), 1024);
//! assert!(!TransferEndReason::None.is_ended());
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod result;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use error::{Error, ErrorKind, ErrorSeverity};
pub use result::Result;
pub use traits::*;
pub use types::*;
