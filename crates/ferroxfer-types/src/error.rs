//! Error types and handling for ferroxfer
//!
//! [`Error`] covers construction-time failures: opening a source or sink,
//! setting up a data connection, building the socket layers, loading
//! configuration. Expected per-operation outcomes on readers, writers and
//! transfer sockets are reported through [`crate::AioResult`] and
//! [`crate::TransferEndReason`] instead.

use std::path::PathBuf;

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorSeverity {
    /// Low severity - operation can continue
    Low,
    /// Medium severity - operation should be retried
    Medium,
    /// High severity - operation should be aborted
    High,
    /// Critical severity - the transfer must not be retried as-is
    Critical,
}

/// Main error type for ferroxfer operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// File not found
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path to the file that was not found
        path: PathBuf,
    },

    /// Buffer arena could not be allocated or mapped
    #[error("Allocation failed: {message}")]
    Allocation {
        /// Error message describing the allocation failure
        message: String,
    },

    /// Network error
    #[error("Network error: {message}")]
    Network {
        /// Error message describing the network issue
        message: String,
    },

    /// Proxy negotiation error
    #[error("Proxy error: {message}")]
    Proxy {
        /// Error message describing the proxy issue
        message: String,
    },

    /// Transport security error
    #[error("TLS error: {message}")]
    Tls {
        /// Error message describing the TLS issue
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Peer or caller violated the expected protocol
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message describing the violation
        message: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O related errors
    Io,
    /// Allocation errors
    Allocation,
    /// Network, proxy and TLS errors
    Network,
    /// Configuration errors
    Config,
    /// Protocol violations
    Protocol,
    /// Cancellation
    Cancelled,
    /// Other errors
    Other,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::FileNotFound { .. } => ErrorKind::Io,
            Self::Allocation { .. } => ErrorKind::Allocation,
            Self::Network { .. } | Self::Proxy { .. } | Self::Tls { .. } => ErrorKind::Network,
            Self::Config { .. } => ErrorKind::Config,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Io { .. } => ErrorSeverity::Medium,
            Self::FileNotFound { .. } => ErrorSeverity::High,
            Self::Allocation { .. } => ErrorSeverity::Critical,
            Self::Network { .. } | Self::Proxy { .. } => ErrorSeverity::Medium,
            Self::Tls { .. } => ErrorSeverity::High,
            Self::Config { .. } => ErrorSeverity::High,
            Self::Protocol { .. } => ErrorSeverity::High,
            Self::Cancelled => ErrorSeverity::Low,
            Self::Other { .. } => ErrorSeverity::Medium,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { message } => {
                message.contains("Interrupted")
                    || message.contains("would block")
                    || message.contains("timed out")
            }
            Self::Network { .. } | Self::Proxy { .. } | Self::Other { .. } => true,
            Self::FileNotFound { .. }
            | Self::Allocation { .. }
            | Self::Tls { .. }
            | Self::Config { .. }
            | Self::Protocol { .. }
            | Self::Cancelled => false,
        }
    }

    /// Check if this error should trigger a retry
    pub fn should_retry(&self) -> bool {
        self.is_recoverable() && self.severity() <= ErrorSeverity::Medium
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new allocation error
    pub fn allocation<S: Into<String>>(message: S) -> Self {
        Self::Allocation {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new proxy error
    pub fn proxy<S: Into<String>>(message: S) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    /// Create a new TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}
