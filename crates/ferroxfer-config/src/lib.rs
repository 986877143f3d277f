//! Configuration for the ferroxfer transfer engine
//!
//! [`EngineOptions`] is the options accessor consulted when data sockets,
//! readers and writers are created. Options are layered from defaults,
//! configuration files (YAML, TOML or JSON) and environment variables.
//!
//! # Examples
//!
//! ```rust
//! use ferroxfer_config::ConfigBuilder;
//!
//! let options = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_env_prefix("FERROXFER")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! assert_eq!(options.buffer_size, 256 * 1024);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Default arena slot size
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Minimum TLS protocol version for data connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TlsVersion {
    /// TLS 1.2
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    /// TLS 1.3
    #[serde(rename = "1.3")]
    Tls13,
}

/// Engine options consulted at socket, reader and writer creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Receive buffer size for data sockets, `-1` keeps the OS default
    pub socket_recv_buffer_size: i32,
    /// Send buffer size for data sockets, `-1` keeps the OS default
    pub socket_send_buffer_size: i32,
    /// Restrict active-mode listening ports to a range
    pub limit_ports: bool,
    /// Lowest port of the active-mode range
    pub limit_ports_low: u16,
    /// Highest port of the active-mode range
    pub limit_ports_high: u16,
    /// Value added to the port advertised to the peer
    pub limit_ports_offset: i32,
    /// Minimum TLS version for data connections
    pub min_tls_version: TlsVersion,
    /// Sync downloaded files to disk on finalize
    pub fsync: bool,
    /// Arena slot size in bytes
    pub buffer_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            socket_recv_buffer_size: 4 * 1024 * 1024,
            socket_send_buffer_size: 256 * 1024,
            limit_ports: false,
            limit_ports_low: 6000,
            limit_ports_high: 7000,
            limit_ports_offset: 0,
            min_tls_version: TlsVersion::Tls12,
            fsync: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl EngineOptions {
    /// Receive buffer size, `None` when the OS default should be kept
    pub fn recv_buffer_size(&self) -> Option<usize> {
        usize::try_from(self.socket_recv_buffer_size).ok()
    }

    /// Send buffer size, `None` when the OS default should be kept
    pub fn send_buffer_size(&self) -> Option<usize> {
        usize::try_from(self.socket_send_buffer_size).ok()
    }

    /// Check the options for consistency
    pub fn validate(&self) -> ConfigResult<()> {
        if self.buffer_size < 4096 {
            return Err(ConfigError::validation(
                "Buffer size must be at least 4096 bytes",
            ));
        }

        if self.limit_ports {
            if self.limit_ports_low == 0 {
                return Err(ConfigError::invalid_value(
                    "limit_ports_low",
                    "port 0 is not a valid range bound",
                ));
            }
            if self.limit_ports_low > self.limit_ports_high {
                return Err(ConfigError::validation(
                    "Port range low bound must not exceed the high bound",
                ));
            }
        }

        if self.socket_recv_buffer_size < -1 || self.socket_send_buffer_size < -1 {
            return Err(ConfigError::validation(
                "Socket buffer sizes must be -1 or a positive value",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.recv_buffer_size(), Some(4 * 1024 * 1024));
        assert_eq!(options.send_buffer_size(), Some(256 * 1024));
        assert!(!options.limit_ports);
        assert_eq!(options.min_tls_version, TlsVersion::Tls12);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_os_default_buffer_sizes() {
        let options = EngineOptions {
            socket_recv_buffer_size: -1,
            socket_send_buffer_size: -1,
            ..EngineOptions::default()
        };
        assert_eq!(options.recv_buffer_size(), None);
        assert_eq!(options.send_buffer_size(), None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let options = EngineOptions {
            limit_ports: true,
            limit_ports_low: 7000,
            limit_ports_high: 6000,
            ..EngineOptions::default()
        };
        assert!(options.validate().is_err());
    }
}
