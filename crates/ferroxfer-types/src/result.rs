//! Result type alias for ferroxfer operations

use crate::Error;

/// Result type alias for ferroxfer operations
pub type Result<T> = std::result::Result<T, Error>;
