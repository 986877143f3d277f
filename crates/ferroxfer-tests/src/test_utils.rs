//! Unified test utilities for ferroxfer benchmarks and tests
//!
//! This module provides common utilities used across all test files
//! to ensure consistency and reduce code duplication.

use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Test data generation patterns
#[derive(Debug, Clone, Copy)]
pub enum TestDataPattern {
    /// All zeros
    Zeros,
    /// Deterministic pseudo-random bytes, including bare CR and LF
    Binary,
    /// Text with LF line endings
    UnixText,
    /// Text with CRLF line endings
    DosText,
}

/// Generate test data with specified pattern
pub fn generate_test_data(size: usize, pattern: TestDataPattern) -> Vec<u8> {
    match pattern {
        TestDataPattern::Zeros => vec![0u8; size],
        TestDataPattern::Binary => {
            // xorshift keeps benchmarks reproducible
            let mut state = 0x9E37_79B9_7F4A_7C15u64;
            (0..size)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    (state >> 24) as u8
                })
                .collect()
        }
        TestDataPattern::UnixText => text_lines(size, b"\n"),
        TestDataPattern::DosText => text_lines(size, b"\r\n"),
    }
}

fn text_lines(size: usize, eol: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(size + 64);
    let mut line = 0usize;
    while data.len() < size {
        data.extend_from_slice(format!("line {line} of the transfer test data").as_bytes());
        data.extend_from_slice(eol);
        line += 1;
    }
    data
}

/// Create a temporary file with test data
pub fn create_test_file(
    temp_dir: &TempDir,
    name: &str,
    size: usize,
    pattern: TestDataPattern,
) -> PathBuf {
    let file_path = temp_dir.path().join(name);
    let data = generate_test_data(size, pattern);
    fs::write(&file_path, data).expect("Failed to write test file");
    file_path
}

/// Common file sizes for benchmarks
pub struct CommonFileSizes;

impl CommonFileSizes {
    /// 1KB
    pub const TINY: usize = 1024;
    /// 64KB
    pub const MEDIUM: usize = 64 * 1024;
    /// 1MB
    pub const LARGE: usize = 1024 * 1024;
    /// 10MB
    pub const XLARGE: usize = 10 * 1024 * 1024;

    /// Get sizes suitable for transfer benchmarks
    pub fn transfer() -> Vec<(&'static str, usize)> {
        vec![
            ("64KB", Self::MEDIUM),
            ("1MB", Self::LARGE),
            ("10MB", Self::XLARGE),
        ]
    }
}

/// Install a tracing subscriber once per test binary
///
/// Honors `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_test_data_patterns() {
        let size = 1024;

        let zeros = generate_test_data(size, TestDataPattern::Zeros);
        assert_eq!(zeros.len(), size);
        assert!(zeros.iter().all(|&b| b == 0));

        let binary = generate_test_data(size, TestDataPattern::Binary);
        assert_eq!(binary.len(), size);
        assert_eq!(binary, generate_test_data(size, TestDataPattern::Binary));

        let unix = generate_test_data(size, TestDataPattern::UnixText);
        assert!(unix.len() >= size);
        assert!(!unix.contains(&b'\r'));

        let dos = generate_test_data(size, TestDataPattern::DosText);
        assert_eq!(
            dos.iter().filter(|&&b| b == b'\r').count(),
            dos.iter().filter(|&&b| b == b'\n').count()
        );
    }

    #[test]
    fn test_create_test_file() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = create_test_file(&temp_dir, "test.dat", 1024, TestDataPattern::Zeros);

        assert!(file_path.exists());
        assert_eq!(fs::metadata(&file_path).unwrap().len(), 1024);
    }
}
