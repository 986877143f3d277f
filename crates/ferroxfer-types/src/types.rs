//! Core data types for ferroxfer
//!
//! Per-operation results of readers and writers, the latched end reason of
//! a transfer socket, readiness events and shared transfer statistics.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Outcome of a non-blocking reader or writer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AioResult {
    /// Operation completed
    Ok,
    /// Nothing can be done right now; a readiness event follows
    Wait,
    /// The object is in a sticky error state
    Error,
}

impl AioResult {
    /// Returns true for [`AioResult::Ok`]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Terminal status of a transfer socket
///
/// `None` until the transfer concludes. Once set to anything else it is
/// never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransferEndReason {
    /// Transfer still in progress
    #[default]
    None,
    /// All data moved and the connection was shut down cleanly
    Successful,
    /// Ordinary failure, the control layer may retry
    TransferFailure,
    /// Failure that must not be retried at the same placement or offset
    TransferFailureCritical,
    /// TLS session resumption did not match the recorded server capability
    FailedTlsResumption,
    /// The peer sent an unexpected amount of data while verifying resume support
    FailedResumeTest,
}

impl TransferEndReason {
    /// Returns true once the transfer concluded, whatever the outcome
    pub fn is_ended(self) -> bool {
        self != Self::None
    }

    /// Returns true for [`TransferEndReason::Successful`]
    pub fn is_success(self) -> bool {
        self == Self::Successful
    }
}

impl fmt::Display for TransferEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Successful => "successful",
            Self::TransferFailure => "transfer_failure",
            Self::TransferFailureCritical => "transfer_failure_critical",
            Self::FailedTlsResumption => "failed_tls_resumption",
            Self::FailedResumeTest => "failed_resumetest",
        };
        f.write_str(name)
    }
}

/// Identity of a reader or writer instance, carried by its readiness events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AioId(u64);

impl AioId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aio#{}", self.0)
    }
}

/// Readiness notification sent when a blocked consumer can make progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioEvent {
    /// A reader has data available again
    ReadReady(AioId),
    /// A writer has an empty buffer available again
    WriteReady(AioId),
}

impl AioEvent {
    /// Id of the object that emitted the event
    pub fn source(self) -> AioId {
        match self {
            Self::ReadReady(id) | Self::WriteReady(id) => id,
        }
    }
}

/// Asynchronous notifications for higher layers
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Notification {
    /// A file writer created missing parent directories
    LocalDirCreated(PathBuf),
    /// A data connection resumed the control connection's TLS session
    TlsSessionResumed,
}

/// Shared byte counters of the running transfer
///
/// Updated from the transfer socket and from writer worker threads.
#[derive(Debug)]
pub struct TransferStatus {
    total_size: AtomicI64,
    start_offset: AtomicU64,
    transferred: AtomicU64,
    made_progress: AtomicBool,
    active: AtomicBool,
}

impl TransferStatus {
    /// Create an inactive status with unknown size
    pub fn new() -> Self {
        Self {
            total_size: AtomicI64::new(-1),
            start_offset: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            made_progress: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    /// Start tracking a transfer
    pub fn init(&self, total_size: Option<u64>, start_offset: u64) {
        let total = total_size.map_or(-1, |size| i64::try_from(size).unwrap_or(i64::MAX));
        self.total_size.store(total, Ordering::Relaxed);
        self.start_offset.store(start_offset, Ordering::Relaxed);
        self.transferred.store(0, Ordering::Relaxed);
        self.made_progress.store(false, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }

    /// Record moved bytes
    pub fn update(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Mark that the transfer got past its first stall
    pub fn set_made_progress(&self) {
        self.made_progress.store(true, Ordering::Relaxed);
    }

    /// Stop tracking
    pub fn reset(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Bytes moved since [`TransferStatus::init`]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Absolute position: start offset plus transferred bytes
    pub fn current_offset(&self) -> u64 {
        self.start_offset.load(Ordering::Relaxed) + self.transferred()
    }

    /// Total size if known
    pub fn total_size(&self) -> Option<u64> {
        u64::try_from(self.total_size.load(Ordering::Relaxed)).ok()
    }

    /// Whether progress was made
    pub fn made_progress(&self) -> bool {
        self.made_progress.load(Ordering::Relaxed)
    }

    /// Whether a transfer is being tracked
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self::new()
    }
}
