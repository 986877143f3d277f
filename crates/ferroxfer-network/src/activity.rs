//! Byte accounting for data connections

use crate::layer::{Layer, Pending};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters of bytes moved over all data connections of an engine
#[derive(Debug, Default)]
pub struct ActivityLogger {
    received: AtomicU64,
    sent: AtomicU64,
}

impl ActivityLogger {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bytes` received
    pub fn record_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record `bytes` sent
    pub fn record_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes received since the last [`ActivityLogger::take`]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Bytes sent since the last [`ActivityLogger::take`]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Return `(received, sent)` and reset both counters
    pub fn take(&self) -> (u64, u64) {
        (
            self.received.swap(0, Ordering::Relaxed),
            self.sent.swap(0, Ordering::Relaxed),
        )
    }
}

/// Stage feeding an [`ActivityLogger`]
pub struct ActivityLayer {
    next: Box<dyn Layer>,
    logger: Arc<ActivityLogger>,
}

impl ActivityLayer {
    /// Account for traffic through `next`
    pub fn new(next: Box<dyn Layer>, logger: Arc<ActivityLogger>) -> Self {
        Self { next, logger }
    }
}

impl Layer for ActivityLayer {
    fn name(&self) -> &'static str {
        "activity"
    }

    fn next(&self) -> Option<&dyn Layer> {
        Some(self.next.as_ref())
    }

    fn next_mut(&mut self) -> Option<&mut dyn Layer> {
        Some(self.next.as_mut())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.next.read(buf)?;
        self.logger.record_received(n as u64);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.next.write(buf)?;
        self.logger.record_sent(n as u64);
        Ok(n)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.next.shutdown()
    }

    fn pending(&self) -> Pending {
        self.next.pending()
    }
}
