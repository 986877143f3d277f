//! Token bucket rate limiting shared by all data connections of an engine

use crate::layer::{would_block, Events, Layer, Pending};
use parking_lot::Mutex;
use std::io;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Buckets refill in steps of this length
const REFILL_INTERVAL: Duration = Duration::from_millis(50);
const REFILLS_PER_SECOND: u64 = 20;

/// Transfer direction seen from the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Data received from the peer
    Inbound,
    /// Data sent to the peer
    Outbound,
}

#[derive(Debug)]
struct Bucket {
    limit: Option<NonZeroU64>,
    tokens: u64,
    last_refill: Instant,
}

impl Bucket {
    fn new(limit: Option<NonZeroU64>) -> Self {
        Self {
            limit,
            tokens: limit.map_or(0, NonZeroU64::get),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let Some(limit) = self.limit else {
            return;
        };
        let elapsed = now.saturating_duration_since(self.last_refill);
        let steps = elapsed.as_millis() / REFILL_INTERVAL.as_millis();
        if steps == 0 {
            return;
        }
        let step = (limit.get() / REFILLS_PER_SECOND).max(1);
        let added = u64::try_from(steps).unwrap_or(u64::MAX).saturating_mul(step);
        self.tokens = self.tokens.saturating_add(added).min(limit.get());
        let advanced = u32::try_from(steps).unwrap_or(u32::MAX);
        self.last_refill += REFILL_INTERVAL.saturating_mul(advanced);
        if self.tokens == limit.get() {
            self.last_refill = now;
        }
    }
}

/// Per-direction token buckets
///
/// Capacity is one second worth of the limit and buckets start full, so a
/// short burst goes out unthrottled.
#[derive(Debug)]
pub struct RateLimiter {
    inbound: Mutex<Bucket>,
    outbound: Mutex<Bucket>,
}

impl RateLimiter {
    /// Limiter that never throttles
    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    /// Limit both directions in bytes per second; `None` is unlimited
    pub fn new(inbound: Option<NonZeroU64>, outbound: Option<NonZeroU64>) -> Self {
        Self {
            inbound: Mutex::new(Bucket::new(inbound)),
            outbound: Mutex::new(Bucket::new(outbound)),
        }
    }

    fn bucket(&self, direction: Direction) -> &Mutex<Bucket> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// Change the limit of one direction
    pub fn set_limit(&self, direction: Direction, limit: Option<NonZeroU64>) {
        *self.bucket(direction).lock() = Bucket::new(limit);
    }

    /// Current limit of one direction
    pub fn limit(&self, direction: Direction) -> Option<NonZeroU64> {
        self.bucket(direction).lock().limit
    }

    /// Take up to `wanted` tokens; returns how many were granted
    pub fn acquire(&self, direction: Direction, wanted: usize) -> usize {
        let mut bucket = self.bucket(direction).lock();
        if bucket.limit.is_none() {
            return wanted;
        }
        bucket.refill(Instant::now());
        let granted = bucket.tokens.min(wanted as u64);
        bucket.tokens -= granted;
        usize::try_from(granted).unwrap_or(wanted)
    }

    /// Return tokens that were granted but not used
    pub fn refund(&self, direction: Direction, unused: usize) {
        let mut bucket = self.bucket(direction).lock();
        if let Some(limit) = bucket.limit {
            bucket.tokens = bucket.tokens.saturating_add(unused as u64).min(limit.get());
        }
    }

    /// When the next tokens become available
    pub fn next_refill(&self, direction: Direction) -> Instant {
        let bucket = self.bucket(direction).lock();
        (bucket.last_refill + REFILL_INTERVAL).max(Instant::now())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Stage metering traffic through a [`RateLimiter`]
pub struct RateLimitedLayer {
    next: Box<dyn Layer>,
    limiter: Arc<RateLimiter>,
    read_until: Option<Instant>,
    write_until: Option<Instant>,
}

impl RateLimitedLayer {
    /// Meter traffic through `next`
    pub fn new(next: Box<dyn Layer>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            next,
            limiter,
            read_until: None,
            write_until: None,
        }
    }

    fn throttle(&mut self, direction: Direction) -> io::Error {
        let until = self.limiter.next_refill(direction);
        trace!(?direction, "Throttled until next refill");
        match direction {
            Direction::Inbound => self.read_until = Some(until),
            Direction::Outbound => self.write_until = Some(until),
        }
        would_block()
    }
}

impl Layer for RateLimitedLayer {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn next(&self) -> Option<&dyn Layer> {
        Some(self.next.as_ref())
    }

    fn next_mut(&mut self) -> Option<&mut dyn Layer> {
        Some(self.next.as_mut())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return self.next.read(buf);
        }
        let granted = self.limiter.acquire(Direction::Inbound, buf.len());
        if granted == 0 {
            return Err(self.throttle(Direction::Inbound));
        }
        let result = self.next.read(&mut buf[..granted]);
        let used = *result.as_ref().unwrap_or(&0);
        if used < granted {
            self.limiter.refund(Direction::Inbound, granted - used);
        }
        result
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return self.next.write(buf);
        }
        let granted = self.limiter.acquire(Direction::Outbound, buf.len());
        if granted == 0 {
            return Err(self.throttle(Direction::Outbound));
        }
        let result = self.next.write(&buf[..granted]);
        let used = *result.as_ref().unwrap_or(&0);
        if used < granted {
            self.limiter.refund(Direction::Outbound, granted - used);
        }
        result
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.next.shutdown()
    }

    fn pending(&self) -> Pending {
        let mut pending = self.next.pending();
        pending.read_at = self.read_until.or(pending.read_at);
        pending.write_at = self.write_until.or(pending.write_at);
        pending
    }

    fn on_events(&mut self, events: Events) {
        if events.read {
            self.read_until = None;
        }
        if events.write {
            self.write_until = None;
        }
        self.next.on_events(events);
    }
}
