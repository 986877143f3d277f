//! Engine-wide services used by data connections

use crate::activity::ActivityLogger;
use crate::ports::PortAllocator;
use crate::rate_limit::RateLimiter;
use ferroxfer_config::EngineOptions;
use ferroxfer_io::EngineContext;
use std::sync::Arc;

/// Everything a transfer socket borrows from its engine
///
/// Clones share the limiter, counters and port cursor.
#[derive(Debug, Clone)]
pub struct NetworkContext {
    engine: EngineContext,
    rate_limiter: Arc<RateLimiter>,
    activity: Arc<ActivityLogger>,
    ports: Arc<PortAllocator>,
}

impl NetworkContext {
    /// Unlimited context around `engine`
    pub fn new(engine: EngineContext) -> Self {
        Self {
            engine,
            rate_limiter: Arc::new(RateLimiter::unlimited()),
            activity: Arc::new(ActivityLogger::new()),
            ports: Arc::new(PortAllocator::new()),
        }
    }

    /// Share `limiter` with other engines
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Reader/writer services
    pub fn engine(&self) -> &EngineContext {
        &self.engine
    }

    /// Engine options
    pub fn options(&self) -> &EngineOptions {
        self.engine.options()
    }

    /// Rate limiter applied to all data connections
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Byte counters of all data connections
    pub fn activity(&self) -> &Arc<ActivityLogger> {
        &self.activity
    }

    /// Active mode port cursor
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }
}

impl Default for NetworkContext {
    fn default() -> Self {
        Self::new(EngineContext::default())
    }
}
