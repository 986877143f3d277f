//! Ring cursor shared between a worker thread and the event loop
//!
//! Both sides hold the same mutex while they touch the cursor. The slot a
//! side is currently filling or draining is taken out of the arena, so the
//! blocking syscall runs with the lock released.

use crate::arena::{Arena, SharedMemoryInfo};
use ferroxfer_types::{AioEvent, AioHandler, AioId};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// Cursor and flags guarded by [`AioShared::state`]
pub(crate) struct AioState {
    pub arena: Arena,
    /// Oldest ready slot
    pub ready_pos: usize,
    /// Number of ready slots starting at `ready_pos`
    pub ready_count: usize,
    /// Consumer currently owns a slot
    pub processing: bool,
    pub quit: bool,
    pub error: bool,
    /// Consumer saw `Wait` and expects an event
    pub handler_waiting: bool,
    pub handler: Option<Arc<dyn AioHandler>>,
}

impl AioState {
    /// First slot past the ready range
    pub fn free_pos(&self) -> usize {
        (self.ready_pos + self.ready_count) % self.arena.len()
    }

    pub fn is_full(&self) -> bool {
        self.ready_count >= self.arena.len()
    }

    pub fn reset_cursor(&mut self) {
        self.ready_pos = 0;
        self.ready_count = 0;
        self.processing = false;
        self.handler_waiting = false;
    }
}

/// State shared by a reader or writer and its worker thread
pub(crate) struct AioShared {
    pub id: AioId,
    pub name: String,
    pub state: Mutex<AioState>,
    pub cond: Condvar,
}

impl AioShared {
    pub fn new(name: &str, arena: Arena, handler: Option<Arc<dyn AioHandler>>) -> Arc<Self> {
        Arc::new(Self {
            id: AioId::next(),
            name: name.to_string(),
            state: Mutex::new(AioState {
                arena,
                ready_pos: 0,
                ready_count: 0,
                processing: false,
                quit: false,
                error: false,
                handler_waiting: false,
                handler,
            }),
            cond: Condvar::new(),
        })
    }

    /// Send `event` if the consumer is waiting for one
    ///
    /// Must be called after the ring mutation it reports, under the same
    /// lock, so a consumer that just saw `Wait` cannot miss it.
    pub fn wake_handler(state: &mut AioState, event: AioEvent) {
        if state.handler_waiting {
            state.handler_waiting = false;
            if let Some(handler) = &state.handler {
                handler.on_aio_event(event);
            }
        }
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn AioHandler>>) {
        self.state.lock().handler = handler;
    }

    pub fn shared_memory_info(&self) -> Option<SharedMemoryInfo> {
        self.state.lock().arena.shared_memory_info()
    }

    /// Ask the worker to stop and wake it
    pub fn request_quit(&self) {
        let mut state = self.state.lock();
        state.quit = true;
        self.cond.notify_all();
    }
}

impl fmt::Debug for AioShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioShared")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
