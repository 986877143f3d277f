//! Engine services handed to readers and writers when they are opened

use ferroxfer_config::EngineOptions;
use ferroxfer_types::{DiscardNotifications, Notification, NotificationSink, TransferStatus};
use std::fmt;
use std::sync::Arc;

/// Options, transfer counters and the notification sink of one engine
///
/// Cheap to clone; all clones share the same status and sink.
#[derive(Clone)]
pub struct EngineContext {
    options: Arc<EngineOptions>,
    transfer_status: Arc<TransferStatus>,
    notifications: Arc<dyn NotificationSink>,
}

impl EngineContext {
    /// Create a context that discards notifications
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options: Arc::new(options),
            transfer_status: Arc::new(TransferStatus::new()),
            notifications: Arc::new(DiscardNotifications),
        }
    }

    /// Route notifications to `sink`
    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = sink;
        self
    }

    /// Engine options
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Counters of the running transfer
    pub fn transfer_status(&self) -> &Arc<TransferStatus> {
        &self.transfer_status
    }

    /// Queue a notification for higher layers
    pub fn notify(&self, notification: Notification) {
        self.notifications.notify(notification);
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("options", &self.options)
            .field("transfer_status", &self.transfer_status)
            .finish_non_exhaustive()
    }
}
