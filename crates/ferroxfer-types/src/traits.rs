//! Collaborator traits
//!
//! Readers and writers talk to their owner through [`AioHandler`]; the
//! engine reports asynchronous notifications through [`NotificationSink`].
//! Both are fire-and-forget: neither waits for the recipient.

use crate::{AioEvent, Notification};

/// Recipient of reader/writer readiness events
///
/// Called from worker threads with the ring mutex held, so implementations
/// must only enqueue and never call back into the emitting object.
pub trait AioHandler: Send + Sync {
    /// Deliver a readiness event
    fn on_aio_event(&self, event: AioEvent);
}

/// Recipient of engine notifications
pub trait NotificationSink: Send + Sync {
    /// Queue a notification for higher layers
    fn notify(&self, notification: Notification);
}

#[cfg(feature = "async")]
impl AioHandler for tokio::sync::mpsc::UnboundedSender<AioEvent> {
    fn on_aio_event(&self, event: AioEvent) {
        // Receiver gone means the owner already went away
        let _ = self.send(event);
    }
}

#[cfg(feature = "async")]
impl NotificationSink for tokio::sync::mpsc::UnboundedSender<Notification> {
    fn notify(&self, notification: Notification) {
        let _ = self.send(notification);
    }
}

/// Sink that drops every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardNotifications;

impl NotificationSink for DiscardNotifications {
    fn notify(&self, _notification: Notification) {}
}

#[cfg(all(test, feature = "async"))]
mod tests {
    use super::*;
    use crate::AioId;

    #[tokio::test]
    async fn test_channel_handler_delivers_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let id = AioId::next();
        tx.on_aio_event(AioEvent::WriteReady(id));
        assert_eq!(rx.recv().await, Some(AioEvent::WriteReady(id)));
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Notification>();
        drop(rx);
        tx.notify(Notification::TlsSessionResumed);
    }
}
