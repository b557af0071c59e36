//! Point-to-point channel that invokes a subscribed handler on the sender's task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use weft_core::Envelope;

use super::{ChannelError, MessageChannel, MessageHandler};

/// Synchronous hand-off channel.
///
/// Each send is delivered to exactly one subscriber, chosen round-robin. A
/// handler failure is returned to the sender as
/// [`ChannelError::HandlerFailed`]. The send timeout is ignored because there
/// is no buffer to wait on.
pub struct DirectChannel {
    name: String,
    subscribers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    next: AtomicUsize,
}

impl DirectChannel {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Adds a subscriber.
    pub fn subscribe(&self, handler: Arc<dyn MessageHandler>) {
        self.subscribers.write().push(handler);
    }

    /// Removes a subscriber by identity. Returns `true` if it was subscribed.
    pub fn unsubscribe(&self, handler: &Arc<dyn MessageHandler>) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|h| !Arc::ptr_eq(h, handler));
        subscribers.len() != before
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn next_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        let subscribers = self.subscribers.read();
        if subscribers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % subscribers.len();
        Some(Arc::clone(&subscribers[index]))
    }
}

impl std::fmt::Debug for DirectChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectChannel")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageChannel for DirectChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_timeout(
        &self,
        envelope: Envelope,
        _timeout: Option<Duration>,
    ) -> Result<bool, ChannelError> {
        // The read guard must be released before awaiting the handler.
        let handler = self.next_handler().ok_or_else(|| ChannelError::NoSubscribers {
            channel: self.name.clone(),
        })?;
        handler
            .handle(envelope)
            .await
            .map_err(|source| ChannelError::HandlerFailed {
                channel: self.name.clone(),
                source,
            })?;
        Ok(true)
    }
}
