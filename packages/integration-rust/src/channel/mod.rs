//! Message channel contracts and in-process implementations.
//!
//! - [`MessageChannel`]: `send` returns `Ok(false)` when the channel did not
//!   accept the envelope (full, timed out) and `Err` when a subscriber failed
//! - [`PollableChannel`]: adds blocking/timeout `receive`
//! - [`QueueChannel`], [`DirectChannel`], [`NullChannel`]: implementations
//! - [`ChannelRegistry`]: name-based lookup implementing [`ChannelResolver`]
//! - [`MeteredChannel`]: decorator feeding [`ChannelMetrics`](crate::management::ChannelMetrics)

pub mod direct;
pub mod metered;
pub mod queue;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;
use weft_core::Envelope;

pub use direct::DirectChannel;
pub use metered::MeteredChannel;
pub use queue::QueueChannel;
pub use registry::{ChannelRegistry, ChannelResolver};

/// Errors returned by [`MessageChannel::send_timeout`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel '{channel}' has no subscribers")]
    NoSubscribers { channel: String },
    #[error("handler subscribed to channel '{channel}' failed")]
    HandlerFailed {
        channel: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("channel '{channel}' is closed")]
    Closed { channel: String },
}

/// Downstream channel accepting envelopes.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Channel name, used for resolution and metrics labels.
    fn name(&self) -> &str;

    /// Sends `envelope`, waiting at most `timeout` for capacity.
    ///
    /// `None` waits indefinitely. Returns `Ok(false)` when the envelope was
    /// not accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when delivery to a subscriber failed.
    async fn send_timeout(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<bool, ChannelError>;

    /// Sends `envelope` without a timeout.
    ///
    /// # Errors
    ///
    /// See [`MessageChannel::send_timeout`].
    async fn send(&self, envelope: Envelope) -> Result<bool, ChannelError> {
        self.send_timeout(envelope, None).await
    }
}

/// Channel whose envelopes are pulled by consumers.
#[async_trait]
pub trait PollableChannel: MessageChannel {
    /// Waits up to `timeout` for the next envelope.
    async fn receive(&self, timeout: Duration) -> Option<Envelope>;

    /// Returns the next envelope if one is immediately available.
    fn try_receive(&self) -> Option<Envelope>;
}

/// Consumer of envelopes pushed by a [`DirectChannel`] or an adapter.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one envelope.
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// [`MessageHandler`] backed by a synchronous closure.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self.f)(envelope)
    }
}

/// Wraps a closure as a shared [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

/// Channel that accepts and drops everything.
#[derive(Debug, Clone)]
pub struct NullChannel {
    name: String,
}

impl NullChannel {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for NullChannel {
    fn default() -> Self {
        Self::new("nullChannel")
    }
}

#[async_trait]
impl MessageChannel for NullChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_timeout(
        &self,
        envelope: Envelope,
        _timeout: Option<Duration>,
    ) -> Result<bool, ChannelError> {
        trace!(channel = %self.name, id = %envelope.id(), "dropping envelope");
        Ok(true)
    }
}
