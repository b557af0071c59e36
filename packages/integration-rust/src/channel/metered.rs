//! Channel decorator that records send/receive metrics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use weft_core::Envelope;

use super::{ChannelError, MessageChannel, PollableChannel};
use crate::management::ChannelMetrics;

/// Wraps a channel and feeds every send and receive into a [`ChannelMetrics`].
///
/// A send counts as successful only when the inner channel returned
/// `Ok(true)`.
#[derive(Debug)]
pub struct MeteredChannel<C> {
    inner: C,
    metrics: Arc<ChannelMetrics>,
}

impl<C: MessageChannel> MeteredChannel<C> {
    /// Wraps `inner` with fresh metrics named after it.
    pub fn new(inner: C) -> Self {
        let metrics = Arc::new(ChannelMetrics::new(inner.name()));
        Self { inner, metrics }
    }

    /// Wraps `inner` with existing (possibly shared) metrics.
    pub fn with_metrics(inner: C, metrics: Arc<ChannelMetrics>) -> Self {
        Self { inner, metrics }
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: MessageChannel> MessageChannel for MeteredChannel<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send_timeout(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<bool, ChannelError> {
        let ctx = self.metrics.before_send();
        let result = self.inner.send_timeout(envelope, timeout).await;
        self.metrics.after_send(ctx, matches!(result, Ok(true)));
        result
    }
}

#[async_trait]
impl<C: PollableChannel> PollableChannel for MeteredChannel<C> {
    async fn receive(&self, timeout: Duration) -> Option<Envelope> {
        let received = self.inner.receive(timeout).await;
        if received.is_some() {
            self.metrics.after_receive();
        }
        received
    }

    fn try_receive(&self) -> Option<Envelope> {
        let received = self.inner.try_receive();
        if received.is_some() {
            self.metrics.after_receive();
        }
        received
    }
}
