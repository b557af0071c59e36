//! Publishes an error envelope once retries for an operation are exhausted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info_span, warn, Instrument};
use weft_core::{headers, Envelope, FailurePayload};

use crate::channel::{ChannelError, ChannelResolver, MessageChannel};
use crate::config::RecoveryConfig;

/// Channel name used when no error channel is configured.
pub const DEFAULT_ERROR_CHANNEL_NAME: &str = "errorChannel";

/// State of a retried operation when its attempts ran out.
#[derive(Debug)]
pub struct RetryContext {
    pub last_error: anyhow::Error,
    pub retry_count: u32,
    pub failed_envelope: Option<Envelope>,
}

impl RetryContext {
    pub fn new(last_error: impl Into<anyhow::Error>, retry_count: u32) -> Self {
        Self {
            last_error: last_error.into(),
            retry_count,
            failed_envelope: None,
        }
    }

    #[must_use]
    pub fn with_failed_envelope(mut self, envelope: Envelope) -> Self {
        self.failed_envelope = Some(envelope);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("no error channel could be resolved (looked for '{name}')")]
    NoChannel { name: String },
    #[error("error channel '{channel}' did not accept the error envelope")]
    SendRejected { channel: String },
    #[error("failed to deliver error envelope")]
    Delivery(#[from] ChannelError),
}

/// Invoked by a retry framework when all attempts failed.
#[async_trait]
pub trait RecoveryCallback: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when recovery itself failed; it is not retried.
    async fn recover(&self, context: RetryContext) -> Result<(), RecoveryError>;
}

/// Builds the error envelope for an exhausted retry.
pub trait ErrorEnvelopeStrategy: Send + Sync {
    fn build(&self, context: &RetryContext) -> Envelope;
}

/// Wraps the last error in a [`FailurePayload`] and records the attempt count
/// in the `deliveryAttempt` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorEnvelopeStrategy;

impl ErrorEnvelopeStrategy for DefaultErrorEnvelopeStrategy {
    fn build(&self, context: &RetryContext) -> Envelope {
        let failure =
            FailurePayload::from_error(&*context.last_error, context.failed_envelope.clone());
        let mut builder = Envelope::builder(failure);
        if let Some(failed) = &context.failed_envelope {
            builder = builder.copy_headers(failed.headers());
        }
        builder
            .header(headers::DELIVERY_ATTEMPT, context.retry_count)
            .build()
    }
}

enum Target {
    Channel(Arc<dyn MessageChannel>),
    Name(String),
}

/// Sends error envelopes to a lazily resolved channel.
///
/// The target is, in order of precedence, an explicit channel, a channel
/// name looked up through the resolver, or [`DEFAULT_ERROR_CHANNEL_NAME`].
/// Resolution happens on the first recovery and the result is kept for the
/// life of the publisher.
pub struct ErrorRecoveryPublisher {
    target: Target,
    resolver: Option<Arc<dyn ChannelResolver>>,
    resolved: RwLock<Option<Arc<dyn MessageChannel>>>,
    strategy: Box<dyn ErrorEnvelopeStrategy>,
    send_timeout: Option<Duration>,
}

impl ErrorRecoveryPublisher {
    /// Publishes to `channel`.
    #[must_use]
    pub fn to_channel(channel: Arc<dyn MessageChannel>) -> Self {
        Self::with_target(Target::Channel(channel), None)
    }

    /// Publishes to the channel `name` (or the default error channel),
    /// resolved through `resolver`.
    #[must_use]
    pub fn to_channel_name(name: Option<String>, resolver: Arc<dyn ChannelResolver>) -> Self {
        let name = name.unwrap_or_else(|| DEFAULT_ERROR_CHANNEL_NAME.to_string());
        Self::with_target(Target::Name(name), Some(resolver))
    }

    /// Builds a name-resolving publisher from `config`.
    #[must_use]
    pub fn from_config(config: &RecoveryConfig, resolver: Arc<dyn ChannelResolver>) -> Self {
        Self::to_channel_name(config.error_channel.clone(), resolver)
            .with_send_timeout(config.send_timeout())
    }

    fn with_target(target: Target, resolver: Option<Arc<dyn ChannelResolver>>) -> Self {
        Self {
            target,
            resolver,
            resolved: RwLock::new(None),
            strategy: Box::new(DefaultErrorEnvelopeStrategy),
            send_timeout: None,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: impl ErrorEnvelopeStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    fn channel(&self) -> Result<Arc<dyn MessageChannel>, RecoveryError> {
        if let Some(channel) = self.resolved.read().as_ref() {
            return Ok(Arc::clone(channel));
        }
        let mut resolved = self.resolved.write();
        if let Some(channel) = resolved.as_ref() {
            return Ok(Arc::clone(channel));
        }
        let channel = match &self.target {
            Target::Channel(channel) => Arc::clone(channel),
            Target::Name(name) => self
                .resolver
                .as_ref()
                .and_then(|r| r.resolve(name))
                .ok_or_else(|| RecoveryError::NoChannel { name: name.clone() })?,
        };
        *resolved = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Builds the error envelope for `context` and sends it.
    ///
    /// # Errors
    ///
    /// See [`RecoveryError`]. A failed send is returned, not retried.
    pub async fn publish(&self, context: &RetryContext) -> Result<(), RecoveryError> {
        let channel = self.channel()?;
        let envelope = self.strategy.build(context);
        let span = info_span!("recover", channel = %channel.name(), attempts = context.retry_count);
        let accepted = channel
            .send_timeout(envelope, self.send_timeout)
            .instrument(span)
            .await?;
        if accepted {
            Ok(())
        } else {
            warn!(channel = %channel.name(), "error channel rejected the error envelope");
            Err(RecoveryError::SendRejected {
                channel: channel.name().to_string(),
            })
        }
    }
}

impl std::fmt::Debug for ErrorRecoveryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match &self.target {
            Target::Channel(channel) => channel.name(),
            Target::Name(name) => name.as_str(),
        };
        f.debug_struct("ErrorRecoveryPublisher")
            .field("target", &target)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RecoveryCallback for ErrorRecoveryPublisher {
    async fn recover(&self, context: RetryContext) -> Result<(), RecoveryError> {
        self.publish(&context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{handler_fn, ChannelRegistry, DirectChannel, PollableChannel, QueueChannel};
    use weft_core::HeaderValue;

    fn context() -> RetryContext {
        let failed = Envelope::builder("payload").correlation_id("K").build();
        RetryContext::new(anyhow::anyhow!("disk full").context("write failed"), 3)
            .with_failed_envelope(failed)
    }

    #[tokio::test]
    async fn default_strategy_wraps_last_error() {
        let errors = Arc::new(QueueChannel::new("errors", 4));
        let publisher = ErrorRecoveryPublisher::to_channel(errors.clone());

        publisher.recover(context()).await.unwrap();

        let envelope = errors.try_receive().unwrap();
        assert_eq!(envelope.header(headers::DELIVERY_ATTEMPT), Some(&HeaderValue::from(3u32)));
        assert_eq!(envelope.header(headers::CORRELATION_ID), Some(&HeaderValue::from("K")));
        let failure = envelope.payload().as_failure().unwrap();
        assert_eq!(failure.description, "write failed");
        assert_eq!(failure.root_cause, "disk full");
        assert!(failure.failed_envelope.is_some());
    }

    #[tokio::test]
    async fn resolves_default_name_lazily_and_caches() {
        let registry = Arc::new(ChannelRegistry::new());
        let publisher = ErrorRecoveryPublisher::to_channel_name(None, registry.clone());

        let err = publisher.publish(&context()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::NoChannel { name } if name == "errorChannel"));

        let first = Arc::new(QueueChannel::new(DEFAULT_ERROR_CHANNEL_NAME, 4));
        registry.register(first.clone());
        publisher.publish(&context()).await.unwrap();
        assert!(first.try_receive().is_some());

        // Later registrations do not change the cached target.
        let second = Arc::new(QueueChannel::new(DEFAULT_ERROR_CHANNEL_NAME, 4));
        registry.register(second.clone());
        publisher.publish(&context()).await.unwrap();
        assert!(first.try_receive().is_some());
        assert!(second.try_receive().is_none());
    }

    #[tokio::test]
    async fn named_channel_from_config() {
        let registry = Arc::new(ChannelRegistry::new());
        let failures = Arc::new(QueueChannel::new("failures", 1));
        registry.register(failures.clone());
        let config = RecoveryConfig {
            error_channel: Some("failures".to_string()),
            send_timeout_ms: Some(0),
        };
        let publisher = ErrorRecoveryPublisher::from_config(&config, registry);

        publisher.publish(&context()).await.unwrap();
        let err = publisher.publish(&context()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::SendRejected { channel } if channel == "failures"));
    }

    #[tokio::test]
    async fn delivery_failure_surfaces() {
        let direct = DirectChannel::new("errors");
        direct.subscribe(handler_fn(|_| Err(anyhow::anyhow!("sink down"))));
        let publisher = ErrorRecoveryPublisher::to_channel(Arc::new(direct));

        let err = publisher.recover(context()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Delivery(ChannelError::HandlerFailed { .. })));
    }

    #[tokio::test]
    async fn custom_strategy() {
        struct Plain;
        impl ErrorEnvelopeStrategy for Plain {
            fn build(&self, context: &RetryContext) -> Envelope {
                Envelope::new(context.last_error.to_string())
            }
        }

        let errors = Arc::new(QueueChannel::new("errors", 4));
        let publisher = ErrorRecoveryPublisher::to_channel(errors.clone()).with_strategy(Plain);
        publisher.recover(context()).await.unwrap();
        assert_eq!(
            errors.try_receive().unwrap().payload(),
            &weft_core::Payload::from("write failed")
        );
    }
}
