//! Async façade over [`BarrierStore`] that routes groups to channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use weft_core::{
    headers, ClockSource, CorrelationError, CorrelationStrategy, Envelope, EnvelopeBuilder,
    FailurePayload, HeaderValue, Payload,
};

use super::store::{Arrival, BarrierStore, ExpiredGroup, ReleasedGroup, Swept};
use crate::channel::{ChannelError, MessageChannel, MessageHandler};
use crate::config::AggregatorConfig;

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    #[error("channel '{channel}' did not accept the envelope")]
    NotAccepted { channel: String },
    #[error("failed to deliver to channel")]
    Channel(#[from] ChannelError),
    /// A released group could not be sent to the output channel nor routed
    /// to the error channel. The group envelope is returned intact.
    #[error("released group '{key}' was not delivered")]
    Undelivered {
        key: HeaderValue,
        group: Box<Envelope>,
        source: Box<AggregatorError>,
    },
}

/// What happened to one envelope passed to [`CorrelatingHandler::on_envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Stored; the group is still incomplete.
    Pending { key: HeaderValue, size: usize },
    /// Completed the group, which was sent to the output channel.
    Released { key: HeaderValue, size: usize },
    /// Already held by the group.
    Duplicate { key: HeaderValue },
    /// Arrived after its group left the store; sent to the discard channel.
    Late { key: HeaderValue },
    /// Had no correlation key; sent to the discard channel.
    Discarded,
    /// The release strategy failed, or the released group could not be sent
    /// to the output channel; the group went to the error channel.
    Failed { key: HeaderValue },
}

/// Counts from one timeout sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Aggregates envelopes into groups and sends completed groups downstream.
///
/// Released groups go to the output channel as a single envelope whose
/// payload is [`Payload::Group`] and whose `correlationId` header holds the
/// key. Timed-out groups go to the discard channel, or to the output channel
/// when partial results are enabled.
pub struct CorrelatingHandler {
    store: Arc<BarrierStore>,
    correlation: CorrelationStrategy,
    output: Arc<dyn MessageChannel>,
    discard: Option<Arc<dyn MessageChannel>>,
    errors: Option<Arc<dyn MessageChannel>>,
    send_timeout: Option<Duration>,
    group_timeout: Duration,
    send_partial_result_on_timeout: bool,
}

impl CorrelatingHandler {
    pub fn new(store: Arc<BarrierStore>, output: Arc<dyn MessageChannel>) -> Self {
        let defaults = AggregatorConfig::default();
        Self {
            store,
            correlation: CorrelationStrategy::default(),
            output,
            discard: None,
            errors: None,
            send_timeout: defaults.send_timeout(),
            group_timeout: defaults.group_timeout(),
            send_partial_result_on_timeout: false,
        }
    }

    /// Builds the store and handler described by `config`.
    pub fn from_config(
        config: &AggregatorConfig,
        output: Arc<dyn MessageChannel>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let store = BarrierStore::new(config.release.to_strategy(), clock)
            .with_container(config.container)
            .with_tracked_key_capacity(config.tracked_key_capacity);
        Self::new(Arc::new(store), output)
            .with_correlation_strategy(CorrelationStrategy::header(&config.correlation_header))
            .with_send_timeout(config.send_timeout())
            .with_group_timeout(config.group_timeout())
            .with_partial_result_on_timeout(config.send_partial_result_on_timeout)
    }

    #[must_use]
    pub fn with_correlation_strategy(mut self, strategy: CorrelationStrategy) -> Self {
        self.correlation = strategy;
        self
    }

    #[must_use]
    pub fn with_discard_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.discard = Some(channel);
        self
    }

    #[must_use]
    pub fn with_error_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.errors = Some(channel);
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_group_timeout(mut self, timeout: Duration) -> Self {
        self.group_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_partial_result_on_timeout(mut self, enabled: bool) -> Self {
        self.send_partial_result_on_timeout = enabled;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<BarrierStore> {
        &self.store
    }

    #[must_use]
    pub fn group_timeout(&self) -> Duration {
        self.group_timeout
    }

    /// Correlates `envelope` and sends its group downstream if it completed.
    ///
    /// # Errors
    ///
    /// - [`AggregatorError::Correlation`] for a missing key with no discard
    ///   channel, or a release strategy failure with no error channel.
    /// - [`AggregatorError::Undelivered`] when a released group could not be
    ///   sent to the output channel nor to the error channel.
    /// - [`AggregatorError::NotAccepted`] / [`AggregatorError::Channel`] when
    ///   a discard send fails.
    pub async fn on_envelope(&self, envelope: Envelope) -> Result<Disposition, AggregatorError> {
        let Some(key) = self.correlation.correlation_key(&envelope) else {
            return self.discard_keyless(envelope).await;
        };

        match self.store.on_envelope(key, envelope) {
            Ok(Arrival::Pending { key, size }) => {
                debug!(correlation_key = %key, size, "envelope added to group");
                Ok(Disposition::Pending { key, size })
            }
            Ok(Arrival::Duplicate { key }) => Ok(Disposition::Duplicate { key }),
            Ok(Arrival::Released(group)) => self.release(group).await,
            Ok(Arrival::Late { key, envelope }) => {
                match &self.discard {
                    Some(discard) => self.deliver(&**discard, *envelope).await?,
                    None => warn!(correlation_key = %key, "late arrival dropped, no discard channel"),
                }
                Ok(Disposition::Late { key })
            }
            Err(err @ CorrelationError::ReleaseStrategy { .. }) => self.route_failure(err).await,
            Err(err) => Err(err.into()),
        }
    }

    async fn discard_keyless(&self, envelope: Envelope) -> Result<Disposition, AggregatorError> {
        let Some(discard) = &self.discard else {
            return Err(CorrelationError::KeyMissing {
                envelope_id: envelope.id(),
                source_name: self.correlation.describe(),
                envelope: Box::new(envelope),
            }
            .into());
        };
        debug!(id = %envelope.id(), "no correlation key, discarding");
        self.deliver(&**discard, envelope).await?;
        Ok(Disposition::Discarded)
    }

    async fn release(&self, group: ReleasedGroup) -> Result<Disposition, AggregatorError> {
        let key = group.key.clone();
        let size = group.members.len();
        let envelope = group_envelope(group);
        match self.deliver(&*self.output, envelope.clone()).await {
            Ok(()) => {
                debug!(correlation_key = %key, size, "group released");
                Ok(Disposition::Released { key, size })
            }
            Err(source) => self.route_undelivered(key, envelope, source).await,
        }
    }

    async fn route_undelivered(
        &self,
        key: HeaderValue,
        group: Envelope,
        source: AggregatorError,
    ) -> Result<Disposition, AggregatorError> {
        warn!(correlation_key = %key, error = %source, "released group not delivered");
        if let Some(errors) = &self.errors {
            let failure = Envelope::builder(FailurePayload::from_error(&source, Some(group.clone())))
                .correlation_id(key.clone())
                .build();
            match self.deliver(&**errors, failure).await {
                Ok(()) => return Ok(Disposition::Failed { key }),
                Err(e) => warn!(correlation_key = %key, error = %e, "error channel rejected undelivered group"),
            }
        }
        Err(AggregatorError::Undelivered {
            key,
            group: Box::new(group),
            source: Box::new(source),
        })
    }

    async fn route_failure(&self, err: CorrelationError) -> Result<Disposition, AggregatorError> {
        let Some(errors) = &self.errors else {
            return Err(err.into());
        };
        let (key, failed) = match &err {
            CorrelationError::ReleaseStrategy { key, members, source } => {
                warn!(correlation_key = %key, error = %source, "release strategy failed, discarding group");
                let failed = group_envelope(ReleasedGroup {
                    key: key.clone(),
                    members: members.clone(),
                });
                (key.clone(), failed)
            }
            _ => return Err(err.into()),
        };
        let failure = Envelope::builder(FailurePayload::from_error(&err, Some(failed)))
            .correlation_id(key.clone())
            .build();
        self.deliver(&**errors, failure).await?;
        Ok(Disposition::Failed { key })
    }

    async fn deliver(
        &self,
        channel: &dyn MessageChannel,
        envelope: Envelope,
    ) -> Result<(), AggregatorError> {
        if channel.send_timeout(envelope, self.send_timeout).await? {
            Ok(())
        } else {
            Err(AggregatorError::NotAccepted {
                channel: channel.name().to_string(),
            })
        }
    }

    /// Evicts groups older than the configured group timeout.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_older_than(self.group_timeout).await
    }

    /// Evicts groups older than `threshold`.
    ///
    /// Released groups that cannot be delivered and strategy failures are
    /// routed to the error channel and counted as failed. Anything that cannot
    /// be routed is logged; the groups have already left the store.
    pub async fn sweep_older_than(&self, threshold: Duration) -> SweepReport {
        let threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        let mut report = SweepReport::default();
        for swept in self.store.expire_stale(threshold_ms) {
            match swept {
                Swept::Released(group) => match self.release(group).await {
                    Ok(Disposition::Released { .. }) => report.released += 1,
                    Ok(_) => report.failed += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(error = %e, "released group lost during sweep");
                    }
                },
                Swept::Expired(group) => {
                    report.expired += 1;
                    self.route_expired(group).await;
                }
                Swept::Failed { key, members, source } => {
                    report.failed += 1;
                    let err = CorrelationError::ReleaseStrategy { key, members, source };
                    if let Err(e) = self.route_failure(err).await {
                        warn!(error = %e, "strategy failure lost during sweep");
                    }
                }
            }
        }
        if report != SweepReport::default() {
            info!(
                released = report.released,
                expired = report.expired,
                failed = report.failed,
                "barrier sweep finished"
            );
        }
        report
    }

    async fn route_expired(&self, group: ExpiredGroup) {
        let key = group.key.clone();
        debug!(correlation_key = %key, size = group.members.len(), age_ms = group.age_ms, "group timed out");
        let builder = group_builder(ReleasedGroup {
            key: group.key,
            members: group.members,
        });
        let (target, envelope) = if self.send_partial_result_on_timeout {
            let partial = builder.header(headers::PARTIAL_RESULT, true).build();
            (Some(&self.output), partial)
        } else {
            (self.discard.as_ref(), builder.build())
        };
        let Some(target) = target else {
            warn!(correlation_key = %key, "timed-out group dropped, no discard channel");
            return;
        };
        if let Err(e) = self.deliver(&**target, envelope).await {
            warn!(correlation_key = %key, error = %e, "failed to send timed-out group");
        }
    }
}

fn group_builder(group: ReleasedGroup) -> EnvelopeBuilder {
    Envelope::builder(Payload::Group(group.members)).header(headers::CORRELATION_ID, group.key)
}

fn group_envelope(group: ReleasedGroup) -> Envelope {
    group_builder(group).build()
}

impl std::fmt::Debug for CorrelatingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelatingHandler")
            .field("store", &self.store)
            .field("correlation", &self.correlation)
            .field("output", &self.output.name())
            .field("group_timeout", &self.group_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageHandler for CorrelatingHandler {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.on_envelope(envelope).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use weft_core::{ManualClock, ReleaseStrategy};

    use super::*;
    use crate::channel::{PollableChannel, QueueChannel};

    struct Fixture {
        handler: CorrelatingHandler,
        output: Arc<QueueChannel>,
        discard: Arc<QueueChannel>,
        errors: Arc<QueueChannel>,
        clock: Arc<ManualClock>,
    }

    fn fixture(release: ReleaseStrategy) -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let output = Arc::new(QueueChannel::new("output", 16));
        let discard = Arc::new(QueueChannel::new("discard", 16));
        let errors = Arc::new(QueueChannel::new("errors", 16));
        let store = Arc::new(BarrierStore::new(release, clock.clone()));
        let handler = CorrelatingHandler::new(store, output.clone())
            .with_discard_channel(discard.clone())
            .with_error_channel(errors.clone())
            .with_group_timeout(Duration::from_millis(100));
        Fixture {
            handler,
            output,
            discard,
            errors,
            clock,
        }
    }

    fn keyed(key: &str, body: &str) -> Envelope {
        Envelope::builder(body).correlation_id(key).build()
    }

    #[tokio::test]
    async fn three_members_release_one_group() {
        let f = fixture(ReleaseStrategy::FixedSize(3));
        for body in ["a", "b"] {
            let d = f.handler.on_envelope(keyed("K1", body)).await.unwrap();
            assert!(matches!(d, Disposition::Pending { .. }));
        }
        let d = f.handler.on_envelope(keyed("K1", "c")).await.unwrap();
        assert_eq!(
            d,
            Disposition::Released {
                key: HeaderValue::from("K1"),
                size: 3
            }
        );

        let group = f.output.try_receive().unwrap();
        assert_eq!(group.header(headers::CORRELATION_ID), Some(&HeaderValue::from("K1")));
        let members = group.payload().as_group().unwrap();
        let bodies: Vec<_> = members.iter().map(|m| m.payload().clone()).collect();
        assert_eq!(bodies, vec![Payload::from("a"), Payload::from("b"), Payload::from("c")]);
        assert!(f.output.try_receive().is_none());
        assert!(!f.handler.store().contains(&HeaderValue::from("K1")));
    }

    #[tokio::test]
    async fn timed_out_group_goes_to_discard() {
        let f = fixture(ReleaseStrategy::FixedSize(3));
        f.handler.on_envelope(keyed("K2", "only")).await.unwrap();

        f.clock.advance(101);
        let report = f.handler.sweep().await;

        assert_eq!(
            report,
            SweepReport {
                released: 0,
                expired: 1,
                failed: 0
            }
        );
        assert!(f.output.try_receive().is_none());
        let expired = f.discard.try_receive().unwrap();
        assert_eq!(expired.payload().as_group().unwrap().len(), 1);
        assert!(f.handler.store().is_empty());
    }

    #[tokio::test]
    async fn partial_results_go_to_output() {
        let f = fixture(ReleaseStrategy::FixedSize(3));
        let handler = f.handler.with_partial_result_on_timeout(true);
        handler.on_envelope(keyed("K", "a")).await.unwrap();
        f.clock.advance(500);

        handler.sweep().await;
        let partial = f.output.try_receive().unwrap();
        assert_eq!(partial.payload().as_group().unwrap().len(), 1);
        assert_eq!(
            partial.header(headers::PARTIAL_RESULT),
            Some(&HeaderValue::Bool(true))
        );
        assert!(f.discard.try_receive().is_none());
    }

    #[tokio::test]
    async fn missing_key_is_discarded_or_rejected() {
        let f = fixture(ReleaseStrategy::FixedSize(3));
        let d = f.handler.on_envelope(Envelope::new("orphan")).await.unwrap();
        assert_eq!(d, Disposition::Discarded);
        assert!(f.discard.try_receive().is_some());

        let store = Arc::new(BarrierStore::new(
            ReleaseStrategy::FixedSize(3),
            Arc::new(ManualClock::new(0)),
        ));
        let strict = CorrelatingHandler::new(store, Arc::new(QueueChannel::new("out", 1)));
        let err = strict.on_envelope(Envelope::new("orphan")).await.unwrap_err();
        assert!(matches!(
            err,
            AggregatorError::Correlation(CorrelationError::KeyMissing { .. })
        ));
    }

    #[tokio::test]
    async fn strategy_failure_goes_to_error_channel() {
        let f = fixture(ReleaseStrategy::SequenceSize);
        let d = f.handler.on_envelope(keyed("K", "no size")).await.unwrap();
        assert_eq!(d, Disposition::Failed { key: HeaderValue::from("K") });

        let error = f.errors.receive(Duration::from_millis(50)).await.unwrap();
        let failure = error.payload().as_failure().unwrap();
        assert_eq!(failure.root_cause, "member is missing a valid sequenceSize header");
        let failed = failure.failed_envelope.as_ref().unwrap();
        assert_eq!(failed.payload().as_group().unwrap().len(), 1);
        assert!(f.handler.store().is_empty());
    }

    #[tokio::test]
    async fn late_arrival_goes_to_discard() {
        let f = fixture(ReleaseStrategy::FixedSize(1));
        f.handler.on_envelope(keyed("K", "a")).await.unwrap();
        let d = f.handler.on_envelope(keyed("K", "b")).await.unwrap();
        assert_eq!(d, Disposition::Late { key: HeaderValue::from("K") });
        assert_eq!(f.discard.try_receive().unwrap().payload(), &Payload::from("b"));
    }

    #[tokio::test]
    async fn undelivered_group_is_returned_without_error_channel() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(BarrierStore::new(ReleaseStrategy::FixedSize(1), clock));
        let output = Arc::new(QueueChannel::new("tiny", 1));
        let handler = CorrelatingHandler::new(store, output.clone())
            .with_send_timeout(Some(Duration::ZERO));

        handler.on_envelope(keyed("a", "1")).await.unwrap();
        let err = handler.on_envelope(keyed("b", "2")).await.unwrap_err();
        let AggregatorError::Undelivered { key, group, source } = err else {
            panic!("expected undelivered group");
        };
        assert_eq!(key, HeaderValue::from("b"));
        let members = group.payload().as_group().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].payload(), &Payload::from("2"));
        assert!(matches!(*source, AggregatorError::NotAccepted { channel } if channel == "tiny"));
    }

    #[tokio::test]
    async fn undelivered_group_goes_to_error_channel() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(BarrierStore::new(ReleaseStrategy::FixedSize(3), clock));
        let output = Arc::new(QueueChannel::new("full", 1));
        let errors = Arc::new(QueueChannel::new("errors", 4));
        assert!(output.send(Envelope::new("blocker")).await.unwrap());
        let handler = CorrelatingHandler::new(store, output.clone())
            .with_error_channel(errors.clone())
            .with_send_timeout(Some(Duration::ZERO));

        for body in ["a", "b"] {
            handler.on_envelope(keyed("K", body)).await.unwrap();
        }
        let d = handler.on_envelope(keyed("K", "c")).await.unwrap();
        assert_eq!(d, Disposition::Failed { key: HeaderValue::from("K") });

        let error = errors.try_receive().unwrap();
        assert_eq!(error.header(headers::CORRELATION_ID), Some(&HeaderValue::from("K")));
        let failure = error.payload().as_failure().unwrap();
        let failed = failure.failed_envelope.as_ref().unwrap();
        let bodies: Vec<_> = failed
            .payload()
            .as_group()
            .unwrap()
            .iter()
            .map(|m| m.payload().clone())
            .collect();
        assert_eq!(bodies, vec![Payload::from("a"), Payload::from("b"), Payload::from("c")]);
        assert_eq!(output.try_receive().unwrap().payload(), &Payload::from("blocker"));
        assert!(output.try_receive().is_none());
    }

    #[tokio::test]
    async fn sweep_routes_strategy_failure_to_error_channel() {
        let clock = Arc::new(ManualClock::new(0));
        let strategy_clock = Arc::clone(&clock);
        let release = ReleaseStrategy::predicate(move |_| {
            if strategy_clock.now() > 50 {
                anyhow::bail!("release window closed");
            }
            Ok(false)
        });
        let output = Arc::new(QueueChannel::new("output", 4));
        let discard = Arc::new(QueueChannel::new("discard", 4));
        let errors = Arc::new(QueueChannel::new("errors", 4));
        let store = Arc::new(BarrierStore::new(release, clock.clone()));
        let handler = CorrelatingHandler::new(store, output.clone())
            .with_discard_channel(discard.clone())
            .with_error_channel(errors.clone())
            .with_group_timeout(Duration::from_millis(100));

        let d = handler.on_envelope(keyed("K", "a")).await.unwrap();
        assert!(matches!(d, Disposition::Pending { .. }));
        clock.advance(200);

        let report = handler.sweep().await;
        assert_eq!(
            report,
            SweepReport {
                released: 0,
                expired: 0,
                failed: 1
            }
        );
        let error = errors.try_receive().unwrap();
        let failure = error.payload().as_failure().unwrap();
        assert_eq!(failure.root_cause, "release window closed");
        let failed = failure.failed_envelope.as_ref().unwrap();
        assert_eq!(failed.header(headers::CORRELATION_ID), Some(&HeaderValue::from("K")));
        assert_eq!(failed.payload().as_group().unwrap().len(), 1);
        assert!(discard.try_receive().is_none());
        assert!(output.try_receive().is_none());
        assert!(handler.store().is_empty());
    }

    #[tokio::test]
    async fn from_config_uses_configured_header() {
        let config = AggregatorConfig {
            correlation_header: "batch".to_string(),
            release: crate::config::ReleaseConfig::FixedSize { size: 2 },
            ..AggregatorConfig::default()
        };
        let output = Arc::new(QueueChannel::new("output", 4));
        let handler =
            CorrelatingHandler::from_config(&config, output.clone(), Arc::new(ManualClock::new(0)));

        for body in ["x", "y"] {
            handler
                .on_envelope(Envelope::builder(body).header("batch", 7).build())
                .await
                .unwrap();
        }
        let group = output.try_receive().unwrap();
        assert_eq!(group.header(headers::CORRELATION_ID), Some(&HeaderValue::Int(7)));
    }
}
