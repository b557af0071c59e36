//! Correlation and release strategies.
//!
//! A [`CorrelationStrategy`] extracts the group key from an envelope; a
//! [`ReleaseStrategy`] decides when a barrier holds a complete group. Both are
//! selected as values rather than through trait objects, with a closure
//! variant for custom logic.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::barrier::{BarrierAttribute, CorrelationBarrier};
use crate::envelope::{headers, Envelope, HeaderValue};
use crate::error::ReleaseStrategyError;

/// Custom correlation key extractor.
pub type KeyFn = Arc<dyn Fn(&Envelope) -> Option<HeaderValue> + Send + Sync>;

/// Custom completeness predicate.
pub type ReleasePredicate = Arc<dyn Fn(&CorrelationBarrier) -> anyhow::Result<bool> + Send + Sync>;

/// Extracts the correlation key from an envelope.
#[derive(Clone)]
pub enum CorrelationStrategy {
    /// Reads the key from the named header.
    Header(String),
    /// Computes the key with a user function.
    Custom(KeyFn),
}

impl CorrelationStrategy {
    pub fn header(name: impl Into<String>) -> Self {
        Self::Header(name.into())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Envelope) -> Option<HeaderValue> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Returns the correlation key, or `None` if the envelope has none.
    #[must_use]
    pub fn correlation_key(&self, envelope: &Envelope) -> Option<HeaderValue> {
        match self {
            Self::Header(name) => envelope.header(name).cloned(),
            Self::Custom(f) => f(envelope),
        }
    }

    /// Human-readable description of where the key comes from.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Header(name) => format!("header '{name}'"),
            Self::Custom(_) => "custom correlation function".to_string(),
        }
    }
}

impl Default for CorrelationStrategy {
    fn default() -> Self {
        Self::Header(headers::CORRELATION_ID.to_string())
    }
}

impl fmt::Debug for CorrelationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(name) => f.debug_tuple("Header").field(name).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Decides when a barrier holds a complete group.
#[derive(Clone)]
pub enum ReleaseStrategy {
    /// Releases when the member count reaches the `sequenceSize` header of
    /// the first member. The size is recorded as the barrier's
    /// [`BarrierAttribute::ExpectedSize`].
    SequenceSize,
    /// Releases when the member count reaches a fixed size.
    FixedSize(usize),
    /// Releases when `threshold` members arrived or the barrier is
    /// `after_ms` old, whichever comes first.
    Timeout { after_ms: u64, threshold: usize },
    /// Releases when the user predicate returns `true`.
    Predicate(ReleasePredicate),
}

impl ReleaseStrategy {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&CorrelationBarrier) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Evaluates completeness of `barrier` at time `now` (ms since epoch).
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseStrategyError`] when the strategy cannot decide, e.g.
    /// a missing `sequenceSize` header or a failing predicate.
    pub fn can_release(
        &self,
        barrier: &mut CorrelationBarrier,
        now: u64,
    ) -> Result<bool, ReleaseStrategyError> {
        match self {
            Self::SequenceSize => {
                let expected = match barrier.expected_size() {
                    Some(size) => size,
                    None => {
                        let size = barrier
                            .members()
                            .first()
                            .and_then(|m| m.headers().get_int(headers::SEQUENCE_SIZE))
                            .and_then(|v| usize::try_from(v).ok())
                            .filter(|v| *v > 0)
                            .ok_or(ReleaseStrategyError::MissingHeader {
                                header: headers::SEQUENCE_SIZE,
                            })?;
                        trace!(correlation_key = %barrier.correlation_key(), size, "expected group size recorded");
                        barrier.set_attribute(BarrierAttribute::ExpectedSize(size));
                        size
                    }
                };
                Ok(barrier.len() >= expected)
            }
            Self::FixedSize(size) => Ok(barrier.len() >= *size),
            Self::Timeout {
                after_ms,
                threshold,
            } => Ok(barrier.len() >= *threshold || barrier.age(now) >= *after_ms),
            Self::Predicate(f) => Ok(f(barrier)?),
        }
    }
}

impl fmt::Debug for ReleaseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceSize => f.write_str("SequenceSize"),
            Self::FixedSize(size) => f.debug_tuple("FixedSize").field(size).finish(),
            Self::Timeout {
                after_ms,
                threshold,
            } => f
                .debug_struct("Timeout")
                .field("after_ms", after_ms)
                .field("threshold", threshold)
                .finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::{AttributeKind, MemberContainer};

    fn barrier_with(members: Vec<Envelope>) -> CorrelationBarrier {
        let mut b = CorrelationBarrier::new(HeaderValue::from("K"), MemberContainer::List, 0);
        for m in members {
            b.add_member(m).unwrap();
        }
        b
    }

    #[test]
    fn header_strategy_reads_correlation_id() {
        let strategy = CorrelationStrategy::default();
        let env = Envelope::builder("x").correlation_id("K1").build();
        assert_eq!(strategy.correlation_key(&env), Some(HeaderValue::from("K1")));
        assert_eq!(strategy.correlation_key(&Envelope::new("x")), None);
        assert_eq!(strategy.describe(), "header 'correlationId'");
    }

    #[test]
    fn custom_strategy_uses_function() {
        let strategy = CorrelationStrategy::custom(|env| {
            env.headers().get_str("tenant").map(|t| HeaderValue::from(t.to_uppercase()))
        });
        let env = Envelope::builder("x").header("tenant", "acme").build();
        assert_eq!(strategy.correlation_key(&env), Some(HeaderValue::from("ACME")));
    }

    #[test]
    fn sequence_size_records_expected_size() {
        let strategy = ReleaseStrategy::SequenceSize;
        let mut b = barrier_with(vec![Envelope::builder("a").sequence(1, 2).build()]);

        assert!(!strategy.can_release(&mut b, 0).unwrap());
        assert_eq!(
            b.attribute(AttributeKind::ExpectedSize),
            Some(BarrierAttribute::ExpectedSize(2))
        );

        b.add_member(Envelope::builder("b").sequence(2, 2).build()).unwrap();
        assert!(strategy.can_release(&mut b, 0).unwrap());
    }

    #[test]
    fn sequence_size_without_header_fails() {
        let mut b = barrier_with(vec![Envelope::new("a")]);
        let err = ReleaseStrategy::SequenceSize.can_release(&mut b, 0).unwrap_err();
        assert!(matches!(
            err,
            ReleaseStrategyError::MissingHeader { header: "sequenceSize" }
        ));
    }

    #[test]
    fn fixed_size_counts_members() {
        let strategy = ReleaseStrategy::FixedSize(3);
        let mut b = barrier_with(vec![Envelope::new("a"), Envelope::new("b")]);
        assert!(!strategy.can_release(&mut b, 0).unwrap());
        b.add_member(Envelope::new("c")).unwrap();
        assert!(strategy.can_release(&mut b, 0).unwrap());
    }

    #[test]
    fn timeout_strategy_releases_on_age_or_threshold() {
        let strategy = ReleaseStrategy::Timeout {
            after_ms: 100,
            threshold: 3,
        };
        let mut b = barrier_with(vec![Envelope::new("a")]);
        assert!(!strategy.can_release(&mut b, 99).unwrap());
        assert!(strategy.can_release(&mut b, 100).unwrap());

        let mut full = barrier_with(vec![Envelope::new("a"), Envelope::new("b"), Envelope::new("c")]);
        assert!(strategy.can_release(&mut full, 0).unwrap());
    }

    #[test]
    fn predicate_errors_propagate() {
        let strategy = ReleaseStrategy::predicate(|_| Err(anyhow::anyhow!("boom")));
        let mut b = barrier_with(vec![Envelope::new("a")]);
        let err = strategy.can_release(&mut b, 0).unwrap_err();
        assert_eq!(err.to_string(), "release predicate failed: boom");
    }
}
