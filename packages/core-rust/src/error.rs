use crate::envelope::{Envelope, HeaderValue};

/// Errors raised while correlating envelopes into barriers.
#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    /// The envelope carries no correlation metadata.
    #[error("envelope {envelope_id} has no correlation key (looked for {source_name})")]
    KeyMissing {
        envelope_id: uuid::Uuid,
        source_name: String,
        envelope: Box<Envelope>,
    },
    /// A member was added to a barrier that already completed.
    #[error("barrier for correlation key {key} is already complete")]
    IllegalState { key: HeaderValue },
    /// The release strategy failed; the barrier was discarded.
    #[error("release strategy failed for correlation key {key}")]
    ReleaseStrategy {
        key: HeaderValue,
        members: Vec<Envelope>,
        #[source]
        source: ReleaseStrategyError,
    },
}

/// Failure raised by a release strategy while deciding completeness.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseStrategyError {
    #[error("member is missing a valid {header} header")]
    MissingHeader { header: &'static str },
    #[error("release predicate failed: {0}")]
    Predicate(#[from] anyhow::Error),
}
