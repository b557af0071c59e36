//! Per-correlation-key accumulator of envelopes.
//!
//! A [`CorrelationBarrier`] holds the members of one group until a release
//! strategy declares it complete. It is not synchronized: the owning store
//! mutates it only while holding that key's exclusion scope.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{Envelope, HeaderValue};
use crate::error::CorrelationError;

/// Shape of the member container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberContainer {
    /// Keeps every envelope in arrival order.
    #[default]
    List,
    /// Ignores an envelope whose id was already added; arrival order is kept.
    Set,
}

#[derive(Debug, Clone)]
enum Members {
    List(Vec<Envelope>),
    Set {
        ordered: Vec<Envelope>,
        seen: HashSet<Uuid>,
    },
}

impl Members {
    fn new(container: MemberContainer) -> Self {
        match container {
            MemberContainer::List => Self::List(Vec::new()),
            MemberContainer::Set => Self::Set {
                ordered: Vec::new(),
                seen: HashSet::new(),
            },
        }
    }

    fn insert(&mut self, envelope: Envelope) -> bool {
        match self {
            Self::List(list) => {
                list.push(envelope);
                true
            }
            Self::Set { ordered, seen } => {
                if seen.insert(envelope.id()) {
                    ordered.push(envelope);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn as_slice(&self) -> &[Envelope] {
        match self {
            Self::List(list) | Self::Set { ordered: list, .. } => list,
        }
    }

    fn into_vec(self) -> Vec<Envelope> {
        match self {
            Self::List(list) | Self::Set { ordered: list, .. } => list,
        }
    }
}

/// Names of the typed out-of-band attributes a barrier can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    ExpectedSize,
    LastModified,
}

/// Typed attribute value. Setting an attribute replaces the previous value of
/// the same [`AttributeKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierAttribute {
    /// Group size a size-based release strategy waits for.
    ExpectedSize(usize),
    /// Time of the last member add, in ms since epoch.
    LastModified(u64),
}

impl BarrierAttribute {
    #[must_use]
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::ExpectedSize(_) => AttributeKind::ExpectedSize,
            Self::LastModified(_) => AttributeKind::LastModified,
        }
    }
}

/// Accumulator for one correlation group pending completion.
#[derive(Debug, Clone)]
pub struct CorrelationBarrier {
    key: HeaderValue,
    members: Members,
    complete: bool,
    timestamp: u64,
    expected_size: Option<usize>,
    last_modified: Option<u64>,
}

impl CorrelationBarrier {
    /// Creates an empty, incomplete barrier stamped with `timestamp`.
    #[must_use]
    pub fn new(key: HeaderValue, container: MemberContainer, timestamp: u64) -> Self {
        Self {
            key,
            members: Members::new(container),
            complete: false,
            timestamp,
            expected_size: None,
            last_modified: None,
        }
    }

    /// Adds `envelope` to the barrier.
    ///
    /// Returns `Ok(false)` when a `Set` container already holds an envelope
    /// with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::IllegalState`] if the barrier is complete.
    pub fn add_member(&mut self, envelope: Envelope) -> Result<bool, CorrelationError> {
        if self.complete {
            return Err(CorrelationError::IllegalState {
                key: self.key.clone(),
            });
        }
        Ok(self.members.insert(envelope))
    }

    /// Marks the barrier complete. Idempotent; the flag never resets.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Members in arrival order.
    #[must_use]
    pub fn members(&self) -> &[Envelope] {
        self.members.as_slice()
    }

    #[must_use]
    pub fn into_members(self) -> Vec<Envelope> {
        self.members.into_vec()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.as_slice().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn correlation_key(&self) -> &HeaderValue {
        &self.key
    }

    /// Creation time in ms since epoch. Set once.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Milliseconds elapsed between creation and `now`.
    #[must_use]
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn set_attribute(&mut self, attribute: BarrierAttribute) {
        match attribute {
            BarrierAttribute::ExpectedSize(size) => self.expected_size = Some(size),
            BarrierAttribute::LastModified(at) => self.last_modified = Some(at),
        }
    }

    #[must_use]
    pub fn attribute(&self, kind: AttributeKind) -> Option<BarrierAttribute> {
        match kind {
            AttributeKind::ExpectedSize => self.expected_size.map(BarrierAttribute::ExpectedSize),
            AttributeKind::LastModified => self.last_modified.map(BarrierAttribute::LastModified),
        }
    }

    #[must_use]
    pub fn expected_size(&self) -> Option<usize> {
        self.expected_size
    }

    #[must_use]
    pub fn last_modified(&self) -> Option<u64> {
        self.last_modified
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn barrier(container: MemberContainer) -> CorrelationBarrier {
        CorrelationBarrier::new(HeaderValue::from("K1"), container, 1_000)
    }

    #[test]
    fn new_barrier_is_empty_and_incomplete() {
        let b = barrier(MemberContainer::List);
        assert!(b.is_empty());
        assert!(!b.is_complete());
        assert_eq!(b.timestamp(), 1_000);
        assert_eq!(b.correlation_key(), &HeaderValue::from("K1"));
        assert_eq!(b.attribute(AttributeKind::ExpectedSize), None);
    }

    #[test]
    fn add_after_complete_fails() {
        let mut b = barrier(MemberContainer::List);
        b.add_member(Envelope::new("a")).unwrap();
        b.mark_complete();
        b.mark_complete();
        assert!(b.is_complete());

        let err = b.add_member(Envelope::new("b")).unwrap_err();
        assert!(matches!(err, CorrelationError::IllegalState { .. }));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn set_container_ignores_same_envelope_twice() {
        let mut b = barrier(MemberContainer::Set);
        let env = Envelope::new("a");
        assert!(b.add_member(env.clone()).unwrap());
        assert!(!b.add_member(env).unwrap());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn list_container_keeps_duplicates() {
        let mut b = barrier(MemberContainer::List);
        let env = Envelope::new("a");
        assert!(b.add_member(env.clone()).unwrap());
        assert!(b.add_member(env).unwrap());
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn attributes_last_write_wins() {
        let mut b = barrier(MemberContainer::List);
        b.set_attribute(BarrierAttribute::ExpectedSize(3));
        b.set_attribute(BarrierAttribute::ExpectedSize(5));
        b.set_attribute(BarrierAttribute::LastModified(1_200));

        assert_eq!(
            b.attribute(AttributeKind::ExpectedSize),
            Some(BarrierAttribute::ExpectedSize(5))
        );
        assert_eq!(b.expected_size(), Some(5));
        assert_eq!(b.last_modified(), Some(1_200));
        assert_eq!(
            BarrierAttribute::LastModified(1).kind(),
            AttributeKind::LastModified
        );
    }

    #[test]
    fn age_saturates() {
        let b = barrier(MemberContainer::List);
        assert_eq!(b.age(1_100), 100);
        assert_eq!(b.age(900), 0);
    }

    proptest! {
        #[test]
        fn members_keep_arrival_order(
            picks in proptest::collection::vec(0usize..8, 1..40),
            as_set in any::<bool>(),
        ) {
            let pool: Vec<Envelope> = (0..8).map(|i| Envelope::new(format!("m{i}"))).collect();
            let container = if as_set { MemberContainer::Set } else { MemberContainer::List };
            let mut b = barrier(container);

            let mut expected: Vec<Uuid> = Vec::new();
            for &i in &picks {
                let env = pool[i].clone();
                let inserted = b.add_member(env.clone()).unwrap();
                let seen_before = expected.contains(&env.id());
                if as_set {
                    prop_assert_eq!(inserted, !seen_before);
                    if !seen_before {
                        expected.push(env.id());
                    }
                } else {
                    prop_assert!(inserted);
                    expected.push(env.id());
                }
            }

            let actual: Vec<Uuid> = b.members().iter().map(Envelope::id).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
