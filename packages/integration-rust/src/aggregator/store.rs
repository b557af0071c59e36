//! Correlation key → barrier map with atomic release and timeout eviction.
//!
//! Every mutation of a barrier happens while holding its `DashMap` shard
//! lock through the entry API. Release and eviction both remove the entry
//! under that lock, so a barrier leaves the store exactly once, through
//! exactly one of the two paths. Envelopes for keys in other shards proceed
//! in parallel.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{trace, warn};
use weft_core::{
    BarrierAttribute, ClockSource, CorrelationBarrier, CorrelationError, Envelope, HeaderValue,
    MemberContainer, ReleaseStrategy, ReleaseStrategyError,
};

/// Default number of released keys remembered for late-arrival detection.
pub const DEFAULT_TRACKED_KEY_CAPACITY: usize = 1000;

/// A completed group, removed from the store.
#[derive(Debug, Clone)]
pub struct ReleasedGroup {
    pub key: HeaderValue,
    /// Members in arrival order.
    pub members: Vec<Envelope>,
}

/// An incomplete group evicted by the timeout sweep.
#[derive(Debug, Clone)]
pub struct ExpiredGroup {
    pub key: HeaderValue,
    pub members: Vec<Envelope>,
    pub age_ms: u64,
}

/// Outcome of [`BarrierStore::on_envelope`].
#[derive(Debug)]
pub enum Arrival {
    /// Added to an open barrier that is not yet complete.
    Pending { key: HeaderValue, size: usize },
    /// The barrier uses a set container and already holds this envelope.
    Duplicate { key: HeaderValue },
    /// The barrier completed and was removed from the store.
    Released(ReleasedGroup),
    /// The key was released recently; the envelope was not stored.
    Late {
        key: HeaderValue,
        envelope: Box<Envelope>,
    },
}

/// Outcome of sweeping one stale barrier.
#[derive(Debug)]
pub enum Swept {
    /// The release strategy accepted the barrier at sweep time.
    Released(ReleasedGroup),
    Expired(ExpiredGroup),
    /// The release strategy failed; the barrier was discarded.
    Failed {
        key: HeaderValue,
        members: Vec<Envelope>,
        source: ReleaseStrategyError,
    },
}

/// Bounded FIFO of recently released keys.
#[derive(Debug)]
struct ReleasedKeys {
    capacity: usize,
    inner: Mutex<ReleasedKeysInner>,
}

#[derive(Debug, Default)]
struct ReleasedKeysInner {
    order: VecDeque<HeaderValue>,
    members: HashSet<HeaderValue>,
}

impl ReleasedKeys {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(ReleasedKeysInner::default()),
        }
    }

    fn remember(&self, key: &HeaderValue) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.members.insert(key.clone()) {
            inner.order.push_back(key.clone());
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, key: &HeaderValue) -> bool {
        self.capacity > 0 && self.inner.lock().members.contains(key)
    }
}

/// Single authority over the correlation key → barrier mapping.
///
/// Lock order is always shard lock, then the released-keys mutex.
pub struct BarrierStore {
    barriers: DashMap<HeaderValue, CorrelationBarrier>,
    release: ReleaseStrategy,
    container: MemberContainer,
    clock: Arc<dyn ClockSource>,
    released: ReleasedKeys,
}

impl BarrierStore {
    /// Creates an empty store with list containers and the default
    /// late-arrival tracking capacity.
    #[must_use]
    pub fn new(release: ReleaseStrategy, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            barriers: DashMap::new(),
            release,
            container: MemberContainer::List,
            clock,
            released: ReleasedKeys::new(DEFAULT_TRACKED_KEY_CAPACITY),
        }
    }

    #[must_use]
    pub fn with_container(mut self, container: MemberContainer) -> Self {
        self.container = container;
        self
    }

    /// Sets how many released keys are remembered. `0` disables late-arrival
    /// detection, letting a released key open a new barrier.
    #[must_use]
    pub fn with_tracked_key_capacity(mut self, capacity: usize) -> Self {
        self.released = ReleasedKeys::new(capacity);
        self
    }

    #[must_use]
    pub fn release_strategy(&self) -> &ReleaseStrategy {
        &self.release
    }

    /// Current time of the store's clock, in ms.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Adds `envelope` to the barrier for `key`, creating it if needed, and
    /// releases the barrier if the strategy reports it complete.
    ///
    /// # Errors
    ///
    /// - [`CorrelationError::ReleaseStrategy`] if the strategy failed. The
    ///   barrier has been removed and its members are in the error.
    /// - [`CorrelationError::IllegalState`] if the barrier was already
    ///   complete.
    pub fn on_envelope(
        &self,
        key: HeaderValue,
        envelope: Envelope,
    ) -> Result<Arrival, CorrelationError> {
        let now = self.clock.now();
        match self.barriers.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let barrier = entry.get_mut();
                if !barrier.add_member(envelope)? {
                    return Ok(Arrival::Duplicate { key });
                }
                barrier.set_attribute(BarrierAttribute::LastModified(now));
                match self.release.can_release(barrier, now) {
                    Ok(true) => {
                        barrier.mark_complete();
                        self.released.remember(&key);
                        let barrier = entry.remove();
                        trace!(correlation_key = %key, size = barrier.len(), "barrier released");
                        Ok(Arrival::Released(ReleasedGroup {
                            key,
                            members: barrier.into_members(),
                        }))
                    }
                    Ok(false) => Ok(Arrival::Pending {
                        key,
                        size: barrier.len(),
                    }),
                    Err(source) => {
                        let barrier = entry.remove();
                        Err(CorrelationError::ReleaseStrategy {
                            key,
                            members: barrier.into_members(),
                            source,
                        })
                    }
                }
            }
            Entry::Vacant(entry) => {
                if self.released.contains(&key) {
                    return Ok(Arrival::Late {
                        key,
                        envelope: Box::new(envelope),
                    });
                }
                let mut barrier = CorrelationBarrier::new(key.clone(), self.container, now);
                barrier.add_member(envelope)?;
                barrier.set_attribute(BarrierAttribute::LastModified(now));
                match self.release.can_release(&mut barrier, now) {
                    Ok(true) => {
                        barrier.mark_complete();
                        self.released.remember(&key);
                        Ok(Arrival::Released(ReleasedGroup {
                            key,
                            members: barrier.into_members(),
                        }))
                    }
                    Ok(false) => {
                        let size = barrier.len();
                        entry.insert(barrier);
                        Ok(Arrival::Pending { key, size })
                    }
                    Err(source) => Err(CorrelationError::ReleaseStrategy {
                        key,
                        members: barrier.into_members(),
                        source,
                    }),
                }
            }
        }
    }

    /// Removes every incomplete barrier older than `threshold_ms`.
    ///
    /// Each stale barrier is re-evaluated under its entry lock first: if the
    /// release strategy now accepts it (e.g. an age-based strategy) it is
    /// released normally, otherwise it is expired with its partial members.
    /// A strategy failure discards the barrier as [`Swept::Failed`].
    pub fn expire_stale(&self, threshold_ms: u64) -> Vec<Swept> {
        let now = self.clock.now();
        let candidates: Vec<HeaderValue> = self
            .barriers
            .iter()
            .filter(|entry| entry.value().age(now) > threshold_ms)
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = Vec::with_capacity(candidates.len());
        for key in candidates {
            let Entry::Occupied(mut entry) = self.barriers.entry(key) else {
                continue;
            };
            let barrier = entry.get_mut();
            if barrier.is_complete() || barrier.age(now) <= threshold_ms {
                continue;
            }
            let releasable = match self.release.can_release(barrier, now) {
                Ok(releasable) => releasable,
                Err(source) => {
                    warn!(correlation_key = %barrier.correlation_key(), error = %source,
                        "release strategy failed during sweep, discarding barrier");
                    let (key, barrier) = entry.remove_entry();
                    swept.push(Swept::Failed {
                        key,
                        members: barrier.into_members(),
                        source,
                    });
                    continue;
                }
            };
            if releasable {
                barrier.mark_complete();
            }
            self.released.remember(entry.key());
            let (key, barrier) = entry.remove_entry();
            let age_ms = barrier.age(now);
            let members = barrier.into_members();
            swept.push(if releasable {
                Swept::Released(ReleasedGroup { key, members })
            } else {
                Swept::Expired(ExpiredGroup {
                    key,
                    members,
                    age_ms,
                })
            });
        }
        swept
    }

    /// Number of open barriers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &HeaderValue) -> bool {
        self.barriers.contains_key(key)
    }

    /// Keys of the open barriers, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<HeaderValue> {
        self.barriers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of members held for `key`, if it is open.
    #[must_use]
    pub fn group_size(&self, key: &HeaderValue) -> Option<usize> {
        self.barriers.get(key).map(|barrier| barrier.len())
    }
}

impl std::fmt::Debug for BarrierStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierStore")
            .field("open", &self.barriers.len())
            .field("release", &self.release)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}
