//! Bounded asynchronous dispatch of received datagrams.
//!
//! Each datagram is mapped and sent on its own task, holding one of
//! `pool_size` semaphore permits. When no permit is free the datagram is
//! rejected rather than queued, so the receive loop never waits on
//! downstream channels. Every failure, including rejection, is routed to the
//! error channel or logged; none reaches the receive loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, error, warn, Instrument};
use weft_core::{Envelope, FailurePayload};

use super::error::DispatchError;
use super::mapper::DatagramMapper;
use crate::channel::MessageChannel;

/// Counts tasks that must finish before shutdown completes.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    count: Arc<AtomicU64>,
}

impl InFlightTracker {
    /// Registers one task; it is done when the guard drops, even on panic.
    #[must_use]
    pub fn track(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Waits until no task is in flight. Returns `false` if `timeout`
    /// elapsed first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Maps datagrams to envelopes and sends them to the output channel.
pub struct Dispatcher {
    output: Arc<dyn MessageChannel>,
    errors: Option<Arc<dyn MessageChannel>>,
    mapper: DatagramMapper,
    send_timeout: Option<Duration>,
    pool_size: usize,
    permits: Arc<Semaphore>,
    in_flight: InFlightTracker,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        output: Arc<dyn MessageChannel>,
        errors: Option<Arc<dyn MessageChannel>>,
        mapper: DatagramMapper,
        pool_size: usize,
        send_timeout: Option<Duration>,
    ) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            output,
            errors,
            mapper,
            send_timeout,
            pool_size,
            permits: Arc::new(Semaphore::new(pool_size)),
            in_flight: InFlightTracker::default(),
        }
    }

    /// Hands `datagram` to a dispatch task without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Saturated`] or [`DispatchError::PoolShutdown`]
    /// when the datagram was rejected. The rejection has already been routed
    /// to the error channel.
    pub fn submit(self: &Arc<Self>, datagram: Bytes, source: SocketAddr) -> Result<(), DispatchError> {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(rejected) => {
                let err = match rejected {
                    TryAcquireError::Closed => DispatchError::PoolShutdown,
                    TryAcquireError::NoPermits => DispatchError::Saturated {
                        pool_size: self.pool_size,
                    },
                };
                self.reject(&err, &datagram, source);
                return Err(err);
            }
        };

        let guard = self.in_flight.track();
        let this = Arc::clone(self);
        let span = tracing::debug_span!("dispatch", %source, len = datagram.len());
        tokio::spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                if let Err((err, failed)) = this.dispatch(&datagram, source).await {
                    this.route_failure(&err, failed).await;
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn dispatch(
        &self,
        datagram: &[u8],
        source: SocketAddr,
    ) -> Result<(), (DispatchError, Option<Envelope>)> {
        let envelope = match self.mapper.to_envelope(datagram, source) {
            Ok(envelope) => envelope,
            Err(source_err) => {
                let raw = DatagramMapper::default().to_envelope(datagram, source).ok();
                return Err((
                    DispatchError::Mapping {
                        source_addr: source,
                        source: source_err,
                    },
                    raw,
                ));
            }
        };

        let failed = envelope.clone();
        match self.output.send_timeout(envelope, self.send_timeout).await {
            Ok(true) => {
                debug!(channel = %self.output.name(), "datagram dispatched");
                Ok(())
            }
            Ok(false) => Err((
                DispatchError::NotAccepted {
                    channel: self.output.name().to_string(),
                },
                Some(failed),
            )),
            Err(e) => Err((DispatchError::Delivery(e), Some(failed))),
        }
    }

    fn reject(self: &Arc<Self>, err: &DispatchError, datagram: &[u8], source: SocketAddr) {
        warn!(%source, error = %err, "datagram rejected");
        if self.errors.is_none() {
            return;
        }
        let failed = DatagramMapper::default().to_envelope(datagram, source).ok();
        let failure = Envelope::new(FailurePayload::from_error(err, failed));
        let guard = self.in_flight.track();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            this.send_failure(failure).await;
        });
    }

    /// Sends a failure envelope for `err` to the error channel, or logs it.
    pub async fn route_failure(&self, err: &DispatchError, failed: Option<Envelope>) {
        if self.errors.is_none() {
            error!(error = %err, "dispatch failed, no error channel");
            return;
        }
        warn!(error = %err, "dispatch failed, routing to error channel");
        self.send_failure(Envelope::new(FailurePayload::from_error(err, failed)))
            .await;
    }

    async fn send_failure(&self, failure: Envelope) {
        let Some(errors) = &self.errors else {
            return;
        };
        match errors.send_timeout(failure, self.send_timeout).await {
            Ok(true) => {}
            Ok(false) => error!(channel = %errors.name(), "error channel did not accept failure"),
            Err(e) => error!(channel = %errors.name(), error = %e, "failed to send to error channel"),
        }
    }

    /// Stops accepting datagrams. Tasks already running are unaffected.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.permits.is_closed()
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.count()
    }

    /// Waits for in-flight dispatches. Returns `false` if `grace` elapsed
    /// first.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        self.in_flight.wait_for_drain(grace).await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("output", &self.output.name())
            .field("pool_size", &self.pool_size)
            .field("in_flight", &self.in_flight.count())
            .finish_non_exhaustive()
    }
}
