//! Bounded point-to-point queue backed by a tokio mpsc channel.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use weft_core::Envelope;

use super::{ChannelError, MessageChannel, PollableChannel};

/// Bounded FIFO channel.
///
/// Senders wait for capacity up to their timeout; a zero timeout never waits.
/// The receiver end is locked only to pop one envelope, never across an
/// await, so `try_receive` is not blocked by a pending `receive`.
#[derive(Debug)]
pub struct QueueChannel {
    name: String,
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
    ready: Notify,
}

impl QueueChannel {
    /// Creates a queue holding at most `capacity` envelopes (minimum 1).
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(rx),
            ready: Notify::new(),
        }
    }

    /// Number of envelopes currently queued.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Free slots left in the queue.
    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

#[async_trait]
impl MessageChannel for QueueChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_timeout(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<bool, ChannelError> {
        let closed = || ChannelError::Closed {
            channel: self.name.clone(),
        };
        let accepted = match timeout {
            Some(t) if t.is_zero() => match self.tx.try_send(envelope) {
                Ok(()) => Ok(true),
                Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(closed()),
            },
            Some(t) => match tokio::time::timeout(t, self.tx.send(envelope)).await {
                Ok(Ok(())) => Ok(true),
                Ok(Err(_)) => Err(closed()),
                Err(_elapsed) => Ok(false),
            },
            None => self.tx.send(envelope).await.map(|()| true).map_err(|_| closed()),
        };
        if matches!(accepted, Ok(true)) {
            self.ready.notify_waiters();
        }
        accepted
    }
}

#[async_trait]
impl PollableChannel for QueueChannel {
    async fn receive(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before polling so a send between the two is not missed.
            notified.as_mut().enable();
            if let Some(envelope) = self.try_receive() {
                return Some(envelope);
            }
            tokio::time::timeout_at(deadline, notified).await.ok()?;
        }
    }

    fn try_receive(&self) -> Option<Envelope> {
        self.rx.lock().try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use weft_core::Payload;

    use super::*;

    #[tokio::test]
    async fn send_then_receive_in_order() {
        let channel = QueueChannel::new("queue", 4);
        assert!(channel.send(Envelope::new("a")).await.unwrap());
        assert!(channel.send(Envelope::new("b")).await.unwrap());
        assert_eq!(channel.queue_size(), 2);

        let first = channel.receive(Duration::from_millis(100)).await.unwrap();
        let second = channel.try_receive().unwrap();
        assert_eq!(first.payload(), &Payload::from("a"));
        assert_eq!(second.payload(), &Payload::from("b"));
        assert_eq!(channel.queue_size(), 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_with_timeout() {
        let channel = QueueChannel::new("queue", 1);
        assert!(channel
            .send_timeout(Envelope::new("a"), Some(Duration::ZERO))
            .await
            .unwrap());
        assert_eq!(channel.remaining_capacity(), 0);

        let accepted = channel
            .send_timeout(Envelope::new("b"), Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(!accepted);

        let accepted = channel
            .send_timeout(Envelope::new("c"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn try_receive_is_not_blocked_by_pending_receive() {
        let channel = Arc::new(QueueChannel::new("queue", 4));
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.receive(Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;

        assert!(channel.send(Envelope::new("a")).await.unwrap());
        assert!(channel.send(Envelope::new("b")).await.unwrap());
        let polled = channel.try_receive().unwrap();
        let waited = waiter.await.unwrap().unwrap();

        assert_eq!(polled.payload(), &Payload::from("a"));
        assert_eq!(waited.payload(), &Payload::from("b"));
    }

    #[tokio::test]
    async fn receive_wakes_on_later_send() {
        let channel = Arc::new(QueueChannel::new("queue", 1));
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.receive(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(channel.send(Envelope::new("late")).await.unwrap());
        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.payload(), &Payload::from("late"));
    }

    #[tokio::test]
    async fn receive_times_out_when_empty() {
        let channel = QueueChannel::new("queue", 1);
        assert!(channel.receive(Duration::from_millis(20)).await.is_none());
        assert!(channel.try_receive().is_none());
    }
}
