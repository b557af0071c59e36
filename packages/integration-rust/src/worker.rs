//! Long-lived background task driven by a command queue and a periodic tick.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

const COMMAND_CAPACITY: usize = 64;

/// Work executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Handles one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on every tick. No-op by default.
    async fn on_tick(&mut self) {}

    /// Called once after the worker loop exits. No-op by default.
    async fn shutdown(&mut self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker '{0}' is stopped")]
    Stopped(String),
}

/// Handle to a spawned [`BackgroundRunnable`].
///
/// The first tick fires one full interval after start. Dropping the handle
/// without calling [`stop`](Self::stop) closes the command queue, which also
/// ends the loop.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: String,
    commands: Option<mpsc::Sender<R::Task>>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns `runnable` on the current tokio runtime.
    pub fn start(name: impl Into<String>, mut runnable: R, tick: Duration) -> Self {
        let name = name.into();
        let (commands, mut rx) = mpsc::channel::<R::Task>(COMMAND_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let span = tracing::debug_span!("worker", name = %name);

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                debug!("worker started");
                loop {
                    tokio::select! {
                        task = rx.recv() => match task {
                            Some(task) => runnable.run(task).await,
                            None => break,
                        },
                        _ = ticker.tick() => runnable.on_tick().await,
                        _ = &mut stop_rx => break,
                    }
                }
                runnable.shutdown().await;
                debug!("worker stopped");
            }
            .instrument(span),
        );

        Self {
            name,
            commands: Some(commands),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Queues `task` for the worker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] once the worker has stopped.
    pub async fn submit(&self, task: R::Task) -> Result<(), WorkerError> {
        let stopped = || WorkerError::Stopped(self.name.clone());
        let commands = self.commands.as_ref().ok_or_else(stopped)?;
        commands.send(task).await.map_err(|_| stopped())
    }

    /// Stops the loop and waits for [`BackgroundRunnable::shutdown`] to finish.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        self.commands = None;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(worker = %self.name, error = %e, "worker task ended abnormally");
            }
        }
    }
}
