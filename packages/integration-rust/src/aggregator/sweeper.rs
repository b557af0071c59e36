//! Periodic timeout sweep for a [`CorrelatingHandler`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::handler::{CorrelatingHandler, SweepReport};
use crate::worker::{BackgroundRunnable, BackgroundWorker};

#[derive(Debug)]
pub enum SweepTask {
    /// Sweep immediately, optionally reporting the result.
    RunNow {
        reply: Option<oneshot::Sender<SweepReport>>,
    },
}

/// Sweeps stale barriers on every worker tick.
#[derive(Debug)]
pub struct BarrierSweeper {
    handler: Arc<CorrelatingHandler>,
}

impl BarrierSweeper {
    #[must_use]
    pub fn new(handler: Arc<CorrelatingHandler>) -> Self {
        Self { handler }
    }

    /// Starts a worker sweeping `handler` every `interval`.
    pub fn spawn(handler: Arc<CorrelatingHandler>, interval: Duration) -> BackgroundWorker<Self> {
        BackgroundWorker::start("barrier-sweeper", Self::new(handler), interval)
    }
}

#[async_trait]
impl BackgroundRunnable for BarrierSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::RunNow { reply } => {
                let report = self.handler.sweep().await;
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.handler.sweep().await;
    }
}
