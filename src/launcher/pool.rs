use super::types::ExecutionResult;
use crate::registry::types::ContainerId;

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc, watch};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("worker pool is stopped")]
    PoolStopped,
}

/// How a submitted payload ended.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The payload ran and reported a result.
    Finished(ExecutionResult),
    /// The handle was cancelled locally before the payload finished.
    Cancelled,
    /// The payload itself errored out.
    Failed(String),
}

#[derive(Debug)]
pub struct Completion {
    pub container_id: ContainerId,
    pub outcome: TaskOutcome,
}

/// Cancellable handle to one submitted payload.
pub struct TaskHandle {
    pub container_id: ContainerId,
    cancel_tx: watch::Sender<bool>,
}

impl TaskHandle {
    /// Requests cooperative interruption. The payload observes it at its
    /// next await point; one that never yields runs to completion.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Bounded executor running task payloads inside the application master.
///
/// Admission is bounded by a semaphore of `max_tasks` permits; submissions
/// beyond that queue until a slot frees up. Every submission reports exactly
/// one [`Completion`] over a single channel, whose sole consumer serializes
/// all completion handling.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    stopped: AtomicBool,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl WorkerPool {
    pub fn new(max_tasks: usize) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Completion>)> {
        anyhow::ensure!(max_tasks >= 1, "must have at least 1 executor");
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            permits: Arc::new(Semaphore::new(max_tasks)),
            stopped: AtomicBool::new(false),
            completion_tx,
        });
        tracing::info!("Started worker pool with {} executors", max_tasks);
        Ok((pool, completion_rx))
    }

    /// Queues a payload for execution and returns its cancellable handle.
    pub fn submit<F>(
        &self,
        container_id: ContainerId,
        payload: F,
    ) -> Result<TaskHandle, SubmitError>
    where
        F: Future<Output = Result<ExecutionResult>> + Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SubmitError::PoolStopped);
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let permits = self.permits.clone();
        let completion_tx = self.completion_tx.clone();
        let id = container_id.clone();

        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit,
                _ = wait_cancelled(&mut cancel_rx) => {
                    let _ = completion_tx.send(Completion {
                        container_id: id,
                        outcome: TaskOutcome::Cancelled,
                    });
                    return;
                }
            };
            // The semaphore closes only on shutdown; a queued payload evicted
            // that way was stopped locally.
            let Ok(_permit) = permit else {
                let _ = completion_tx.send(Completion {
                    container_id: id,
                    outcome: TaskOutcome::Cancelled,
                });
                return;
            };

            let outcome = tokio::select! {
                result = payload => match result {
                    Ok(execution_result) => TaskOutcome::Finished(execution_result),
                    Err(e) => TaskOutcome::Failed(e.to_string()),
                },
                _ = wait_cancelled(&mut cancel_rx) => TaskOutcome::Cancelled,
            };

            let _ = completion_tx.send(Completion {
                container_id: id,
                outcome,
            });
        });

        Ok(TaskHandle {
            container_id,
            cancel_tx,
        })
    }

    /// Stops admission and evicts queued payloads. Payloads already running
    /// are left to their handles.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        tracing::info!("Worker pool shut down");
    }
}

async fn wait_cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            // Sender gone without a cancel; never resolve.
            std::future::pending::<()>().await;
        }
    }
}
