use super::pool::{Completion, TaskHandle, TaskOutcome, WorkerPool};
use super::types::*;
use crate::config::AmConfig;
use crate::registry::types::{ApplicationAttemptId, ContainerId};
use crate::umbilical::endpoint::UmbilicalEndpoint;

use anyhow::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs container payloads locally on the worker pool.
///
/// Launch and stop requests are serialized through one FIFO drained by a
/// single event task; completion handling is serialized through the pool's
/// single completion consumer. Per container this yields `Launched` strictly
/// before `Completed`, with no ordering promise across containers.
pub struct LocalContainerLauncher {
    event_tx: mpsc::UnboundedSender<LauncherEvent>,
    running: Arc<DashMap<ContainerId, TaskHandle>>,
    pool: Arc<WorkerPool>,
    runner_factory: Arc<dyn TaskRunnerFactory>,
    umbilical: Arc<UmbilicalEndpoint>,
    application_attempt_id: ApplicationAttemptId,
    working_directory: String,
    local_directories: Vec<String>,
    events: mpsc::UnboundedSender<ContainerEvent>,
    history: mpsc::UnboundedSender<ContainerLaunchedRecord>,
    stopped: AtomicBool,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<LauncherEvent>>>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
    event_worker: Mutex<Option<JoinHandle<()>>>,
    callback_worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalContainerLauncher {
    pub fn new(
        runner_factory: Arc<dyn TaskRunnerFactory>,
        umbilical: Arc<UmbilicalEndpoint>,
        application_attempt_id: ApplicationAttemptId,
        config: &AmConfig,
        events: mpsc::UnboundedSender<ContainerEvent>,
        history: mpsc::UnboundedSender<ContainerLaunchedRecord>,
    ) -> Result<Arc<Self>> {
        let (pool, completion_rx) = WorkerPool::new(config.inline_executor_max_tasks)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            event_tx,
            running: Arc::new(DashMap::new()),
            pool,
            runner_factory,
            umbilical,
            application_attempt_id,
            working_directory: config.working_directory.clone(),
            local_directories: config.local_directories.clone(),
            events,
            history,
            stopped: AtomicBool::new(false),
            event_rx: Mutex::new(Some(event_rx)),
            completion_rx: Mutex::new(Some(completion_rx)),
            event_worker: Mutex::new(None),
            callback_worker: Mutex::new(None),
        }))
    }

    /// Spawns the event worker and the completion consumer.
    pub fn start(self: &Arc<Self>) {
        let event_rx = self
            .event_rx
            .lock()
            .expect("receiver lock poisoned")
            .take()
            .expect("launcher started twice");
        let completion_rx = self
            .completion_rx
            .lock()
            .expect("receiver lock poisoned")
            .take()
            .expect("launcher started twice");

        let event_worker = {
            let launcher = self.clone();
            tokio::spawn(async move {
                launcher.event_loop(event_rx).await;
            })
        };
        let callback_worker = {
            let launcher = self.clone();
            tokio::spawn(async move {
                launcher.completion_loop(completion_rx).await;
            })
        };
        *self.event_worker.lock().expect("worker lock poisoned") = Some(event_worker);
        *self.callback_worker.lock().expect("worker lock poisoned") = Some(callback_worker);
    }

    /// Enqueues a launch or stop request.
    pub fn handle(&self, event: LauncherEvent) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            anyhow::bail!("launcher is stopped");
        }
        self.event_tx
            .send(event)
            .map_err(|_| anyhow::anyhow!("launcher event loop is stopped"))
    }

    async fn event_loop(self: Arc<Self>, mut event_rx: mpsc::UnboundedReceiver<LauncherEvent>) {
        while let Some(event) = event_rx.recv().await {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            match event {
                LauncherEvent::Launch {
                    container_id,
                    launch_context,
                } => self.launch(container_id, launch_context),
                LauncherEvent::Stop { container_id } => self.stop_container(&container_id),
            }
        }
    }

    fn launch(&self, container_id: ContainerId, launch_context: ContainerLaunchContext) {
        let credentials = match launch_context.parse_credentials() {
            Ok(credentials) => credentials,
            Err(e) => {
                self.launch_failed(
                    &container_id,
                    format!("Failed to parse credentials for container {}: {}", container_id.0, e),
                );
                return;
            }
        };

        let runner = match self.runner_factory.create_runner(
            &container_id,
            credentials,
            self.umbilical.clone(),
            &self.working_directory,
            &self.local_directories,
        ) {
            Ok(runner) => runner,
            Err(e) => {
                self.launch_failed(
                    &container_id,
                    format!("Failed to launch container {}: {}", container_id.0, e),
                );
                return;
            }
        };

        // The payload waits for its handle to be recorded before it can
        // finish, so the completion consumer always finds the entry.
        let (armed_tx, armed_rx) = tokio::sync::oneshot::channel::<()>();
        let payload = {
            let events = self.events.clone();
            let history = self.history.clone();
            let id = container_id.clone();
            let application_attempt_id = self.application_attempt_id.clone();
            async move {
                let _ = armed_rx.await;
                // The container has a pool slot now; announce the launch.
                let _ = events.send(ContainerEvent::Launched {
                    container_id: id.clone(),
                });
                let _ = history.send(ContainerLaunchedRecord {
                    container_id: id,
                    launch_time_ms: now_ms(),
                    application_attempt_id,
                });
                runner.run().await
            }
        };

        match self.pool.submit(container_id.clone(), payload) {
            Ok(handle) => {
                self.running.insert(container_id, handle);
                let _ = armed_tx.send(());
            }
            Err(e) => self.launch_failed(
                &container_id,
                format!("Failed to queue container launch for container {}: {}", container_id.0, e),
            ),
        }
    }

    fn stop_container(&self, container_id: &ContainerId) {
        match self.running.get(container_id) {
            None => {
                tracing::info!("Ignoring stop request for container {}", container_id.0);
            }
            Some(handle) => {
                tracing::info!(
                    "Interrupting running/queued container {}",
                    container_id.0
                );
                handle.cancel();
            }
        }
        // Always sent, to keep the upstream state machine moving.
        let _ = self.events.send(ContainerEvent::StopSent {
            container_id: container_id.clone(),
        });
    }

    fn launch_failed(&self, container_id: &ContainerId, message: String) {
        tracing::error!("{}", message);
        let _ = self.events.send(ContainerEvent::LaunchFailed {
            container_id: container_id.clone(),
            message,
        });
    }

    async fn completion_loop(self: Arc<Self>, mut completion_rx: mpsc::UnboundedReceiver<Completion>) {
        while let Some(completion) = completion_rx.recv().await {
            // The handle is dropped before anything else is torn down.
            self.running.remove(&completion.container_id);
            self.emit_completed(completion);
        }
    }

    fn emit_completed(&self, completion: Completion) {
        let container_id = completion.container_id;
        let event = match completion.outcome {
            TaskOutcome::Finished(result) => match result.exit_status {
                ExitStatus::Success | ExitStatus::AskedToDie => {
                    tracing::info!("Container {} completed successfully", container_id.0);
                    ContainerEvent::Completed {
                        container_id,
                        exit_code: result.exit_status.exit_code(),
                        message: None,
                        cause: TerminationCause::ContainerExited,
                    }
                }
                other => {
                    tracing::info!("Container {} completed but with errors", container_id.0);
                    ContainerEvent::Completed {
                        container_id,
                        exit_code: other.exit_code(),
                        // The underlying cause fills in when the payload set
                        // no explicit message.
                        message: result.error_message.or(result.cause),
                        cause: TerminationCause::ApplicationError,
                    }
                }
            },
            TaskOutcome::Cancelled => {
                // Cancellation is always initiated locally by a stop request
                // or shutdown, so it counts as a clean exit.
                tracing::info!(
                    "Ignoring cancellation for container {}, stop was requested locally",
                    container_id.0
                );
                ContainerEvent::Completed {
                    container_id,
                    exit_code: ExitStatus::Success.exit_code(),
                    message: Some("cancelled".to_string()),
                    cause: TerminationCause::ContainerExited,
                }
            }
            TaskOutcome::Failed(message) => {
                tracing::info!("Container {} execution failed: {}", container_id.0, message);
                ContainerEvent::Completed {
                    container_id,
                    exit_code: ExitStatus::ExecutionFailure.exit_code(),
                    message: Some(message),
                    cause: TerminationCause::ApplicationError,
                }
            }
        };
        let _ = self.events.send(event);
    }

    /// Stops the event worker, cancels outstanding payloads, and joins both
    /// workers with a bounded timeout.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!("Launcher already stopped, ignoring additional stop");
            return;
        }

        let event_worker = self.event_worker.lock().expect("worker lock poisoned").take();
        if let Some(worker) = event_worker {
            worker.abort();
            let _ = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, worker).await;
        }

        for entry in self.running.iter() {
            entry.value().cancel();
        }
        self.pool.shutdown();

        let callback_worker = self
            .callback_worker
            .lock()
            .expect("worker lock poisoned")
            .take();
        if let Some(worker) = callback_worker {
            worker.abort();
            let _ = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, worker).await;
        }
    }
}
