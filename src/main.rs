use dag_dispatch::config::AmConfig;
use dag_dispatch::launcher::event_loop::LocalContainerLauncher;
use dag_dispatch::launcher::types::{
    ContainerEvent, ContainerLaunchContext, ExecutionResult, ExitStatus, LauncherEvent,
    TaskRunner, TaskRunnerFactory,
};
use dag_dispatch::registry::types::{
    ApplicationAttemptId, ContainerId, Credentials, TaskAttemptId, TaskSpec,
};
use dag_dispatch::umbilical::context::{
    TaskCommunicatorContext, TaskHeartbeatRequest, TaskHeartbeatResponse,
};
use dag_dispatch::umbilical::endpoint::UmbilicalEndpoint;
use dag_dispatch::umbilical::protocol::{ContainerContext, HeartbeatRequest, TaskEvent};
use dag_dispatch::umbilical::service::TaskCommunicatorService;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Minimal upstream stand-in so the subsystem can be driven end to end from
/// one process.
struct DemoContext;

#[async_trait]
impl TaskCommunicatorContext for DemoContext {
    fn application_attempt_id(&self) -> ApplicationAttemptId {
        ApplicationAttemptId("appattempt-demo-1".to_string())
    }

    fn credentials(&self) -> Credentials {
        Credentials::default()
    }

    async fn can_commit(&self, attempt_id: &TaskAttemptId) -> Result<bool> {
        tracing::info!("Commit requested for attempt {}", attempt_id.0);
        Ok(true)
    }

    async fn heartbeat(&self, request: TaskHeartbeatRequest) -> Result<TaskHeartbeatResponse> {
        tracing::info!(
            "Heartbeat from attempt {} with {} events",
            request.attempt_id.0,
            request.events.len()
        );
        Ok(TaskHeartbeatResponse::default())
    }

    fn is_known_container(&self, _container_id: &ContainerId) -> bool {
        false
    }

    async fn task_started_remotely(&self, attempt_id: TaskAttemptId, container_id: ContainerId) {
        tracing::info!(
            "Attempt {} started on container {}",
            attempt_id.0,
            container_id.0
        );
    }
}

/// Demo payload: pulls its assignment over the in-process umbilical, reports
/// one progress heartbeat, and finishes.
struct DemoRunner {
    container_id: ContainerId,
    umbilical: Arc<UmbilicalEndpoint>,
}

#[async_trait]
impl TaskRunner for DemoRunner {
    async fn run(&self) -> Result<ExecutionResult> {
        let context = ContainerContext {
            container_identifier: self.container_id.0.clone(),
        };

        let mut task = self.umbilical.get_task(Some(context.clone())).await;
        let mut polls = 0;
        while !task.should_die && task.task_spec.is_none() {
            polls += 1;
            if polls > 20 {
                return Ok(ExecutionResult::failure(
                    ExitStatus::ExecutionFailure,
                    "no assignment showed up",
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            task = self.umbilical.get_task(Some(context.clone())).await;
        }
        if task.should_die {
            return Ok(ExecutionResult {
                exit_status: ExitStatus::AskedToDie,
                error_message: None,
                cause: None,
            });
        }
        let spec = task.task_spec.expect("delivery carries a spec");
        tracing::info!(
            "Container {} runs vertex {} for attempt {}",
            self.container_id.0,
            spec.vertex_name,
            spec.attempt_id.0
        );

        let response = self
            .umbilical
            .heartbeat(HeartbeatRequest {
                container_identifier: self.container_id.0.clone(),
                request_id: 1,
                current_attempt_id: Some(spec.attempt_id.clone()),
                events: vec![TaskEvent {
                    kind: "task-progress".to_string(),
                    payload: serde_json::json!({"progress": 1.0}),
                }],
                start_index: 0,
                max_events: 100,
            })
            .await?;
        tracing::info!(
            "Heartbeat acknowledged up to request {}",
            response.last_request_id
        );

        Ok(ExecutionResult::success())
    }
}

struct DemoRunnerFactory;

impl TaskRunnerFactory for DemoRunnerFactory {
    fn create_runner(
        &self,
        container_id: &ContainerId,
        _credentials: Credentials,
        umbilical: Arc<UmbilicalEndpoint>,
        _working_directory: &str,
        _local_directories: &[String],
    ) -> Result<Arc<dyn TaskRunner>> {
        Ok(Arc::new(DemoRunner {
            container_id: container_id.clone(),
            umbilical,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = AmConfig::from_env();
    config.validate()?;

    let context: Arc<dyn TaskCommunicatorContext> = Arc::new(DemoContext);
    let service = TaskCommunicatorService::new(context.clone(), &config);
    service.start().await?;

    if !config.local_mode {
        let address = service.address().expect("server address recorded");
        tracing::info!("Umbilical listening on {}", address);
        tracing::info!("Press Ctrl+C to shutdown");
        tokio::signal::ctrl_c().await?;
        service.stop().await;
        return Ok(());
    }

    // Local mode: run one container lifecycle on the in-process pool.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (history_tx, mut history_rx) = mpsc::unbounded_channel();
    let launcher = LocalContainerLauncher::new(
        Arc::new(DemoRunnerFactory),
        service.umbilical(),
        context.application_attempt_id(),
        &config,
        events_tx,
        history_tx,
    )?;
    launcher.start();

    let container_id = ContainerId("container-demo-1".to_string());
    let attempt_id = TaskAttemptId("attempt-demo-1".to_string());
    service.register_running_container(container_id.clone(), "localhost", 0)?;
    service.register_running_task_attempt(
        &container_id,
        TaskSpec {
            attempt_id: attempt_id.clone(),
            vertex_name: "demo-vertex".to_string(),
            payload: serde_json::json!({"input": "demo"}),
        },
        None,
        None,
        false,
    )?;

    launcher.handle(LauncherEvent::Launch {
        container_id: container_id.clone(),
        launch_context: ContainerLaunchContext::from_credentials(&Credentials::default())?,
    })?;

    while let Some(event) = events_rx.recv().await {
        tracing::info!("Lifecycle event: {:?}", event);
        if matches!(
            event,
            ContainerEvent::Completed { .. } | ContainerEvent::LaunchFailed { .. }
        ) {
            break;
        }
    }
    if let Ok(record) = tokio::time::timeout(Duration::from_secs(1), history_rx.recv()).await {
        tracing::info!("History record: {:?}", record);
    }

    service.unregister_running_task_attempt(&attempt_id);
    service.register_container_end(&container_id);
    launcher.shutdown().await;
    service.stop().await;
    Ok(())
}
