use crate::registry::types::{ApplicationAttemptId, ContainerId, Credentials};
use crate::umbilical::endpoint::UmbilicalEndpoint;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Exit disposition of a task payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    ExecutionFailure,
    Interrupted,
    AskedToDie,
}

impl ExitStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::ExecutionFailure => 1,
            ExitStatus::Interrupted => 2,
            ExitStatus::AskedToDie => 3,
        }
    }
}

/// What a payload reports when it finishes on its own. When no explicit
/// error message is set, the underlying cause stands in for it.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_status: ExitStatus,
    pub error_message: Option<String>,
    pub cause: Option<String>,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            exit_status: ExitStatus::Success,
            error_message: None,
            cause: None,
        }
    }

    pub fn failure(exit_status: ExitStatus, error_message: impl Into<String>) -> Self {
        Self {
            exit_status,
            error_message: Some(error_message.into()),
            cause: None,
        }
    }

    pub fn failure_caused_by(exit_status: ExitStatus, cause: impl Into<String>) -> Self {
        Self {
            exit_status,
            error_message: None,
            cause: Some(cause.into()),
        }
    }
}

/// Opaque unit of work executed by the local worker pool. The dispatch layer
/// never inspects what `run` does; it only observes the result.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self) -> Result<ExecutionResult>;
}

/// Builds the payload for one container launch, binding it to the container
/// identity, the in-process umbilical, and the execution directories.
pub trait TaskRunnerFactory: Send + Sync {
    fn create_runner(
        &self,
        container_id: &ContainerId,
        credentials: Credentials,
        umbilical: Arc<UmbilicalEndpoint>,
        working_directory: &str,
        local_directories: &[String],
    ) -> Result<Arc<dyn TaskRunner>>;
}

/// Launch-context tokens handed over by the upstream scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLaunchContext {
    pub tokens: Vec<u8>,
}

impl ContainerLaunchContext {
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        Ok(Self {
            tokens: serde_json::to_vec(credentials)?,
        })
    }

    pub fn parse_credentials(&self) -> Result<Credentials> {
        Ok(serde_json::from_slice(&self.tokens)?)
    }
}

/// Requests accepted by the launcher's event loop.
#[derive(Debug, Clone)]
pub enum LauncherEvent {
    Launch {
        container_id: ContainerId,
        launch_context: ContainerLaunchContext,
    },
    Stop {
        container_id: ContainerId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    ContainerExited,
    ApplicationError,
}

/// Lifecycle events the launcher emits toward the upstream state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    LaunchFailed {
        container_id: ContainerId,
        message: String,
    },
    Launched {
        container_id: ContainerId,
    },
    Completed {
        container_id: ContainerId,
        exit_code: i32,
        message: Option<String>,
        cause: TerminationCause,
    },
    StopSent {
        container_id: ContainerId,
    },
}

/// History record written once a container has a pool slot to execute in.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerLaunchedRecord {
    pub container_id: ContainerId,
    pub launch_time_ms: u64,
    pub application_attempt_id: ApplicationAttemptId,
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}
