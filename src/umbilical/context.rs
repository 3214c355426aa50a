use super::protocol::TaskEvent;
use crate::registry::types::{ApplicationAttemptId, ContainerId, Credentials, TaskAttemptId};

use anyhow::Result;
use async_trait::async_trait;

/// Heartbeat payload forwarded upstream once the umbilical has validated the
/// container, attempt ownership, and request sequencing.
#[derive(Debug, Clone)]
pub struct TaskHeartbeatRequest {
    pub container_identifier: String,
    pub attempt_id: TaskAttemptId,
    pub events: Vec<TaskEvent>,
    pub start_index: i32,
    pub max_events: i32,
}

#[derive(Debug, Clone, Default)]
pub struct TaskHeartbeatResponse {
    pub events: Vec<TaskEvent>,
}

/// Upstream collaborator consumed by the umbilical endpoint.
///
/// Implementations must tolerate being called concurrently. The endpoint
/// guarantees in return that no registry lock is held during any of these
/// calls, so implementations are free to call back into the dispatch layer.
#[async_trait]
pub trait TaskCommunicatorContext: Send + Sync {
    fn application_attempt_id(&self) -> ApplicationAttemptId;

    fn credentials(&self) -> Credentials;

    async fn can_commit(&self, attempt_id: &TaskAttemptId) -> Result<bool>;

    async fn heartbeat(&self, request: TaskHeartbeatRequest) -> Result<TaskHeartbeatResponse>;

    /// Whether the upstream ever allocated this container. Consulted only to
    /// classify log output for pulls from unregistered containers.
    fn is_known_container(&self, container_id: &ContainerId) -> bool;

    async fn task_started_remotely(&self, attempt_id: TaskAttemptId, container_id: ContainerId);
}
