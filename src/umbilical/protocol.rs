use crate::registry::types::{Credentials, LocalResource, TaskAttemptId, TaskSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Endpoints
pub const ENDPOINT_GET_TASK: &str = "/umbilical/get_task";
pub const ENDPOINT_CAN_COMMIT: &str = "/umbilical/can_commit";
pub const ENDPOINT_HEARTBEAT: &str = "/umbilical/heartbeat";

/// Identity a worker presents when pulling its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerContext {
    pub container_identifier: String,
}

/// Outcome of a get_task call, tagged through its fields:
/// - die marker: `should_die` with no spec,
/// - no task: neither `should_die` nor a spec,
/// - delivery: a spec plus the assignment's resources and credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerTask {
    pub should_die: bool,
    pub task_spec: Option<TaskSpec>,
    pub additional_resources: HashMap<String, LocalResource>,
    pub credentials: Option<Credentials>,
    pub credentials_changed: bool,
}

impl ContainerTask {
    pub fn die_marker() -> Self {
        Self {
            should_die: true,
            task_spec: None,
            additional_resources: HashMap::new(),
            credentials: None,
            credentials_changed: false,
        }
    }

    pub fn no_task() -> Self {
        Self {
            should_die: false,
            task_spec: None,
            additional_resources: HashMap::new(),
            credentials: None,
            credentials_changed: false,
        }
    }

    pub fn delivery(
        task_spec: TaskSpec,
        additional_resources: HashMap<String, LocalResource>,
        credentials: Option<Credentials>,
        credentials_changed: bool,
    ) -> Self {
        Self {
            should_die: false,
            task_spec: Some(task_spec),
            additional_resources,
            credentials,
            credentials_changed,
        }
    }

    pub fn is_delivery(&self) -> bool {
        !self.should_die && self.task_spec.is_some()
    }
}

/// One progress or status event carried over the umbilical. The payload is
/// opaque to the dispatch layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub kind: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub container_identifier: String,
    pub request_id: i64,
    pub current_attempt_id: Option<TaskAttemptId>,
    pub events: Vec<TaskEvent>,
    pub start_index: i32,
    pub max_events: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatResponse {
    pub last_request_id: i64,
    pub should_die: bool,
    pub events: Vec<TaskEvent>,
}

// Commit authorization (delegated upstream, no local state)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanCommitRequest {
    pub attempt_id: TaskAttemptId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanCommitResponse {
    pub can_commit: bool,
}

/// Error body returned to workers when an umbilical call faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultResponse {
    pub error: String,
}
