use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identity of one worker container.
/// Wrapper around an opaque string; compared by value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl ContainerId {
    /// Generates a fresh random UUID v4-based ContainerId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one execution try of one task; compared by value, hashable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskAttemptId(pub String);

impl TaskAttemptId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the application-master attempt this subsystem belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ApplicationAttemptId(pub String);

/// Descriptor of the work a container is asked to perform.
///
/// The body is opaque to the dispatch layer; only the attempt id and the
/// vertex name are interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub attempt_id: TaskAttemptId,
    pub vertex_name: String,
    pub payload: serde_json::Value,
}

/// Per-task side input, keyed by name in the assignment's resource map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalResource {
    pub uri: String,
    pub size: u64,
}

/// Security material associated with an assignment.
///
/// The session token doubles as the umbilical auth secret when service
/// authorization is enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    pub session_token: Option<String>,
    pub tokens: HashMap<String, String>,
}
