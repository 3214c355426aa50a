use super::context::{TaskCommunicatorContext, TaskHeartbeatRequest};
use super::protocol::{ContainerContext, ContainerTask, HeartbeatRequest, HeartbeatResponse};
use crate::registry::container_registry::ContainerRegistry;
use crate::registry::types::{ContainerId, TaskAttemptId};

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UmbilicalError {
    #[error("attempt {0} is not recognized for heartbeat")]
    AttemptNotRecognized(TaskAttemptId),
    #[error("container {container} has invalid request id, expected {expected} actual {actual}")]
    InvalidSequence {
        container: ContainerId,
        expected: i64,
        actual: i64,
    },
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

/// Serves the three umbilical operations to worker containers.
///
/// The transport is supplied elsewhere (HTTP handlers for remote workers, a
/// direct reference for in-process ones); this type owns the semantics:
/// at-most-once task delivery per assignment and strict heartbeat
/// sequencing with duplicate replay.
pub struct UmbilicalEndpoint {
    registry: Arc<ContainerRegistry>,
    context: Arc<dyn TaskCommunicatorContext>,
}

impl UmbilicalEndpoint {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        context: Arc<dyn TaskCommunicatorContext>,
    ) -> Arc<Self> {
        Arc::new(Self { registry, context })
    }

    /// Hands the container its current assignment, at most once.
    pub async fn get_task(&self, container_context: Option<ContainerContext>) -> ContainerTask {
        let container_id = match container_context {
            Some(ctx) if !ctx.container_identifier.is_empty() => {
                ContainerId(ctx.container_identifier)
            }
            _ => {
                tracing::info!("Invalid task request with an empty container context");
                return ContainerTask::die_marker();
            }
        };

        tracing::debug!("Container {} asked for a task", container_id.0);
        let task = self.container_task(&container_id);

        // Upstream is notified outside the slot's critical section.
        if let Some(spec) = task.task_spec.as_ref().filter(|_| !task.should_die) {
            self.context
                .task_started_remotely(spec.attempt_id.clone(), container_id.clone())
                .await;
        }
        task
    }

    fn container_task(&self, container_id: &ContainerId) -> ContainerTask {
        let Some(slot) = self.registry.get(container_id) else {
            if self.context.is_known_container(container_id) {
                tracing::info!(
                    "Container {} is valid, but no longer registered, and will be killed",
                    container_id.0
                );
            } else {
                tracing::info!("Container {} is invalid and will be killed", container_id.0);
            }
            return ContainerTask::die_marker();
        };

        let mut state = slot.lock();
        match &state.task_spec {
            None => {
                tracing::debug!("No task assigned yet for running container {}", container_id.0);
                ContainerTask::no_task()
            }
            Some(spec) if state.task_pulled => {
                tracing::debug!(
                    "Task {} already sent to container {}",
                    spec.attempt_id.0,
                    container_id.0
                );
                ContainerTask::no_task()
            }
            Some(spec) => {
                let task = ContainerTask::delivery(
                    spec.clone(),
                    state.additional_resources.clone().unwrap_or_default(),
                    state.credentials.clone(),
                    state.credentials_changed,
                );
                state.task_pulled = true;
                task
            }
        }
    }

    /// Commit authorization, delegated upstream without local state changes.
    pub async fn can_commit(&self, attempt_id: &TaskAttemptId) -> anyhow::Result<bool> {
        self.context.can_commit(attempt_id).await
    }

    /// Processes one heartbeat: duplicate replay, ownership and sequence
    /// validation under the container's critical section, then the upstream
    /// callback outside it.
    pub async fn heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, UmbilicalError> {
        let container_id = ContainerId(request.container_identifier.clone());
        tracing::debug!(
            "Received heartbeat from container {} with request id {}",
            container_id.0,
            request.request_id
        );

        let Some(slot) = self.registry.get(&container_id) else {
            tracing::warn!(
                "Received task heartbeat from unknown container {}, asking it to die",
                container_id.0
            );
            return Ok(HeartbeatResponse {
                last_request_id: request.request_id,
                should_die: true,
                events: Vec::new(),
            });
        };

        {
            let state = slot.lock();
            if state.last_request_id == request.request_id {
                if let Some(last_response) = &state.last_response {
                    tracing::warn!(
                        "Old sequence id {} received from container {}, re-sending last response",
                        request.request_id,
                        container_id.0
                    );
                    return Ok(last_response.clone());
                }
            }
        }

        let mut upstream_response = None;
        if let Some(attempt_id) = &request.current_attempt_id {
            {
                let state = slot.lock();
                let owner = self.registry.container_for_attempt(attempt_id);
                if owner.as_ref() != Some(&container_id) {
                    return Err(UmbilicalError::AttemptNotRecognized(attempt_id.clone()));
                }
                if state.last_request_id + 1 != request.request_id {
                    return Err(UmbilicalError::InvalidSequence {
                        container: container_id,
                        expected: state.last_request_id + 1,
                        actual: request.request_id,
                    });
                }
            }

            let upstream_request = TaskHeartbeatRequest {
                container_identifier: request.container_identifier,
                attempt_id: attempt_id.clone(),
                events: request.events,
                start_index: request.start_index,
                max_events: request.max_events,
            };
            upstream_response = Some(self.context.heartbeat(upstream_request).await?);
        }

        // A fresh response is built even when upstream returned nothing, so
        // last_request_id keeps advancing.
        let response = HeartbeatResponse {
            last_request_id: request.request_id,
            should_die: false,
            events: upstream_response.map(|r| r.events).unwrap_or_default(),
        };

        let mut state = slot.lock();
        state.last_request_id = response.last_request_id;
        state.last_response = Some(response.clone());
        Ok(response)
    }
}
