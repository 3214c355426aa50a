use super::types::*;
use crate::umbilical::protocol::HeartbeatResponse;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("multiple registrations for container {0}")]
    AlreadyRegistered(ContainerId),
    #[error("container {0} is not registered")]
    UnknownContainer(ContainerId),
    #[error("container {container} already has assignment {existing}")]
    ContainerBusy {
        container: ContainerId,
        existing: TaskAttemptId,
    },
    #[error("attempt {attempt} is already assigned to container {existing}")]
    AttemptAlreadyAssigned {
        attempt: TaskAttemptId,
        existing: ContainerId,
    },
}

/// Mutable per-container state. Guarded by the owning `ContainerSlot` lock;
/// the assignment fields transition `None -> Some -> None` as a unit.
#[derive(Debug, Default)]
pub struct ContainerState {
    pub task_spec: Option<TaskSpec>,
    pub additional_resources: Option<HashMap<String, LocalResource>>,
    pub credentials: Option<Credentials>,
    pub credentials_changed: bool,
    pub task_pulled: bool,
    pub last_request_id: i64,
    pub last_response: Option<HeartbeatResponse>,
}

impl ContainerState {
    /// Clears the current assignment. Heartbeat bookkeeping survives so
    /// duplicate suppression keeps working across assignments.
    pub fn reset(&mut self) {
        self.task_spec = None;
        self.additional_resources = None;
        self.credentials = None;
        self.credentials_changed = false;
        self.task_pulled = false;
    }
}

/// One registered container: immutable identity plus its critical section.
pub struct ContainerSlot {
    pub container_id: ContainerId,
    state: Mutex<ContainerState>,
}

impl ContainerSlot {
    fn new(container_id: ContainerId) -> Arc<Self> {
        Arc::new(Self {
            container_id,
            state: Mutex::new(ContainerState::default()),
        })
    }

    /// Enters the container's critical section. Guards must never be held
    /// across an await point or an upstream callback.
    pub fn lock(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().expect("container state lock poisoned")
    }
}

/// Tracks live containers and the attempt currently assigned to each.
///
/// Two tables: `containers` maps a container to its slot, `attempts` is the
/// fan-in index from an attempt id back to the container executing it. Both
/// tables are read lock-free; writes that touch both happen under the owning
/// slot's critical section with compare-and-insert on `attempts`.
pub struct ContainerRegistry {
    containers: DashMap<ContainerId, Arc<ContainerSlot>>,
    attempts: DashMap<TaskAttemptId, ContainerId>,
}

impl ContainerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: DashMap::new(),
            attempts: DashMap::new(),
        })
    }

    /// Installs a fresh slot for `container_id`.
    pub fn insert_container(&self, container_id: ContainerId) -> Result<(), RegistryError> {
        match self.containers.entry(container_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(container_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(ContainerSlot::new(container_id));
                Ok(())
            }
        }
    }

    /// Removes the container and tears down any attempt entry pointing at it.
    ///
    /// The container entry is claimed first, so a concurrent observer that
    /// still sees the attempt entry resolves the container to "unknown" and
    /// treats the attempt as gone.
    pub fn remove_container(&self, container_id: &ContainerId) -> Option<Arc<ContainerSlot>> {
        let (_, slot) = self.containers.remove(container_id)?;
        {
            let state = slot.lock();
            if let Some(spec) = &state.task_spec {
                self.attempts
                    .remove_if(&spec.attempt_id, |_, owner| owner == container_id);
            }
        }
        Some(slot)
    }

    pub fn get(&self, container_id: &ContainerId) -> Option<Arc<ContainerSlot>> {
        self.containers
            .get(container_id)
            .map(|entry| entry.value().clone())
    }

    pub fn container_for_attempt(&self, attempt_id: &TaskAttemptId) -> Option<ContainerId> {
        self.attempts
            .get(attempt_id)
            .map(|entry| entry.value().clone())
    }

    /// Installs an assignment on a registered, idle container and records the
    /// attempt mapping, all under the container's critical section.
    pub fn assign(
        &self,
        container_id: &ContainerId,
        task_spec: TaskSpec,
        additional_resources: Option<HashMap<String, LocalResource>>,
        credentials: Option<Credentials>,
        credentials_changed: bool,
    ) -> Result<(), RegistryError> {
        let slot = self
            .get(container_id)
            .ok_or_else(|| RegistryError::UnknownContainer(container_id.clone()))?;

        let mut state = slot.lock();
        if let Some(existing) = &state.task_spec {
            return Err(RegistryError::ContainerBusy {
                container: container_id.clone(),
                existing: existing.attempt_id.clone(),
            });
        }

        match self.attempts.entry(task_spec.attempt_id.clone()) {
            Entry::Occupied(occupied) => {
                return Err(RegistryError::AttemptAlreadyAssigned {
                    attempt: task_spec.attempt_id.clone(),
                    existing: occupied.get().clone(),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(container_id.clone());
            }
        }

        tracing::debug!(
            "Assigned attempt {} to container {}",
            task_spec.attempt_id.0,
            container_id.0
        );

        state.task_spec = Some(task_spec);
        state.additional_resources = additional_resources;
        state.credentials = credentials;
        state.credentials_changed = credentials_changed;
        state.task_pulled = false;
        Ok(())
    }

    /// Clears the assignment matched by `attempt_id` and drops the attempt
    /// entry. Missing entries are tolerated and logged.
    pub fn unassign(&self, attempt_id: &TaskAttemptId) {
        let Some((_, container_id)) = self.attempts.remove(attempt_id) else {
            tracing::warn!("Unassign for attempt {} with no known container", attempt_id.0);
            return;
        };
        let Some(slot) = self.get(&container_id) else {
            tracing::warn!(
                "Unassign for attempt {} from non-registered container {}",
                attempt_id.0,
                container_id.0
            );
            return;
        };

        let mut state = slot.lock();
        match &state.task_spec {
            Some(spec) if spec.attempt_id == *attempt_id => state.reset(),
            _ => tracing::warn!(
                "Unassign for attempt {} no longer matches container {}",
                attempt_id.0,
                container_id.0
            ),
        }
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }
}
