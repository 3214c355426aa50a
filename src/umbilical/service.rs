use super::context::TaskCommunicatorContext;
use super::endpoint::UmbilicalEndpoint;
use super::handlers::{
    UmbilicalListener, handle_can_commit, handle_get_task, handle_heartbeat,
};
use super::protocol::{ENDPOINT_CAN_COMMIT, ENDPOINT_GET_TASK, ENDPOINT_HEARTBEAT};
use crate::config::AmConfig;
use crate::registry::container_registry::{ContainerRegistry, RegistryError};
use crate::registry::types::{ContainerId, Credentials, LocalResource, TaskAttemptId, TaskSpec};

use anyhow::Result;
use axum::routing::post;
use axum::{Extension, Router};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

const SERVER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns the container registry and the umbilical endpoint, and exposes the
/// registration API consumed by the upstream scheduler.
///
/// Outside local mode, `start` binds an ephemeral port and serves the
/// umbilical over HTTP; in local mode a loopback address is synthesized and
/// workers reach the endpoint in-process via [`Self::umbilical`].
pub struct TaskCommunicatorService {
    local_mode: bool,
    listener_thread_count: usize,
    security_authorization: bool,
    registry: Arc<ContainerRegistry>,
    endpoint: Arc<UmbilicalEndpoint>,
    context: Arc<dyn TaskCommunicatorContext>,
    address: Mutex<Option<SocketAddr>>,
    session_token: Mutex<Option<String>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl TaskCommunicatorService {
    pub fn new(context: Arc<dyn TaskCommunicatorContext>, config: &AmConfig) -> Arc<Self> {
        let registry = ContainerRegistry::new();
        let endpoint = UmbilicalEndpoint::new(registry.clone(), context.clone());
        Arc::new(Self {
            local_mode: config.local_mode,
            listener_thread_count: config.listener_thread_count,
            security_authorization: config.security_authorization,
            registry,
            endpoint,
            context,
            address: Mutex::new(None),
            session_token: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            server: Mutex::new(None),
        })
    }

    pub async fn start(&self) -> Result<()> {
        if self.local_mode {
            let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
            *self.address.lock().expect("address lock poisoned") = Some(loopback);
            tracing::debug!("Not starting umbilical RPC server in local mode");
            return Ok(());
        }

        // The session token comes from upstream credentials; generate one if
        // the upstream carries none.
        let session_token = self
            .context
            .credentials()
            .session_token
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let listener_state = Arc::new(UmbilicalListener {
            endpoint: self.endpoint.clone(),
            permits: Semaphore::new(self.listener_thread_count),
            session_token: self
                .security_authorization
                .then(|| session_token.clone()),
        });

        let app = Router::new()
            .route(ENDPOINT_GET_TASK, post(handle_get_task))
            .route(ENDPOINT_CAN_COMMIT, post(handle_can_commit))
            .route(ENDPOINT_HEARTBEAT, post(handle_heartbeat))
            .layer(Extension(listener_state));

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let tcp_listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let bound = tcp_listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(e) = axum::serve(tcp_listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Umbilical RPC server failed: {}", e);
            }
        });

        tracing::info!(
            "Umbilical RPC server listening on {} with {} handler permits",
            bound,
            self.listener_thread_count
        );

        *self.address.lock().expect("address lock poisoned") = Some(bound);
        *self.session_token.lock().expect("token lock poisoned") = Some(session_token);
        *self.shutdown_tx.lock().expect("shutdown lock poisoned") = Some(shutdown_tx);
        *self.server.lock().expect("server lock poisoned") = Some(server);
        Ok(())
    }

    /// Stops the RPC listener. Registry entries remain, but no new calls are
    /// accepted.
    pub async fn stop(&self) {
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned")
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }
        let server = self.server.lock().expect("server lock poisoned").take();
        if let Some(server) = server {
            if tokio::time::timeout(SERVER_JOIN_TIMEOUT, server).await.is_err() {
                tracing::warn!("Umbilical RPC server did not stop within the join timeout");
            }
        }
    }

    /// Installs a fresh registry entry. `host` and `port` are informational
    /// only. A duplicate registration is fatal to the caller.
    pub fn register_running_container(
        &self,
        container_id: ContainerId,
        host: &str,
        port: u16,
    ) -> Result<(), RegistryError> {
        tracing::debug!(
            "Registering running container {} reported at {}:{}",
            container_id.0,
            host,
            port
        );
        self.registry.insert_container(container_id)
    }

    pub fn register_container_end(&self, container_id: &ContainerId) {
        if self.registry.remove_container(container_id).is_none() {
            tracing::warn!(
                "Container end for unregistered container {}",
                container_id.0
            );
        }
    }

    pub fn register_running_task_attempt(
        &self,
        container_id: &ContainerId,
        task_spec: TaskSpec,
        additional_resources: Option<HashMap<String, LocalResource>>,
        credentials: Option<Credentials>,
        credentials_changed: bool,
    ) -> Result<(), RegistryError> {
        self.registry.assign(
            container_id,
            task_spec,
            additional_resources,
            credentials,
            credentials_changed,
        )
    }

    pub fn unregister_running_task_attempt(&self, attempt_id: &TaskAttemptId) {
        self.registry.unassign(attempt_id);
    }

    /// The bound RPC address, or the synthetic loopback address in local
    /// mode. None until `start` has run.
    pub fn address(&self) -> Option<SocketAddr> {
        *self.address.lock().expect("address lock poisoned")
    }

    /// The secret remote workers must present when authorization is on.
    pub fn session_token(&self) -> Option<String> {
        self.session_token
            .lock()
            .expect("token lock poisoned")
            .clone()
    }

    /// In-process access to the umbilical, used by the local launcher and by
    /// payloads running inside the application master.
    pub fn umbilical(&self) -> Arc<UmbilicalEndpoint> {
        self.endpoint.clone()
    }
}
