//! HTTP handlers for the umbilical protocol.
//!
//! Thin axum adapters over `UmbilicalEndpoint`: they enforce the session
//! token when authorization is enabled, cap in-flight requests at the
//! configured listener width, and translate endpoint faults into HTTP
//! status codes the worker sees as RPC failures.

use super::endpoint::{UmbilicalEndpoint, UmbilicalError};
use super::protocol::*;

use axum::http::{HeaderMap, StatusCode, header};
use axum::{Extension, Json};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Shared state of the umbilical RPC listener.
pub struct UmbilicalListener {
    pub endpoint: Arc<UmbilicalEndpoint>,
    pub permits: Semaphore,
    /// When set, requests must carry this bearer token.
    pub session_token: Option<String>,
}

type Fault = (StatusCode, Json<FaultResponse>);

fn fault(status: StatusCode, error: impl Into<String>) -> Fault {
    (status, Json(FaultResponse { error: error.into() }))
}

fn authorize(listener: &UmbilicalListener, headers: &HeaderMap) -> Result<(), Fault> {
    let Some(expected) = &listener.session_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(value) if value == format!("Bearer {expected}") => Ok(()),
        _ => {
            tracing::warn!("Rejected umbilical call with a missing or invalid session token");
            Err(fault(
                StatusCode::UNAUTHORIZED,
                "missing or invalid session token",
            ))
        }
    }
}

pub async fn handle_get_task(
    Extension(listener): Extension<Arc<UmbilicalListener>>,
    headers: HeaderMap,
    Json(container_context): Json<Option<ContainerContext>>,
) -> Result<Json<ContainerTask>, Fault> {
    authorize(&listener, &headers)?;
    let _permit = listener
        .permits
        .acquire()
        .await
        .map_err(|_| fault(StatusCode::SERVICE_UNAVAILABLE, "listener is shut down"))?;

    let task = listener.endpoint.get_task(container_context).await;
    Ok(Json(task))
}

pub async fn handle_can_commit(
    Extension(listener): Extension<Arc<UmbilicalListener>>,
    headers: HeaderMap,
    Json(request): Json<CanCommitRequest>,
) -> Result<Json<CanCommitResponse>, Fault> {
    authorize(&listener, &headers)?;
    let _permit = listener
        .permits
        .acquire()
        .await
        .map_err(|_| fault(StatusCode::SERVICE_UNAVAILABLE, "listener is shut down"))?;

    match listener.endpoint.can_commit(&request.attempt_id).await {
        Ok(can_commit) => Ok(Json(CanCommitResponse { can_commit })),
        Err(e) => {
            tracing::error!("canCommit for attempt {} failed: {}", request.attempt_id.0, e);
            Err(fault(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn handle_heartbeat(
    Extension(listener): Extension<Arc<UmbilicalListener>>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, Fault> {
    authorize(&listener, &headers)?;
    let _permit = listener
        .permits
        .acquire()
        .await
        .map_err(|_| fault(StatusCode::SERVICE_UNAVAILABLE, "listener is shut down"))?;

    match listener.endpoint.heartbeat(request).await {
        Ok(response) => Ok(Json(response)),
        Err(e @ UmbilicalError::AttemptNotRecognized(_))
        | Err(e @ UmbilicalError::InvalidSequence { .. }) => {
            Err(fault(StatusCode::CONFLICT, e.to_string()))
        }
        Err(UmbilicalError::Upstream(e)) => {
            tracing::error!("Heartbeat processing failed upstream: {}", e);
            Err(fault(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
