use super::protocol::*;
use crate::config::AmConfig;
use crate::registry::types::TaskAttemptId;

use anyhow::Result;
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;

/// Worker-side view of the umbilical for containers running out of process.
///
/// Only transport errors are retried, on a linear backoff with jitter taken
/// from the configured retry knobs. Protocol faults are returned as-is, so
/// the at-most-once delivery and duplicate-suppression guarantees of the
/// endpoint stay intact.
pub struct UmbilicalClient {
    base_url: String,
    session_token: Option<String>,
    http_client: reqwest::Client,
    request_timeout: Duration,
    retry_attempts: usize,
    retry_interval: Duration,
}

impl UmbilicalClient {
    pub fn new(address: SocketAddr, session_token: Option<String>) -> Self {
        Self::with_config(address, session_token, &AmConfig::default())
    }

    pub fn with_config(
        address: SocketAddr,
        session_token: Option<String>,
        config: &AmConfig,
    ) -> Self {
        Self {
            base_url: format!("http://{}", address),
            session_token,
            http_client: reqwest::Client::new(),
            request_timeout: Duration::from_millis(config.client_request_timeout_ms),
            retry_attempts: config.client_retry_attempts.max(1),
            retry_interval: Duration::from_millis(config.client_retry_interval_ms),
        }
    }

    pub async fn get_task(&self, container_context: &ContainerContext) -> Result<ContainerTask> {
        let response = self
            .post_json(ENDPOINT_GET_TASK, &Some(container_context))
            .await?;
        Self::parse(response).await
    }

    pub async fn can_commit(&self, attempt_id: &TaskAttemptId) -> Result<bool> {
        let payload = CanCommitRequest {
            attempt_id: attempt_id.clone(),
        };
        let response = self.post_json(ENDPOINT_CAN_COMMIT, &payload).await?;
        let response: CanCommitResponse = Self::parse(response).await?;
        Ok(response.can_commit)
    }

    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let response = self.post_json(ENDPOINT_HEARTBEAT, request).await?;
        Self::parse(response).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let fault = response
                .json::<FaultResponse>()
                .await
                .map(|fault| fault.error)
                .unwrap_or_else(|_| "unreadable fault body".to_string());
            return Err(anyhow::anyhow!("umbilical call failed ({}): {}", status, fault));
        }
        Ok(response.json().await?)
    }

    async fn post_json<T: serde::Serialize>(
        &self,
        endpoint: &str,
        payload: &T,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            let mut request = self
                .http_client
                .post(url.as_str())
                .json(payload)
                .timeout(self.request_timeout);
            if let Some(token) = &self.session_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(
                        "Umbilical call to {} failed in transport on attempt {}/{}: {}",
                        endpoint,
                        attempt,
                        self.retry_attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(anyhow::anyhow!(
            "umbilical endpoint {} unreachable after {} attempts: {}",
            endpoint,
            self.retry_attempts,
            last_error.expect("at least one attempt was made")
        ))
    }

    /// Linear backoff scaled by the attempt number, with up to half an
    /// interval of jitter so a fleet of workers does not retry in lockstep.
    fn backoff(&self, attempt: usize) -> Duration {
        let base_ms = self.retry_interval.as_millis() as u64 * attempt as u64;
        let jitter_ms = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base_ms / 2)
        };
        Duration::from_millis(base_ms + jitter_ms)
    }
}
