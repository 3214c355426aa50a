//! Configuration knobs for the dispatch subsystem.
//!
//! Values are read from the environment the way the rest of the process
//! reads its tuning knobs; anything unset falls back to a default.

use anyhow::Result;

const DEFAULT_LISTENER_THREAD_COUNT: usize = 30;
const DEFAULT_INLINE_EXECUTOR_MAX_TASKS: usize = 1;
const DEFAULT_CLIENT_REQUEST_TIMEOUT_MS: u64 = 500;
const DEFAULT_CLIENT_RETRY_ATTEMPTS: usize = 4;
const DEFAULT_CLIENT_RETRY_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct AmConfig {
    /// Run without an external resource manager: no RPC server is started
    /// and task payloads execute in-process.
    pub local_mode: bool,
    /// Maximum number of umbilical requests serviced concurrently.
    pub listener_thread_count: usize,
    /// Size of the in-process worker pool used in local mode.
    pub inline_executor_max_tasks: usize,
    /// Require the session token on every umbilical call.
    pub security_authorization: bool,
    pub working_directory: String,
    pub local_directories: Vec<String>,
    /// Per-request timeout for worker-side umbilical calls.
    pub client_request_timeout_ms: u64,
    /// How often a worker retries an umbilical call that failed in
    /// transport. Protocol faults are never retried.
    pub client_retry_attempts: usize,
    /// Base wait between retries; the actual wait grows with each attempt.
    pub client_retry_interval_ms: u64,
}

impl Default for AmConfig {
    fn default() -> Self {
        Self {
            local_mode: false,
            listener_thread_count: DEFAULT_LISTENER_THREAD_COUNT,
            inline_executor_max_tasks: DEFAULT_INLINE_EXECUTOR_MAX_TASKS,
            security_authorization: false,
            working_directory: ".".to_string(),
            local_directories: Vec::new(),
            client_request_timeout_ms: DEFAULT_CLIENT_REQUEST_TIMEOUT_MS,
            client_retry_attempts: DEFAULT_CLIENT_RETRY_ATTEMPTS,
            client_retry_interval_ms: DEFAULT_CLIENT_RETRY_INTERVAL_MS,
        }
    }
}

impl AmConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            local_mode: std::env::var("AM_LOCAL_MODE")
                .ok()
                .and_then(|value| value.parse::<bool>().ok())
                .unwrap_or(defaults.local_mode),
            listener_thread_count: std::env::var("AM_TASK_LISTENER_THREAD_COUNT")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(defaults.listener_thread_count),
            inline_executor_max_tasks: std::env::var("AM_INLINE_EXECUTOR_MAX_TASKS")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(defaults.inline_executor_max_tasks),
            security_authorization: std::env::var("AM_SECURITY_AUTHORIZATION")
                .ok()
                .and_then(|value| value.parse::<bool>().ok())
                .unwrap_or(defaults.security_authorization),
            working_directory: std::env::var("AM_WORKING_DIR")
                .unwrap_or(defaults.working_directory),
            local_directories: std::env::var("AM_LOCAL_DIRS")
                .map(|value| {
                    value
                        .split(',')
                        .filter(|dir| !dir.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.local_directories),
            client_request_timeout_ms: std::env::var("AM_CLIENT_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(defaults.client_request_timeout_ms),
            client_retry_attempts: std::env::var("AM_CLIENT_RETRY_ATTEMPTS")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(defaults.client_retry_attempts),
            client_retry_interval_ms: std::env::var("AM_CLIENT_RETRY_INTERVAL_MS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(defaults.client_retry_interval_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.listener_thread_count >= 1,
            "listener thread count must be at least 1"
        );
        anyhow::ensure!(
            self.inline_executor_max_tasks >= 1,
            "must have at least 1 executor"
        );
        anyhow::ensure!(
            self.client_retry_attempts >= 1,
            "client retry attempts must be at least 1"
        );
        Ok(())
    }
}
