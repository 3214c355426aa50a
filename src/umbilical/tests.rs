//! Umbilical Module Tests
//!
//! Exercises the worker-facing dispatch contract end to end.
//!
//! ## Test Scopes
//! - **Task pull**: at-most-once delivery, unknown-container die markers.
//! - **Heartbeats**: strict sequencing, duplicate replay, fault paths.
//! - **Callback discipline**: upstream callbacks run without registry locks.
//! - **Service**: local-mode startup and the HTTP listener with auth.

#[cfg(test)]
mod tests {
    use crate::config::AmConfig;
    use crate::registry::container_registry::ContainerRegistry;
    use crate::registry::types::{
        ApplicationAttemptId, ContainerId, Credentials, LocalResource, TaskAttemptId, TaskSpec,
    };
    use crate::umbilical::client::UmbilicalClient;
    use crate::umbilical::context::{
        TaskCommunicatorContext, TaskHeartbeatRequest, TaskHeartbeatResponse,
    };
    use crate::umbilical::endpoint::{UmbilicalEndpoint, UmbilicalError};
    use crate::umbilical::protocol::{ContainerContext, HeartbeatRequest, TaskEvent};
    use crate::umbilical::service::TaskCommunicatorService;

    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockContext {
        heartbeat_calls: AtomicUsize,
        commit_allowed: bool,
        session_token: Option<String>,
        started: Mutex<Vec<(TaskAttemptId, ContainerId)>>,
    }

    impl MockContext {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                heartbeat_calls: AtomicUsize::new(0),
                commit_allowed: true,
                session_token: None,
                started: Mutex::new(Vec::new()),
            })
        }

        fn with_session_token(token: &str) -> Arc<Self> {
            Arc::new(Self {
                heartbeat_calls: AtomicUsize::new(0),
                commit_allowed: true,
                session_token: Some(token.to_string()),
                started: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskCommunicatorContext for MockContext {
        fn application_attempt_id(&self) -> ApplicationAttemptId {
            ApplicationAttemptId("appattempt-1".to_string())
        }

        fn credentials(&self) -> Credentials {
            Credentials {
                session_token: self.session_token.clone(),
                tokens: HashMap::new(),
            }
        }

        async fn can_commit(&self, _attempt_id: &TaskAttemptId) -> Result<bool> {
            Ok(self.commit_allowed)
        }

        async fn heartbeat(&self, request: TaskHeartbeatRequest) -> Result<TaskHeartbeatResponse> {
            self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
            // Echo the reported events back as the scheduled ones.
            Ok(TaskHeartbeatResponse {
                events: request.events,
            })
        }

        fn is_known_container(&self, _container_id: &ContainerId) -> bool {
            false
        }

        async fn task_started_remotely(
            &self,
            attempt_id: TaskAttemptId,
            container_id: ContainerId,
        ) {
            self.started
                .lock()
                .unwrap()
                .push((attempt_id, container_id));
        }
    }

    fn spec(attempt: &str) -> TaskSpec {
        TaskSpec {
            attempt_id: TaskAttemptId(attempt.to_string()),
            vertex_name: "map-1".to_string(),
            payload: serde_json::json!({"input": "split-0"}),
        }
    }

    fn container_context(id: &str) -> ContainerContext {
        ContainerContext {
            container_identifier: id.to_string(),
        }
    }

    fn heartbeat_request(
        container: &str,
        request_id: i64,
        attempt: Option<&str>,
        events: Vec<TaskEvent>,
    ) -> HeartbeatRequest {
        HeartbeatRequest {
            container_identifier: container.to_string(),
            request_id,
            current_attempt_id: attempt.map(|a| TaskAttemptId(a.to_string())),
            events,
            start_index: 0,
            max_events: 100,
        }
    }

    fn progress_event(kind: &str) -> TaskEvent {
        TaskEvent {
            kind: kind.to_string(),
            payload: serde_json::json!({"progress": 0.5}),
        }
    }

    fn setup() -> (Arc<ContainerRegistry>, Arc<MockContext>, Arc<UmbilicalEndpoint>) {
        let registry = ContainerRegistry::new();
        let context = MockContext::new();
        let endpoint = UmbilicalEndpoint::new(registry.clone(), context.clone());
        (registry, context, endpoint)
    }

    // ============================================================
    // TASK PULL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_get_task_happy_path() {
        let (registry, context, endpoint) = setup();
        let c1 = ContainerId("c1".to_string());
        registry.insert_container(c1.clone()).unwrap();
        registry.assign(&c1, spec("a1"), None, None, false).unwrap();

        // First pull delivers the assignment.
        let task = endpoint.get_task(Some(container_context("c1"))).await;
        assert!(!task.should_die);
        let delivered = task.task_spec.expect("first pull should deliver the task");
        assert_eq!(delivered.attempt_id, TaskAttemptId("a1".to_string()));

        // The upstream was told, outside any lock.
        let started = context.started.lock().unwrap().clone();
        assert_eq!(started, vec![(TaskAttemptId("a1".to_string()), c1)]);

        // Second pull finds nothing.
        let task = endpoint.get_task(Some(container_context("c1"))).await;
        assert!(!task.should_die);
        assert!(task.task_spec.is_none());
    }

    #[tokio::test]
    async fn test_get_task_after_unassign_returns_no_task() {
        let (registry, _context, endpoint) = setup();
        let c1 = ContainerId("c1".to_string());
        registry.insert_container(c1.clone()).unwrap();
        registry.assign(&c1, spec("a1"), None, None, false).unwrap();

        let task = endpoint.get_task(Some(container_context("c1"))).await;
        assert!(task.is_delivery());

        registry.unassign(&TaskAttemptId("a1".to_string()));
        let task = endpoint.get_task(Some(container_context("c1"))).await;
        assert!(!task.should_die);
        assert!(task.task_spec.is_none());
    }

    #[tokio::test]
    async fn test_get_task_unknown_container_asks_to_die() {
        let (_registry, context, endpoint) = setup();

        let task = endpoint.get_task(Some(container_context("c42"))).await;
        assert!(task.should_die);
        assert!(task.task_spec.is_none());
        assert!(context.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_task_empty_context_asks_to_die() {
        let (_registry, _context, endpoint) = setup();

        let task = endpoint.get_task(None).await;
        assert!(task.should_die);

        let task = endpoint.get_task(Some(container_context(""))).await;
        assert!(task.should_die);
    }

    #[tokio::test]
    async fn test_get_task_carries_resources_and_credentials() {
        let (registry, _context, endpoint) = setup();
        let c1 = ContainerId("c1".to_string());
        registry.insert_container(c1.clone()).unwrap();

        let mut resources = HashMap::new();
        resources.insert(
            "side-input".to_string(),
            LocalResource {
                uri: "file:///tmp/side-input".to_string(),
                size: 128,
            },
        );
        let credentials = Credentials {
            session_token: Some("secret".to_string()),
            tokens: HashMap::new(),
        };
        registry
            .assign(&c1, spec("a1"), Some(resources), Some(credentials), true)
            .unwrap();

        let task = endpoint.get_task(Some(container_context("c1"))).await;
        assert!(task.is_delivery());
        assert_eq!(task.additional_resources.len(), 1);
        assert_eq!(
            task.additional_resources["side-input"].uri,
            "file:///tmp/side-input"
        );
        assert!(task.credentials_changed);
        assert_eq!(
            task.credentials.unwrap().session_token,
            Some("secret".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_pulls_deliver_exactly_once() {
        let (registry, _context, endpoint) = setup();
        let c1 = ContainerId("c1".to_string());
        registry.insert_container(c1.clone()).unwrap();
        registry.assign(&c1, spec("a1"), None, None, false).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let endpoint = endpoint.clone();
            handles.push(tokio::spawn(async move {
                endpoint.get_task(Some(container_context("c1"))).await
            }));
        }

        let mut deliveries = 0;
        for handle in handles {
            let task = handle.await.unwrap();
            assert!(!task.should_die);
            if task.is_delivery() {
                deliveries += 1;
            }
        }
        assert_eq!(deliveries, 1, "The assignment must be delivered exactly once");
    }

    // ============================================================
    // HEARTBEAT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_heartbeat_advances_and_returns_upstream_events() {
        let (registry, context, endpoint) = setup();
        let c1 = ContainerId("c1".to_string());
        registry.insert_container(c1.clone()).unwrap();
        registry.assign(&c1, spec("a1"), None, None, false).unwrap();
        endpoint.get_task(Some(container_context("c1"))).await;

        let response = endpoint
            .heartbeat(heartbeat_request(
                "c1",
                1,
                Some("a1"),
                vec![progress_event("task-progress")],
            ))
            .await
            .unwrap();

        assert_eq!(response.last_request_id, 1);
        assert!(!response.should_die);
        assert_eq!(response.events, vec![progress_event("task-progress")]);
        assert_eq!(context.heartbeat_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_heartbeat_replays_cached_response() {
        let (registry, context, endpoint) = setup();
        let c1 = ContainerId("c1".to_string());
        registry.insert_container(c1.clone()).unwrap();
        registry.assign(&c1, spec("a1"), None, None, false).unwrap();
        endpoint.get_task(Some(container_context("c1"))).await;

        let first = endpoint
            .heartbeat(heartbeat_request(
                "c1",
                1,
                Some("a1"),
                vec![progress_event("task-progress")],
            ))
            .await
            .unwrap();

        // Exact retry of the same request id.
        let replay = endpoint
            .heartbeat(heartbeat_request(
                "c1",
                1,
                Some("a1"),
                vec![progress_event("task-progress")],
            ))
            .await
            .unwrap();

        assert_eq!(replay, first, "Replay must be identical to the original");
        assert_eq!(
            context.heartbeat_calls.load(Ordering::SeqCst),
            1,
            "The duplicate must not reach upstream"
        );
    }

    #[tokio::test]
    async fn test_out_of_order_heartbeat_is_a_fault() {
        let (registry, _context, endpoint) = setup();
        let c1 = ContainerId("c1".to_string());
        registry.insert_container(c1.clone()).unwrap();
        registry.assign(&c1, spec("a1"), None, None, false).unwrap();
        endpoint.get_task(Some(container_context("c1"))).await;

        endpoint
            .heartbeat(heartbeat_request("c1", 1, Some("a1"), vec![]))
            .await
            .unwrap();

        // Skipping ahead is rejected.
        let result = endpoint
            .heartbeat(heartbeat_request("c1", 3, Some("a1"), vec![]))
            .await;
        match result {
            Err(UmbilicalError::InvalidSequence {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected InvalidSequence, got {:?}", other.map(|_| ())),
        }

        // The sequence did not advance; id 2 is still the next one.
        let response = endpoint
            .heartbeat(heartbeat_request("c1", 2, Some("a1"), vec![]))
            .await
            .unwrap();
        assert_eq!(response.last_request_id, 2);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_container_asks_to_die() {
        let (_registry, context, endpoint) = setup();

        let response = endpoint
            .heartbeat(heartbeat_request("c42", 5, None, vec![]))
            .await
            .unwrap();

        assert!(response.should_die);
        assert_eq!(response.last_request_id, 5);
        assert_eq!(context.heartbeat_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_foreign_attempt_is_a_fault() {
        let (registry, _context, endpoint) = setup();
        let c1 = ContainerId("c1".to_string());
        let c2 = ContainerId("c2".to_string());
        registry.insert_container(c1.clone()).unwrap();
        registry.insert_container(c2.clone()).unwrap();
        registry.assign(&c1, spec("a1"), None, None, false).unwrap();

        // c2 claims an attempt that belongs to c1.
        let result = endpoint
            .heartbeat(heartbeat_request("c2", 1, Some("a1"), vec![]))
            .await;
        assert!(matches!(
            result,
            Err(UmbilicalError::AttemptNotRecognized(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_heartbeat_skips_upstream() {
        let (registry, context, endpoint) = setup();
        let c1 = ContainerId("c1".to_string());
        registry.insert_container(c1.clone()).unwrap();

        let response = endpoint
            .heartbeat(heartbeat_request("c1", 1, None, vec![]))
            .await
            .unwrap();

        assert!(!response.should_die);
        assert_eq!(response.last_request_id, 1);
        assert!(response.events.is_empty());
        assert_eq!(context.heartbeat_calls.load(Ordering::SeqCst), 0);

        // The idle heartbeat still advanced the sequence.
        let response = endpoint
            .heartbeat(heartbeat_request("c1", 1, None, vec![]))
            .await
            .unwrap();
        assert_eq!(response.last_request_id, 1, "Duplicate of the idle beat replays");
    }

    #[tokio::test]
    async fn test_can_commit_delegates_upstream() {
        let (_registry, _context, endpoint) = setup();
        let allowed = endpoint
            .can_commit(&TaskAttemptId("a1".to_string()))
            .await
            .unwrap();
        assert!(allowed);
    }

    // ============================================================
    // CALLBACK DISCIPLINE TESTS
    // ============================================================

    /// Upstream context that mutates the registry from inside its own
    /// heartbeat callback. If the endpoint held a registry lock across the
    /// callback, this would deadlock on the heartbeating container's slot.
    struct ReentrantContext {
        registry: Mutex<Option<Arc<ContainerRegistry>>>,
    }

    #[async_trait]
    impl TaskCommunicatorContext for ReentrantContext {
        fn application_attempt_id(&self) -> ApplicationAttemptId {
            ApplicationAttemptId("appattempt-1".to_string())
        }

        fn credentials(&self) -> Credentials {
            Credentials::default()
        }

        async fn can_commit(&self, _attempt_id: &TaskAttemptId) -> Result<bool> {
            Ok(true)
        }

        async fn heartbeat(&self, request: TaskHeartbeatRequest) -> Result<TaskHeartbeatResponse> {
            let registry = self
                .registry
                .lock()
                .unwrap()
                .clone()
                .expect("registry not wired");
            // Touch the caller's own slot: requires that no lock is held.
            let container = ContainerId(request.container_identifier.clone());
            let slot = registry.get(&container).expect("container registered");
            let pulled = slot.lock().task_pulled;
            assert!(pulled);
            // And mutate unrelated registry state.
            registry
                .insert_container(ContainerId("reentrant".to_string()))
                .unwrap();
            Ok(TaskHeartbeatResponse::default())
        }

        fn is_known_container(&self, _container_id: &ContainerId) -> bool {
            true
        }

        async fn task_started_remotely(
            &self,
            _attempt_id: TaskAttemptId,
            container_id: ContainerId,
        ) {
            let registry = self
                .registry
                .lock()
                .unwrap()
                .clone()
                .expect("registry not wired");
            // Same re-entrancy requirement on the task-pull path.
            let slot = registry.get(&container_id).expect("container registered");
            assert!(slot.lock().task_pulled);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upstream_callbacks_run_without_registry_locks() {
        let registry = ContainerRegistry::new();
        let context = Arc::new(ReentrantContext {
            registry: Mutex::new(Some(registry.clone())),
        });
        let endpoint = UmbilicalEndpoint::new(registry.clone(), context);

        let c1 = ContainerId("c1".to_string());
        registry.insert_container(c1.clone()).unwrap();
        registry.assign(&c1, spec("a1"), None, None, false).unwrap();

        let exercise = async {
            let task = endpoint.get_task(Some(container_context("c1"))).await;
            assert!(task.is_delivery());
            endpoint
                .heartbeat(heartbeat_request("c1", 1, Some("a1"), vec![]))
                .await
                .unwrap();
        };
        tokio::time::timeout(Duration::from_secs(5), exercise)
            .await
            .expect("reentrant callbacks must not deadlock");

        assert!(registry.get(&ContainerId("reentrant".to_string())).is_some());
    }

    // ============================================================
    // SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_local_mode_synthesizes_loopback_address() {
        let config = AmConfig {
            local_mode: true,
            ..AmConfig::default()
        };
        let service = TaskCommunicatorService::new(MockContext::new(), &config);
        service.start().await.unwrap();

        let address = service.address().expect("address should be set");
        assert!(address.ip().is_loopback());

        // The in-process umbilical works without any server.
        let task = service
            .umbilical()
            .get_task(Some(container_context("c42")))
            .await;
        assert!(task.should_die);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_container_registration_is_fatal() {
        let config = AmConfig {
            local_mode: true,
            ..AmConfig::default()
        };
        let service = TaskCommunicatorService::new(MockContext::new(), &config);
        service.start().await.unwrap();

        let c1 = ContainerId("c1".to_string());
        service
            .register_running_container(c1.clone(), "worker-host", 4040)
            .unwrap();
        assert!(service
            .register_running_container(c1, "worker-host", 4040)
            .is_err());
    }

    #[tokio::test]
    async fn test_http_listener_round_trip_with_auth() {
        let config = AmConfig {
            local_mode: false,
            listener_thread_count: 4,
            security_authorization: true,
            ..AmConfig::default()
        };
        let context = MockContext::with_session_token("session-secret");
        let service = TaskCommunicatorService::new(context, &config);
        service.start().await.unwrap();

        let address = service.address().expect("server should be bound");
        assert_ne!(address.port(), 0, "An ephemeral port must be recorded");
        let token = service.session_token();
        assert_eq!(token.as_deref(), Some("session-secret"));

        let c1 = ContainerId("c1".to_string());
        service
            .register_running_container(c1.clone(), "worker-host", 4040)
            .unwrap();
        service
            .register_running_task_attempt(&c1, spec("a1"), None, None, false)
            .unwrap();

        // A properly authenticated worker pulls its task and heartbeats.
        let client = UmbilicalClient::new(address, token);
        let task = client.get_task(&container_context("c1")).await.unwrap();
        assert!(task.is_delivery());

        let response = client
            .heartbeat(&heartbeat_request("c1", 1, Some("a1"), vec![]))
            .await
            .unwrap();
        assert_eq!(response.last_request_id, 1);

        let allowed = client
            .can_commit(&TaskAttemptId("a1".to_string()))
            .await
            .unwrap();
        assert!(allowed);

        // Sequence gaps surface as RPC faults to the worker.
        let fault = client
            .heartbeat(&heartbeat_request("c1", 9, Some("a1"), vec![]))
            .await;
        assert!(fault.is_err());

        // A client without the token is rejected outright.
        let anonymous = UmbilicalClient::new(address, None);
        assert!(anonymous.get_task(&container_context("c1")).await.is_err());

        service.stop().await;
    }
}
