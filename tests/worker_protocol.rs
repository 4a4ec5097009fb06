//! Worker against a mock broker: claim, dedup, reconnect and release

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post, put},
};
use codetether_worker::a2a::WorkerIdentity;
use codetether_worker::a2a::client::BrokerClient;
use codetether_worker::a2a::worker::{Worker, WorkerOptions};
use codetether_worker::config::Config;
use codetether_worker::notify::{MonitorTarget, NotificationConfig, Notifier};
use codetether_worker::session::{
    HistoryMessage, Part, PermissionReply, PromptRequest, SessionBackend, SessionEvent,
    TaskExecutor, ToolState,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Call {
    route: &'static str,
    id: Option<String>,
    body: Value,
    auth: Option<String>,
}

#[derive(Default)]
struct MockBroker {
    calls: Mutex<Vec<Call>>,
    /// Tasks returned by the pending poll, each visible from the given poll number on
    pending: Mutex<Vec<(usize, Value)>>,
    polls: AtomicUsize,
    /// One body per stream connection; later connections stay open forever
    streams: Mutex<VecDeque<String>>,
    connections: AtomicUsize,
    /// Leading stream connections answered with 503
    stream_failures: AtomicUsize,
    claim_status: Mutex<HashMap<String, u16>>,
    release_status: Mutex<Option<u16>>,
}

impl MockBroker {
    fn record(&self, route: &'static str, id: Option<String>, headers: &HeaderMap, body: Value) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.calls.lock().push(Call {
            route,
            id,
            body,
            auth,
        });
    }

    fn calls(&self, route: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.route == route)
            .cloned()
            .collect()
    }
}

type Shared = State<Arc<MockBroker>>;

async fn register(State(b): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    b.record("register", None, &headers, body);
    Json(json!({"ok": true}))
}

async fn pending(State(b): Shared) -> Json<Value> {
    let poll = b.polls.fetch_add(1, Ordering::SeqCst) + 1;
    let tasks: Vec<Value> = b
        .pending
        .lock()
        .iter()
        .filter(|(from, _)| *from <= poll)
        .map(|(_, t)| t.clone())
        .collect();
    Json(json!({ "tasks": tasks }))
}

async fn stream(State(b): Shared) -> Response {
    b.connections.fetch_add(1, Ordering::SeqCst);
    if b
        .stream_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::from("broker warming up"))
            .unwrap();
    }
    let body = match b.streams.lock().pop_front() {
        Some(script) => Body::from(script),
        None => Body::from_stream(futures::stream::pending::<Result<String, std::io::Error>>()),
    };
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap()
}

async fn claim(State(b): Shared, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    let task_id = body["task_id"].as_str().unwrap_or_default().to_string();
    b.record("claim", Some(task_id.clone()), &headers, body);
    let status = b.claim_status.lock().get(&task_id).copied().unwrap_or(200);
    StatusCode::from_u16(status).unwrap()
}

async fn status(
    State(b): Shared,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    b.record("status", Some(id), &headers, body);
    StatusCode::OK
}

async fn sync(
    State(b): Shared,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    b.record("sync", Some(id), &headers, body);
    StatusCode::OK
}

async fn release(State(b): Shared, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    let task_id = body["task_id"].as_str().map(str::to_string);
    b.record("release", task_id, &headers, body);
    let status = b.release_status.lock().unwrap_or(200);
    StatusCode::from_u16(status).unwrap()
}

async fn monitor(State(b): Shared, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    b.record("monitor", None, &headers, body);
    StatusCode::OK
}

async fn serve(broker: Arc<MockBroker>) -> String {
    let app = Router::new()
        .route("/v1/worker/codebases", put(register))
        .route("/v1/opencode/tasks", get(pending))
        .route("/v1/worker/tasks/stream", get(stream))
        .route("/v1/worker/tasks/claim", post(claim))
        .route("/v1/opencode/tasks/{id}/status", put(status))
        .route("/v1/opencode/sessions/{id}/sync", post(sync))
        .route("/v1/worker/tasks/release", post(release))
        .route("/v1/monitor/intervene", post(monitor))
        .with_state(broker);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Session backend that replays a fixed event script
struct FakeSessions {
    created: AtomicUsize,
    create_delay: Duration,
    fail_create: bool,
    events: Vec<SessionEvent>,
}

impl FakeSessions {
    fn replying(text: &str) -> Self {
        Self {
            created: AtomicUsize::new(0),
            create_delay: Duration::ZERO,
            fail_create: false,
            events: vec![
                SessionEvent::PartUpdated {
                    session_id: "ses_1".into(),
                    part: Part::Text { text: text.into() },
                },
                SessionEvent::Idle {
                    session_id: "ses_1".into(),
                },
            ],
        }
    }
}

#[async_trait]
impl SessionBackend for FakeSessions {
    async fn create_session(&self, _title: &str, _directory: Option<&str>) -> Result<String> {
        tokio::time::sleep(self.create_delay).await;
        if self.fail_create {
            anyhow::bail!("session server refused the connection");
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok("ses_1".to_string())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, SessionEvent>> {
        Ok(futures::stream::iter(self.events.clone()).boxed())
    }

    async fn prompt(&self, _session_id: &str, _request: &PromptRequest) -> Result<()> {
        Ok(())
    }

    async fn reply_permission(
        &self,
        _session_id: &str,
        _permission_id: &str,
        _reply: PermissionReply,
    ) -> Result<()> {
        Ok(())
    }

    async fn messages(&self, _session_id: &str) -> Result<Vec<HistoryMessage>> {
        Ok(vec![])
    }
}

fn start_worker(base: &str, sessions: Arc<FakeSessions>) -> Arc<Worker> {
    let identity = WorkerIdentity::generate("test-worker", vec!["/repo".to_string()]);
    let notifier = Notifier::from_config(&NotificationConfig {
        monitor: Some(MonitorTarget {
            server: base.to_string(),
            token: None,
            worker_id: identity.worker_id.clone(),
        }),
        ..Default::default()
    });
    let broker = BrokerClient::new(base, identity).with_token(Some("s3cret".to_string()));
    let executor = TaskExecutor::new(sessions, Arc::new(Config::default()));
    let worker = Arc::new(
        Worker::new(broker, Arc::new(executor), notifier).with_options(WorkerOptions {
            reconnect_delay: Duration::from_millis(20),
            retry_delay: Duration::from_millis(20),
        }),
    );
    tokio::spawn(Arc::clone(&worker).run());
    worker
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn monitor_notice(broker: &MockBroker, prefix: &str) -> bool {
    broker.calls("monitor").iter().any(|c| {
        c.body["message"]
            .as_str()
            .is_some_and(|m| m.starts_with(prefix))
    })
}

fn offer(id: &str, title: &str) -> String {
    format!(
        "event: task_available\ndata: {}\n\n",
        json!({"task": {"id": id, "title": title, "prompt": format!("do {id}")}})
    )
}

#[tokio::test]
async fn rejected_claim_creates_no_session_and_no_release() {
    let broker = Arc::new(MockBroker::default());
    broker
        .pending
        .lock()
        .push((1, json!({"id": "T1", "title": "taken elsewhere"})));
    broker.claim_status.lock().insert("T1".into(), 409);
    let base = serve(Arc::clone(&broker)).await;

    let sessions = Arc::new(FakeSessions::replying("unused"));
    let worker = start_worker(&base, Arc::clone(&sessions));

    wait_until("claim attempt", || broker.calls("claim").len() == 1).await;
    wait_until("task to leave the in-flight set", || {
        worker.processing().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(sessions.created.load(Ordering::SeqCst), 0);
    assert!(broker.calls("release").is_empty());
    assert!(broker.calls("sync").is_empty());
}

#[tokio::test]
async fn duplicate_offers_are_claimed_once() {
    let broker = Arc::new(MockBroker::default());
    broker
        .streams
        .lock()
        .push_back(format!("{}{}", offer("T2", "dup"), offer("T2", "dup")));
    let base = serve(Arc::clone(&broker)).await;

    let sessions = Arc::new(FakeSessions {
        create_delay: Duration::from_millis(300),
        ..FakeSessions::replying("done")
    });
    let worker = start_worker(&base, Arc::clone(&sessions));

    wait_until("release", || broker.calls("release").len() == 1).await;
    wait_until("in-flight set to drain", || worker.processing().is_empty()).await;

    let claims = broker.calls("claim");
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].id.as_deref(), Some("T2"));
    assert_eq!(sessions.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_stream_repolls_and_reconnects() {
    let broker = Arc::new(MockBroker::default());
    broker
        .streams
        .lock()
        .push_back(": hello\n\nevent: connected\ndata: {\"worker_id\":\"w\"}\n\n".to_string());
    // Only visible to the poll that follows the reconnect
    broker
        .pending
        .lock()
        .push((2, json!({"id": "T3", "title": "queued during the gap"})));
    let base = serve(Arc::clone(&broker)).await;

    let _worker = start_worker(&base, Arc::new(FakeSessions::replying("ok")));

    wait_until("T3 release", || {
        broker
            .calls("release")
            .iter()
            .any(|c| c.id.as_deref() == Some("T3"))
    })
    .await;
    wait_until("second connection", || {
        broker.connections.load(Ordering::SeqCst) >= 2
    })
    .await;

    assert!(broker.polls.load(Ordering::SeqCst) >= 2);
    assert_eq!(broker.calls("claim").len(), 1);
}

#[tokio::test]
async fn successful_task_is_reported_and_released() {
    let broker = Arc::new(MockBroker::default());
    broker.streams.lock().push_back(offer("T4", "Add a flag"));
    let base = serve(Arc::clone(&broker)).await;

    let tool = |id: &str| SessionEvent::PartUpdated {
        session_id: "ses_1".into(),
        part: Part::Tool {
            id: id.into(),
            tool: "read".into(),
            state: ToolState::Completed,
        },
    };
    let mut sessions = FakeSessions::replying("all done");
    // The same part updated twice counts as one tool
    sessions.events.insert(0, tool("p1"));
    sessions.events.insert(0, tool("p1"));
    let worker = start_worker(&base, Arc::new(sessions));
    let worker_id = worker.identity().worker_id.clone();

    wait_until("completion notice", || {
        monitor_notice(&broker, "[TASK_COMPLETED]")
    })
    .await;

    let register = &broker.calls("register")[0];
    assert_eq!(register.body["codebases"], json!(["/repo"]));
    assert_eq!(register.body["worker_id"], worker_id);

    let claim = &broker.calls("claim")[0];
    assert_eq!(claim.body, json!({"task_id": "T4", "worker_id": worker_id}));
    assert_eq!(claim.auth.as_deref(), Some("Bearer s3cret"));

    let activities: Vec<Value> = broker
        .calls("status")
        .iter()
        .map(|c| c.body["metadata"]["activity"].clone())
        .collect();
    assert_eq!(
        activities,
        vec![
            json!("creating_session"),
            json!("executing"),
            json!("tool_execution")
        ]
    );
    let tool_update = broker.calls("status").pop().unwrap();
    assert_eq!(tool_update.body["metadata"]["tool_count"], 1);

    let syncs: Vec<Value> = broker
        .calls("sync")
        .iter()
        .map(|c| c.body["status"].clone())
        .collect();
    assert_eq!(syncs, vec![json!("running"), json!("completed")]);

    let release = &broker.calls("release")[0];
    assert_eq!(
        release.body,
        json!({"task_id": "T4", "status": "completed", "result": "all done"})
    );

    let started = broker.calls("monitor");
    assert!(
        started
            .iter()
            .any(|c| c.body["message"].as_str().unwrap().starts_with("[WORKER_STARTED]"))
    );
}

#[tokio::test]
async fn stream_rejection_is_retried_until_connected() {
    let broker = Arc::new(MockBroker::default());
    broker.stream_failures.store(2, Ordering::SeqCst);
    broker.streams.lock().push_back(offer("T5", "after outage"));
    let base = serve(Arc::clone(&broker)).await;

    let worker = start_worker(&base, Arc::new(FakeSessions::replying("ok")));

    wait_until("T5 release", || {
        broker
            .calls("release")
            .iter()
            .any(|c| c.id.as_deref() == Some("T5"))
    })
    .await;
    wait_until("in-flight set to drain", || worker.processing().is_empty()).await;

    // Two refused connections, then the one that carried the offer
    assert!(broker.connections.load(Ordering::SeqCst) >= 3);
    assert_eq!(broker.calls("claim").len(), 1);
}

#[tokio::test]
async fn failed_release_is_not_retried_and_still_notifies() {
    let broker = Arc::new(MockBroker::default());
    broker.streams.lock().push_back(offer("T6", "release fails"));
    *broker.release_status.lock() = Some(500);
    let base = serve(Arc::clone(&broker)).await;

    let worker = start_worker(&base, Arc::new(FakeSessions::replying("finished")));

    wait_until("completion notice", || {
        monitor_notice(&broker, "[TASK_COMPLETED]")
    })
    .await;
    wait_until("in-flight set to drain", || worker.processing().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let releases = broker.calls("release");
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].body["status"], "completed");
    assert!(!monitor_notice(&broker, "[TASK_FAILED]"));
}

#[tokio::test]
async fn session_creation_failure_notifies_without_release() {
    let broker = Arc::new(MockBroker::default());
    broker.streams.lock().push_back(offer("T7", "no session"));
    let base = serve(Arc::clone(&broker)).await;

    let sessions = Arc::new(FakeSessions {
        fail_create: true,
        ..FakeSessions::replying("unused")
    });
    let worker = start_worker(&base, Arc::clone(&sessions));

    wait_until("failure notice", || monitor_notice(&broker, "[TASK_FAILED]")).await;
    wait_until("in-flight set to drain", || worker.processing().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let claims = broker.calls("claim");
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].id.as_deref(), Some("T7"));
    assert_eq!(sessions.created.load(Ordering::SeqCst), 0);
    assert!(broker.calls("release").is_empty());
    assert!(broker.calls("sync").is_empty());
    assert!(!monitor_notice(&broker, "[TASK_COMPLETED]"));
}
