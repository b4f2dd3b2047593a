//! Axum JSON control surface: trigger campaign jobs, poll their status, read
//! recent log lines, and fetch dashboard stats from the store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use loam_core::LifecycleStage;
use loam_store::ProspectStore;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::Layer;

pub const CRATE_NAME: &str = "loam-web";

pub const LOG_BUFFER_CAPACITY: usize = 300;

/// Lifecycle of one named job as seen by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Last run's summary or error text.
    pub detail: String,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: JobState::Idle,
            detail: String::new(),
        }
    }
}

/// Per-job status map. A job may have at most one running instance; the panel
/// gets a conflict response instead of a second concurrent run.
#[derive(Debug, Default)]
pub struct JobRegistry {
    statuses: Mutex<HashMap<String, JobStatus>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to `Running` unless the job already is.
    pub fn try_start(&self, name: &str) -> bool {
        let mut statuses = self.statuses.lock().expect("registry lock");
        let status = statuses.entry(name.to_string()).or_default();
        if status.state == JobState::Running {
            return false;
        }
        *status = JobStatus {
            state: JobState::Running,
            detail: String::new(),
        };
        true
    }

    pub fn finish(&self, name: &str, result: Result<String, String>) {
        let mut statuses = self.statuses.lock().expect("registry lock");
        let status = statuses.entry(name.to_string()).or_default();
        *status = match result {
            Ok(detail) => JobStatus {
                state: JobState::Success,
                detail,
            },
            Err(detail) => JobStatus {
                state: JobState::Error,
                detail,
            },
        };
    }

    pub fn snapshot(&self) -> BTreeMap<String, JobStatus> {
        self.statuses
            .lock()
            .expect("registry lock")
            .iter()
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect()
    }
}

/// Bounded in-memory log tail. Old lines fall off the front.
#[derive(Debug)]
pub struct LogRingBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(LOG_BUFFER_CAPACITY)
    }
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("log buffer lock");
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn tail(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("log buffer lock")
            .iter()
            .cloned()
            .collect()
    }
}

/// `tracing` layer that mirrors every event into a `LogRingBuffer` so the
/// panel can show recent activity without touching process stdout.
pub struct RingBufferLayer {
    buffer: Arc<LogRingBuffer>,
}

impl RingBufferLayer {
    pub fn new(buffer: Arc<LogRingBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: tracing::Subscriber> Layer<S> for RingBufferLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.buffer.push(format!(
            "{} {}: {}",
            metadata.level(),
            metadata.target(),
            visitor.line.trim()
        ));
    }
}

#[derive(Default)]
struct LineVisitor {
    line: String,
}

impl tracing::field::Visit for LineVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let rendered = format!("{value:?}");
            // The message leads; other fields trail as key=value pairs.
            self.line = format!("{rendered} {}", self.line);
        } else {
            let _ = write!(self.line, "{}={value:?} ", field.name());
        }
    }
}

/// Runs a named job to completion and reports a one-line summary.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn job_names(&self) -> Vec<String>;
    async fn run(&self, name: &str) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub logs: Arc<LogRingBuffer>,
    pub executor: Arc<dyn JobExecutor>,
    pub store: ProspectStore,
}

impl AppState {
    pub fn new(
        registry: Arc<JobRegistry>,
        logs: Arc<LogRingBuffer>,
        executor: Arc<dyn JobExecutor>,
        store: ProspectStore,
    ) -> Self {
        Self {
            registry,
            logs,
            executor,
            store,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total: usize,
    pub new: usize,
    pub awaiting_follow_up: usize,
    pub exhausted: usize,
    pub bounced: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/jobs/{name}", post(trigger_job_handler))
        .route("/status", get(status_handler))
        .route("/logs", get(logs_handler))
        .route("/dashboard", get(dashboard_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control panel listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn trigger_job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    if !state.executor.job_names().contains(&name) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("unknown job '{name}'")})),
        )
            .into_response();
    }
    if !state.registry.try_start(&name) {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": format!("job '{name}' is already running")})),
        )
            .into_response();
    }

    let registry = state.registry.clone();
    let executor = state.executor.clone();
    let job = name.clone();
    tokio::spawn(async move {
        // Run on a separate task so a panicking job surfaces as a join
        // error instead of leaving the registry stuck on `Running`.
        let run = {
            let executor = executor.clone();
            let job = job.clone();
            tokio::spawn(async move { executor.run(&job).await })
        };
        let result = match run.await {
            Ok(outcome) => outcome.map_err(|err| format!("{err:#}")),
            Err(err) => Err(format!("job task aborted: {err}")),
        };
        if let Err(detail) = &result {
            tracing::error!(job, detail, "job failed");
        }
        registry.finish(&job, result);
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"job": name, "state": "running"})),
    )
        .into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, JobStatus>> {
    Json(state.registry.snapshot())
}

async fn logs_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"lines": state.logs.tail()}))
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.fetch_all().await {
        Ok(prospects) => {
            let mut stats = DashboardStats {
                total: prospects.len(),
                ..DashboardStats::default()
            };
            for prospect in &prospects {
                match prospect.stage() {
                    LifecycleStage::New => stats.new += 1,
                    LifecycleStage::AwaitingFu1
                    | LifecycleStage::AwaitingFu2
                    | LifecycleStage::AwaitingFu3 => stats.awaiting_follow_up += 1,
                    LifecycleStage::Exhausted => stats.exhausted += 1,
                    LifecycleStage::Bounced => stats.bounced += 1,
                }
            }
            Json(stats).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("{err:#}")})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use loam_core::col;
    use loam_store::InMemoryGrid;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    struct GatedExecutor {
        release: Arc<Notify>,
        fail: bool,
    }

    #[async_trait]
    impl JobExecutor for GatedExecutor {
        fn job_names(&self) -> Vec<String> {
            vec!["send".to_string(), "follow-ups".to_string()]
        }

        async fn run(&self, name: &str) -> anyhow::Result<String> {
            self.release.notified().await;
            if self.fail {
                anyhow::bail!("store unreachable");
            }
            Ok(format!("{name} finished"))
        }
    }

    fn state_with(executor: Arc<dyn JobExecutor>, rows: Vec<Vec<String>>) -> AppState {
        AppState::new(
            Arc::new(JobRegistry::new()),
            Arc::new(LogRingBuffer::default()),
            executor,
            ProspectStore::new(Arc::new(InMemoryGrid::with_rows(rows))),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_job(name: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(format!("/jobs/{name}"))
            .body(Body::empty())
            .unwrap()
    }

    fn get_req(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn wait_for_state(state: &AppState, job: &str, wanted: JobState) {
        for _ in 0..100 {
            if state.registry.snapshot().get(job).map(|s| s.state) == Some(wanted) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job '{job}' never reached {wanted:?}");
    }

    #[tokio::test]
    async fn unknown_jobs_are_rejected() {
        let release = Arc::new(Notify::new());
        let state = state_with(
            Arc::new(GatedExecutor {
                release,
                fail: false,
            }),
            vec![],
        );
        let response = app(state).oneshot(post_job("mystery")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn a_running_job_cannot_be_started_twice() {
        let release = Arc::new(Notify::new());
        let state = state_with(
            Arc::new(GatedExecutor {
                release: release.clone(),
                fail: false,
            }),
            vec![],
        );
        let router = app(state.clone());

        let first = router.clone().oneshot(post_job("send")).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = router.clone().oneshot(post_job("send")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        release.notify_one();
        wait_for_state(&state, "send", JobState::Success).await;

        let status = router.oneshot(get_req("/status")).await.unwrap();
        let body = body_json(status).await;
        assert_eq!(body["send"]["state"], "success");
        assert_eq!(body["send"]["detail"], "send finished");
    }

    #[tokio::test]
    async fn a_failing_job_lands_in_the_error_state() {
        let release = Arc::new(Notify::new());
        let state = state_with(
            Arc::new(GatedExecutor {
                release: release.clone(),
                fail: true,
            }),
            vec![],
        );
        let router = app(state.clone());
        let response = router.clone().oneshot(post_job("send")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        release.notify_one();
        wait_for_state(&state, "send", JobState::Error).await;
        let status = state.registry.snapshot();
        assert!(status["send"].detail.contains("store unreachable"));
    }

    struct PanickingExecutor;

    #[async_trait]
    impl JobExecutor for PanickingExecutor {
        fn job_names(&self) -> Vec<String> {
            vec!["send".to_string()]
        }

        async fn run(&self, _name: &str) -> anyhow::Result<String> {
            panic!("worker bug");
        }
    }

    #[tokio::test]
    async fn a_panicking_job_releases_the_running_slot() {
        let state = state_with(Arc::new(PanickingExecutor), vec![]);
        let router = app(state.clone());

        let response = router.clone().oneshot(post_job("send")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        wait_for_state(&state, "send", JobState::Error).await;
        let status = state.registry.snapshot();
        assert!(status["send"].detail.contains("aborted"));

        let retry = router.oneshot(post_job("send")).await.unwrap();
        assert_eq!(retry.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn logs_endpoint_returns_the_buffered_tail() {
        let release = Arc::new(Notify::new());
        let state = state_with(
            Arc::new(GatedExecutor {
                release,
                fail: false,
            }),
            vec![],
        );
        state.logs.push("INFO loam: first".to_string());
        state.logs.push("WARN loam: second".to_string());

        let response = app(state).oneshot(get_req("/logs")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["lines"].as_array().unwrap().len(), 2);
        assert_eq!(body["lines"][1], "WARN loam: second");
    }

    #[test]
    fn ring_buffer_drops_the_oldest_lines() {
        let buffer = LogRingBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.tail(), ["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn dashboard_counts_records_by_stage() {
        let header: Vec<String> = vec![
            col::NAME.into(),
            col::WEBSITE.into(),
            col::SENT_DATE.into(),
            col::EMAIL_STATUS.into(),
        ];
        let rows = vec![
            header,
            vec!["A".into(), "a.com".into(), "".into(), "".into()],
            vec![
                "B".into(),
                "b.com".into(),
                "2024-01-01 09:00:00".into(),
                "Sent".into(),
            ],
            vec![
                "C".into(),
                "c.com".into(),
                "2024-01-01 09:00:00".into(),
                "Bounced".into(),
            ],
        ];
        let release = Arc::new(Notify::new());
        let state = state_with(
            Arc::new(GatedExecutor {
                release,
                fail: false,
            }),
            rows,
        );

        let response = app(state).oneshot(get_req("/dashboard")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["new"], 1);
        assert_eq!(body["awaiting_follow_up"], 1);
        assert_eq!(body["bounced"], 1);
    }
}
