//! HTTP trigger and health surface for the registry sync.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lcr_sync::{RunError, RunnerStatus, SyncRunSummary, SyncRunner};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "lcr-web";

/// What the handlers need from the sync side.
#[async_trait]
pub trait SyncControl: Send + Sync {
    async fn store_health(&self) -> anyhow::Result<()>;
    async fn trigger(&self) -> Result<SyncRunSummary, RunError>;
    async fn status(&self) -> RunnerStatus;
}

#[async_trait]
impl SyncControl for SyncRunner {
    async fn store_health(&self) -> anyhow::Result<()> {
        self.ping_store().await
    }

    async fn trigger(&self) -> Result<SyncRunSummary, RunError> {
        SyncRunner::trigger(self).await
    }

    async fn status(&self) -> RunnerStatus {
        SyncRunner::status(self).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<dyn SyncControl>,
}

impl AppState {
    pub fn new(sync: Arc<dyn SyncControl>) -> Self {
        Self { sync }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/update-data", axum::routing::post(update_data_handler))
        .route("/api/update-data/status", get(update_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http trigger listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.sync.store_health().await {
        Ok(()) => Json(json!({ "status": "ok", "db": "connected" })).into_response(),
        Err(err) => {
            warn!(error = ?err, "health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "db": "unavailable" })),
            )
                .into_response()
        }
    }
}

/// The run is spawned so a client that goes away cannot cancel it mid-write;
/// only the runner's own token stops a run.
async fn update_data_handler(State(state): State<Arc<AppState>>) -> Response {
    let sync = Arc::clone(&state.sync);
    let outcome = match tokio::spawn(async move { sync.trigger().await }).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "on-demand sync task failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": "sync task failed" })),
            )
                .into_response();
        }
    };

    match outcome {
        Ok(summary) => {
            let message = format!(
                "loaded {} records, {} errors",
                summary.loaded, summary.errors
            );
            Json(json!({ "status": "success", "message": message, "summary": summary }))
                .into_response()
        }
        Err(RunError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "busy", "message": RunError::AlreadyRunning.to_string() })),
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "on-demand sync aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn update_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.sync.status().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use lcr_sync::RunPhase;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Clone, Copy)]
    enum Outcome {
        Loaded,
        Busy,
        Aborted,
    }

    struct FakeSync {
        healthy: bool,
        outcome: Outcome,
        run_time: Duration,
        finished: Arc<AtomicBool>,
    }

    fn summary() -> SyncRunSummary {
        let mut summary = SyncRunSummary::new(uuid::Uuid::new_v4(), chrono::Utc::now());
        summary.loaded = 3;
        summary.errors = 1;
        summary
    }

    #[async_trait]
    impl SyncControl for FakeSync {
        async fn store_health(&self) -> anyhow::Result<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(anyhow::anyhow!("connection refused"))
            }
        }

        async fn trigger(&self) -> Result<SyncRunSummary, RunError> {
            tokio::time::sleep(self.run_time).await;
            self.finished.store(true, Ordering::SeqCst);
            match self.outcome {
                Outcome::Loaded => Ok(summary()),
                Outcome::Busy => Err(RunError::AlreadyRunning),
                Outcome::Aborted => Err(RunError::StoreUnavailable(anyhow::anyhow!("connection refused"))),
            }
        }

        async fn status(&self) -> RunnerStatus {
            RunnerStatus {
                phase: RunPhase::Idle,
                running: false,
                last_summary: None,
            }
        }
    }

    fn test_app(healthy: bool, outcome: Outcome) -> Router {
        app(AppState::new(Arc::new(FakeSync {
            healthy,
            outcome,
            run_time: Duration::ZERO,
            finished: Arc::new(AtomicBool::new(false)),
        })))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_store_state() {
        let ok = test_app(true, Outcome::Loaded).oneshot(get("/api/health")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_json(ok).await["status"], "ok");

        let down = test_app(false, Outcome::Loaded).oneshot(get("/api/health")).await.unwrap();
        assert_eq!(down.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(down).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["db"], "unavailable");
    }

    #[tokio::test]
    async fn update_data_returns_the_tally() {
        let resp = test_app(true, Outcome::Loaded)
            .oneshot(post("/api/update-data"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["summary"]["loaded"], 3);
        assert_eq!(body["summary"]["errors"], 1);
    }

    #[tokio::test]
    async fn run_outlives_a_client_that_goes_away() {
        let finished = Arc::new(AtomicBool::new(false));
        let router = app(AppState::new(Arc::new(FakeSync {
            healthy: true,
            outcome: Outcome::Loaded,
            run_time: Duration::from_millis(200),
            finished: Arc::clone(&finished),
        })));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), router.oneshot(post("/api/update-data"))).await;
        assert!(abandoned.is_err());
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn overlapping_trigger_is_a_conflict() {
        let resp = test_app(true, Outcome::Busy)
            .oneshot(post("/api/update-data"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn aborted_run_is_a_server_error() {
        let resp = test_app(true, Outcome::Aborted)
            .oneshot(post("/api/update-data"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["status"], "error");
    }

    #[tokio::test]
    async fn status_exposes_the_phase() {
        let resp = test_app(true, Outcome::Loaded)
            .oneshot(get("/api/update-data/status"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["running"], false);
    }
}
