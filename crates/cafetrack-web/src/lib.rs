//! Axum + Askama dashboard and the single-flight background-job coordinator.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cafetrack_etl::{EtlConfig, LoadSummary};
use cafetrack_storage::{Metrics, StoreConfig};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cafetrack-web";

/// Single-flight guard over the two user-triggered background jobs.
///
/// At most one [`JobToken`] exists at a time. The token releases the guard
/// on `Drop`, so every exit path of a worker (success, error return, panic
/// inside the spawned task) returns the guard to idle. There is no
/// happy-path-only reset anywhere.
#[derive(Clone, Default)]
pub struct JobGuard {
    running: Arc<Mutex<bool>>,
}

impl JobGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-set: the caller either becomes the one running job
    /// or is told the guard is busy. Never blocks beyond the flag lock.
    pub fn try_start(&self) -> Option<JobToken> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if *running {
            return None;
        }
        *running = true;
        Some(JobToken {
            running: Arc::clone(&self.running),
        })
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct JobToken {
    running: Arc<Mutex<bool>>,
}

impl Drop for JobToken {
    fn drop(&mut self) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Analysis snapshot produced by the refresh job.
#[derive(Debug, Clone)]
pub struct AnalysisSnapshot {
    pub refreshed_at: DateTime<Utc>,
    pub metrics: Metrics,
}

pub struct AppState {
    pub config: StoreConfig,
    pub input_path: PathBuf,
    pub pool: PgPool,
    pub guard: JobGuard,
    pull_message: Mutex<String>,
    last_analysis: RwLock<Option<AnalysisSnapshot>>,
}

impl AppState {
    pub fn new(config: StoreConfig, input_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        // Lazy pool: the dashboard must come up even when the store is down;
        // queries fail (and the page degrades) at use time instead.
        let pool = config.connect_lazy()?;
        Ok(Self {
            config,
            input_path: input_path.into(),
            pool,
            guard: JobGuard::new(),
            pull_message: Mutex::new("No load has been run yet.".to_string()),
            last_analysis: RwLock::new(None),
        })
    }

    pub fn pull_message(&self) -> String {
        self.pull_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_pull_message(&self, message: String) {
        *self
            .pull_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = message;
    }

    pub fn last_analysis(&self) -> Option<AnalysisSnapshot> {
        self.last_analysis
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_analysis(&self, snapshot: AnalysisSnapshot) {
        *self
            .last_analysis
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/pull-data", post(pull_data_handler))
        .route("/update-analysis", post(update_analysis_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CAFETRACK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let etl_config = EtlConfig::from_env();
    let state = Arc::new(AppState::new(etl_config.store, etl_config.input_path)?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    db_ok: bool,
    pull_running: bool,
    pull_message: String,
    analysis_line: String,
    target_term: String,
    total: String,
    term_count: String,
    pct_international: String,
    avg_gpa: String,
    avg_gre_quant: String,
    avg_gre_verbal: String,
    avg_gre_aw: String,
    avg_gpa_american: String,
    acceptance_pct: String,
    avg_gpa_accepted: String,
    term_distribution: Vec<(String, i64)>,
    decision_distribution: Vec<(String, i64)>,
    top_universities: Vec<(String, i64)>,
}

fn fmt_avg(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
}

fn fmt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}%"))
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let pull_running = state.guard.is_running();
    let pull_message = state.pull_message();
    let analysis_line = match state.last_analysis() {
        Some(snapshot) => format!(
            "Analysis refreshed {} over {} rows.",
            snapshot.refreshed_at.format("%Y-%m-%d %H:%M:%S UTC"),
            snapshot.metrics.total
        ),
        None => "No analysis refresh has been run yet.".to_string(),
    };

    // The dashboard renders with a degraded body rather than failing the
    // request when the store is unreachable at render time.
    let metrics = cafetrack_storage::fetch_metrics(&state.pool, &state.config.target_term).await;
    let tpl = match metrics {
        Ok(metrics) => IndexTemplate {
            db_ok: true,
            pull_running,
            pull_message,
            analysis_line,
            target_term: metrics.target_term.clone(),
            total: metrics.total.to_string(),
            term_count: metrics.term_count.to_string(),
            pct_international: fmt_pct(metrics.pct_international),
            avg_gpa: fmt_avg(metrics.avg_gpa),
            avg_gre_quant: fmt_avg(metrics.avg_gre_quant),
            avg_gre_verbal: fmt_avg(metrics.avg_gre_verbal),
            avg_gre_aw: fmt_avg(metrics.avg_gre_aw),
            avg_gpa_american: fmt_avg(metrics.avg_gpa_american),
            acceptance_pct: fmt_pct(metrics.acceptance_pct),
            avg_gpa_accepted: fmt_avg(metrics.avg_gpa_accepted),
            term_distribution: metrics.term_distribution,
            decision_distribution: metrics.decision_distribution,
            top_universities: metrics.top_universities,
        },
        Err(err) => {
            error!(%err, "metrics unavailable for dashboard render");
            IndexTemplate {
                db_ok: false,
                pull_running,
                pull_message,
                analysis_line,
                target_term: state.config.target_term.clone(),
                total: "n/a".to_string(),
                term_count: "n/a".to_string(),
                pct_international: "n/a".to_string(),
                avg_gpa: "n/a".to_string(),
                avg_gre_quant: "n/a".to_string(),
                avg_gre_verbal: "n/a".to_string(),
                avg_gre_aw: "n/a".to_string(),
                avg_gpa_american: "n/a".to_string(),
                acceptance_pct: "n/a".to_string(),
                avg_gpa_accepted: "n/a".to_string(),
                term_distribution: vec![],
                decision_distribution: vec![],
                top_universities: vec![],
            }
        }
    };
    render_html(tpl)
}

async fn pull_data_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(token) = state.guard.try_start() else {
        return busy_response();
    };
    state.set_pull_message("Pull Data started…".to_string());

    let worker_state = Arc::clone(&state);
    tokio::spawn(async move {
        // The token lives for the whole task; dropping it on any exit path
        // (including panic unwind) releases the guard.
        let _token = token;
        let message = match pull_worker(&worker_state).await {
            Ok(summary) => format!(
                "Pull Data complete: {} read, {} inserted, {} already present.",
                summary.read, summary.inserted, summary.skipped
            ),
            Err(err) => {
                error!(%err, "pull job failed");
                format!("Pull Data failed: {err:#}")
            }
        };
        worker_state.set_pull_message(message);
    });

    accepted_response()
}

async fn pull_worker(state: &AppState) -> anyhow::Result<LoadSummary> {
    cafetrack_etl::run_load_from_path(&state.pool, &state.input_path).await
}

async fn update_analysis_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(token) = state.guard.try_start() else {
        return busy_response();
    };

    let worker_state = Arc::clone(&state);
    tokio::spawn(async move {
        let _token = token;
        match cafetrack_storage::fetch_metrics(&worker_state.pool, &worker_state.config.target_term)
            .await
        {
            Ok(metrics) => {
                worker_state.set_last_analysis(AnalysisSnapshot {
                    refreshed_at: Utc::now(),
                    metrics,
                });
                info!("analysis refresh complete");
            }
            Err(err) => error!(%err, "analysis refresh failed"),
        }
    });

    accepted_response()
}

fn accepted_response() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response()
}

fn busy_response() -> Response {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({"busy": true})),
    )
        .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let config = StoreConfig {
            // Nothing listens here; the lazy pool only fails at query time.
            database_url: "postgres://cafetrack@127.0.0.1:1/cafetrack_test".to_string(),
            target_term: "Fall 2026".to_string(),
        };
        Arc::new(AppState::new(config, "data/does-not-exist.jsonl").unwrap())
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn guard_admits_exactly_one_of_many_concurrent_starts() {
        let guard = JobGuard::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || guard.try_start())
            })
            .collect();
        // Each winner's token must stay alive while the others race, so the
        // threads hand their tokens back instead of dropping them in place.
        let tokens: Vec<JobToken> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(tokens.len(), 1);
        assert!(guard.is_running());
        drop(tokens);
        assert!(!guard.is_running());
    }

    #[test]
    fn guard_releases_on_token_drop() {
        let guard = JobGuard::new();
        let token = guard.try_start().unwrap();
        assert!(guard.try_start().is_none());
        drop(token);
        assert!(!guard.is_running());
        assert!(guard.try_start().is_some());
    }

    #[test]
    fn guard_releases_after_panic_in_holder() {
        let guard = JobGuard::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _token = guard.try_start().unwrap();
            panic!("job blew up");
        }));
        assert!(result.is_err());
        assert!(!guard.is_running());
        assert!(guard.try_start().is_some());
    }

    #[tokio::test]
    async fn pull_data_rejected_while_busy() {
        let state = test_state();
        let _token = state.guard.try_start().unwrap();
        let resp = app(state.clone())
            .oneshot(post("/pull-data"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await, serde_json::json!({"busy": true}));
    }

    #[tokio::test]
    async fn update_analysis_blocked_by_running_pull() {
        let state = test_state();
        let _token = state.guard.try_start().unwrap();
        let resp = app(state.clone())
            .oneshot(post("/update-analysis"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await, serde_json::json!({"busy": true}));
    }

    #[tokio::test]
    async fn pull_data_accepted_when_idle() {
        let state = test_state();
        let resp = app(state.clone())
            .oneshot(post("/pull-data"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn update_analysis_accepted_after_guard_release() {
        let state = test_state();
        let token = state.guard.try_start().unwrap();
        drop(token);
        let resp = app(state.clone())
            .oneshot(post("/update-analysis"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn index_renders_degraded_page_without_store() {
        let state = test_state();
        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("CafeTrack"));
        assert!(text.contains("Database unavailable"));
    }
}
