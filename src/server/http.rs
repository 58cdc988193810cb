/// HTTP front end
///
/// `POST /evaluate`, `GET /health` and `GET /metrics` on axum. Evaluations
/// run on the blocking thread pool while holding a pool slot; the slot is
/// only returned once the sandbox is torn down, even if the caller has
/// already gone away.
use crate::config::config::{ServerSection, ServiceConfig};
use crate::config::types::{Result, SandboxError};
use crate::core::backend::create_backend;
use crate::observability::audit::{self, CorrelationIds};
use crate::observability::metrics::{get_metrics, Rejection};
use crate::server::pool::SandboxPool;
use crate::server::service::{Evaluation, EvaluationRequest, Evaluator};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

type ApiError = (StatusCode, Json<serde_json::Value>);

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    evaluator: Arc<Evaluator>,
    pool: Arc<SandboxPool>,
    auth_token: Option<Arc<str>>,
    max_request_bytes: usize,
}

impl AppState {
    pub fn new(evaluator: Evaluator, server: &ServerSection) -> Self {
        Self {
            evaluator: Arc::new(evaluator),
            pool: Arc::new(SandboxPool::new(
                server.max_concurrent_sandboxes,
                server.max_queue_depth,
            )),
            auth_token: server.auth_token.as_deref().map(Arc::from),
            max_request_bytes: server.max_request_bytes,
        }
    }

    /// Backend, evaluator and pool for a validated configuration
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let backend = create_backend(&config.backend, config.server.max_concurrent_sandboxes)?;
        let evaluator = Evaluator::new(backend, config.limits.clone(), &config.server);
        Ok(Self::new(evaluator, &config.server))
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backend: String,
    pub active_sandboxes: usize,
    pub queued_requests: usize,
    pub max_concurrent_sandboxes: usize,
    pub max_queue_depth: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Sets the request's cancellation flag when the handler future is dropped
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub fn build_router(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let evaluate = Router::new()
        .route("/evaluate", post(evaluate_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(evaluate)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
        .layer(TraceLayer::new_for_http())
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    let response = next.run(request).await;
    let duration = start.elapsed();
    if uri.path() == "/health" || uri.path() == "/metrics" {
        log::debug!("{} {} -> {} in {:?}", method, uri, response.status(), duration);
    } else {
        log::info!("{} {} -> {} in {:?}", method, uri, response.status(), duration);
    }
    response
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.auth_token {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        if !provided.is_some_and(|token| tokens_match(token.trim(), expected)) {
            get_metrics().record_rejection(Rejection::Unauthorized);
            log::warn!("Rejected {} {}: missing or wrong token", request.method(), request.uri());
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthorized",
                    "timestamp": chrono::Utc::now()
                })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

/// Comparison time depends only on the lengths
fn tokens_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.evaluator.backend().name().to_string(),
        active_sandboxes: state.pool.active(),
        queued_requests: state.pool.queued(),
        max_concurrent_sandboxes: state.pool.capacity(),
        max_queue_depth: state.pool.max_queue_depth(),
        timestamp: chrono::Utc::now(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        get_metrics().export_prometheus(),
    )
}

async fn evaluate_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<EvaluationRequest>, JsonRejection>,
) -> std::result::Result<Json<Evaluation>, ApiError> {
    let request_id = uuid::Uuid::new_v4().to_string();
    get_metrics().requests_total.inc();

    let Json(request) = payload.map_err(|rejection| {
        get_metrics().record_rejection(Rejection::Invalid);
        let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            StatusCode::PAYLOAD_TOO_LARGE
        } else {
            StatusCode::BAD_REQUEST
        };
        reject(
            &request_id,
            None,
            status,
            "invalid_request",
            rejection.body_text(),
        )
    })?;
    let task_id = request.submission.task_id.clone();

    Evaluator::validate(&request).map_err(|e| error_response(&request_id, Some(&task_id), e))?;

    let permit = state
        .pool
        .admit()
        .await
        .map_err(|e| error_response(&request_id, Some(&task_id), e))?;

    let cancel = Arc::new(AtomicBool::new(false));
    let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));
    let evaluator = Arc::clone(&state.evaluator);
    let id = request_id.clone();

    let joined = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        evaluator.evaluate(&request, &id, &cancel)
    })
    .await;

    match joined {
        Ok(Ok(evaluation)) => Ok(Json(evaluation)),
        Ok(Err(e)) => Err(error_response(&request_id, Some(&task_id), e)),
        Err(e) => Err(error_response(
            &request_id,
            Some(&task_id),
            SandboxError::Process(format!("evaluation task failed: {}", e)),
        )),
    }
}

fn error_response(request_id: &str, task_id: Option<&str>, err: SandboxError) -> ApiError {
    let metrics = get_metrics();
    let (status, code) = match &err {
        SandboxError::InvalidRequest(_) => {
            metrics.record_rejection(Rejection::Invalid);
            (StatusCode::BAD_REQUEST, "invalid_request")
        }
        SandboxError::UnsupportedLanguage(_) => {
            metrics.record_rejection(Rejection::Invalid);
            (StatusCode::BAD_REQUEST, "unsupported_language")
        }
        SandboxError::ServiceBusy(_) => {
            metrics.record_rejection(Rejection::Busy);
            (StatusCode::SERVICE_UNAVAILABLE, "service_busy")
        }
        SandboxError::ResourceExhausted(_) => {
            metrics.record_rejection(Rejection::Exhausted);
            (StatusCode::SERVICE_UNAVAILABLE, "resource_exhausted")
        }
        _ => {
            metrics.internal_failures.inc();
            log::error!("Request {}: {}", request_id, err);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };
    reject(request_id, task_id, status, code, err.to_string())
}

fn reject(
    request_id: &str,
    task_id: Option<&str>,
    status: StatusCode,
    code: &str,
    message: String,
) -> ApiError {
    if status != StatusCode::INTERNAL_SERVER_ERROR {
        let mut correlation = CorrelationIds::default().with_request(request_id);
        if let Some(task_id) = task_id {
            correlation = correlation.with_task(task_id);
        }
        audit::events::request_rejected(&correlation, &format!("{}: {}", code, message));
    }
    (
        status,
        Json(json!({
            "error": code,
            "message": message,
            "request_id": request_id,
            "timestamp": chrono::Utc::now()
        })),
    )
}

/// Bind, serve until SIGINT/SIGTERM, then stop admitting requests.
/// Evaluations already running finish and tear down their sandboxes.
pub async fn serve(config: &ServiceConfig) -> Result<()> {
    let state = AppState::from_config(config)?;
    let pool = Arc::clone(state.pool());
    let router = build_router(state);

    let address = config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| SandboxError::from_io(&format!("Failed to bind to {}", address), e))?;

    log::info!(
        "testbox listening on {} ({} backend, {} sandboxes, queue depth {})",
        address,
        config.backend.kind.as_str(),
        config.server.max_concurrent_sandboxes,
        config.server.max_queue_depth
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| SandboxError::from_io("server error", e))?;

    pool.close();
    log::info!("testbox shut down");
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => log::info!("Received SIGTERM, shutting down..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secreT", "secret"));
        assert!(!tokens_match("secret-longer", "secret"));
        assert!(!tokens_match("", "secret"));
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, body) = error_response("r", None, SandboxError::ServiceBusy("full".into()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.0["error"], "service_busy");

        let (status, body) =
            error_response("r", Some("t"), SandboxError::ResourceExhausted("ENOSPC".into()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.0["error"], "resource_exhausted");

        let (status, body) =
            error_response("r", None, SandboxError::UnsupportedLanguage("ruby".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["error"], "unsupported_language");

        let (status, body) = error_response("r", None, SandboxError::Process("boom".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.0["error"], "internal");
        assert_eq!(body.0["request_id"], "r");
    }
}
