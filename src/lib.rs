//! Core library for folio-chat.  This module wires the request pipeline
//! together: CORS and method handling, the per-client rate limiter, the input
//! guard, prompt assembly, the fallback completion invoker and response
//! flavoring.  State is constructed explicitly and injected into the router,
//! so tests can supply their own backend and clock.

pub mod completion;
mod config;
pub mod flavor;
pub mod guard;
pub mod limiter;
pub mod metrics;
pub mod persona;
pub mod prompt;
pub mod util;

pub use config::AppConfig;

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    ConnectInfo, DefaultBodyLimit, FromRequest, Request, State,
};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::completion::{CompletionBackend, CompletionError, FallbackInvoker, OpenAiCompatibleBackend};
use crate::flavor::Flavorer;
use crate::limiter::{Clock, SystemClock, TokenBucketLimiter};
use crate::metrics::{Metrics, Outcome};
use crate::util::CorsPolicy;

/// One entry of the caller-supplied conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    /// Read the `history` field leniently: anything that is not an array
    /// yields no turns, and entries without string `role`/`content` are
    /// skipped.
    pub fn list_from_value(value: Option<&serde_json::Value>) -> Vec<ChatTurn> {
        let Some(items) = value.and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let role = item.get("role")?.as_str()?;
                let content = item.get("content")?.as_str()?;
                Some(ChatTurn {
                    role: role.to_string(),
                    content: content.to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub answer: String,
    pub assistant: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip)]
    pub http_status: u16,
}

impl ErrorResponse {
    pub fn new(http_status: u16, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: None,
            http_status,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Application state shared across handlers.  Every component is built
/// once and shared behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<TokenBucketLimiter>,
    pub invoker: Arc<FallbackInvoker>,
    pub flavorer: Arc<Flavorer>,
    pub persona: Arc<str>,
    pub assistant_label: String,
    pub cors: CorsPolicy,
    pub max_request_bytes: usize,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: &AppConfig, backend: Arc<dyn CompletionBackend>) -> Self {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &AppConfig,
        backend: Arc<dyn CompletionBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let invoker = FallbackInvoker::new(
            config.candidate_models(),
            backend,
            persona::system_instruction(&config.assistant_label),
            config.temperature,
            config.max_tokens,
        );
        Self {
            limiter: Arc::new(TokenBucketLimiter::with_clock(config.rate_limit, clock)),
            invoker: Arc::new(invoker),
            flavorer: Arc::new(Flavorer::new(config.flavor_enabled, config.flavor_seed)),
            persona: Arc::from(config.persona.as_str()),
            assistant_label: config.assistant_label.clone(),
            cors: CorsPolicy::new(&config.allowed_origin_prefix, &config.default_origin),
            max_request_bytes: config.max_request_bytes,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

/// Build state from environment variables (see [`AppConfig::from_env`]) with
/// the OpenAI-compatible HTTP backend.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    let backend = OpenAiCompatibleBackend::new(
        config.upstream_url.clone(),
        config.api_key.clone(),
        config.upstream_timeout_ms.map(Duration::from_millis),
    )?;
    tracing::info!(
        models = ?config.candidate_models(),
        upstream = %config.upstream_url,
        "folio-chat configured"
    );
    Ok(AppState::new(&config, Arc::new(backend)))
}

/// Build the Axum router.  The CORS layer wraps every route and the panic
/// handler, so extractor rejections and crashed requests carry the
/// allow-origin header too.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;
    let cors = state.cors.clone();

    Router::new()
        .route("/api/chat", any(chat_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(cors, cors_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn respond_with_error(err: ErrorResponse) -> Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

async fn cors_middleware(State(cors): State<CorsPolicy>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut response = next.run(request).await;
    cors.apply(origin.as_deref(), response.headers_mut());
    response
}

fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(detail = %detail, "request handler panicked");
    respond_with_error(ErrorResponse::new(500, "Internal error").with_detail(detail))
}

/// Handler for `/api/chat`.  Preflight and method checks come first, then
/// the rate limiter.  The body is only read once the limiter admits the
/// request.
async fn chat_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    if method == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        util::apply_preflight(response.headers_mut());
        return response;
    }
    if method != Method::POST {
        return respond_with_error(ErrorResponse::new(405, "Method not allowed"));
    }

    let start = Instant::now();
    let identity = util::client_identity(request.headers(), peer.map(|ConnectInfo(addr)| addr));
    if !state.limiter.allow(&identity) {
        tracing::warn!(client = %identity, "rate limit exceeded");
        state
            .metrics
            .record(Outcome::RateLimited, elapsed_ms(start));
        return respond_with_error(ErrorResponse::new(
            429,
            "Too many requests, please slow down and try again shortly",
        ));
    }

    let payload = Json::<serde_json::Value>::from_request(request, &state).await;
    let (response, outcome) = answer(&state, payload).await;
    state.metrics.record(outcome, elapsed_ms(start));
    response
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

async fn answer(
    state: &AppState,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> (Response, Outcome) {
    let payload = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return (handle_json_rejection(state, rejection), Outcome::Rejected),
    };

    let message = match guard::validate(payload.get("message")) {
        Ok(message) => message,
        Err(err) => {
            let resp = respond_with_error(ErrorResponse::new(err.http_status(), err.to_string()));
            return (resp, Outcome::Rejected);
        }
    };
    let history = ChatTurn::list_from_value(payload.get("history"));
    let prompt = prompt::build_prompt(&state.persona, &history, &message);

    match state.invoker.complete(&prompt).await {
        Ok(completion) => {
            let answer = state.flavorer.apply(&completion.answer);
            let body = ChatResponse {
                answer,
                assistant: state.assistant_label.clone(),
            };
            let outcome = Outcome::Answered {
                fallbacks: completion.attempts.saturating_sub(1) as u64,
            };
            ((StatusCode::OK, Json(body)).into_response(), outcome)
        }
        Err(err) => {
            tracing::error!(error = %err, "completion failed");
            let resp = match err {
                CompletionError::AllModelsFailed { last_error } => {
                    ErrorResponse::new(500, "All models failed").with_detail(last_error)
                }
                CompletionError::Upstream(upstream) => {
                    ErrorResponse::new(500, "Upstream request failed").with_detail(upstream.to_string())
                }
            };
            (respond_with_error(resp), Outcome::Failed)
        }
    }
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            tracing::warn!(limit = state.max_request_bytes, "request body exceeded configured limit");
            respond_with_error(ErrorResponse::new(
                413,
                format!(
                    "Request too large (body exceeded limit {} bytes)",
                    state.max_request_bytes
                ),
            ))
        }
        other => {
            tracing::debug!(error = %other, "unreadable request body");
            respond_with_error(ErrorResponse::new(400, "Invalid JSON body"))
        }
    }
}

/// Health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.invoker.models(),
        "trackedClients": state.limiter.len(),
        "startedAt": state.metrics.started_at().to_rfc3339(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(state.limiter.len()),
    )
        .into_response()
}
