use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::middleware::request_logging;
use crate::engine::{DecisionEngine, DirectDecision, BIDDER_PROCESSOR_PATH};
use crate::error::{EngineError, RejectReason};
use crate::request::RawRequest;

pub const NOT_ACTIVE_HEADER: &str = "x-not-active";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DecisionEngine>,
}

/// Create the API router
pub fn create_router(engine: Arc<DecisionEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/rotator", get(direct))
        .route("/rotator/target", get(target))
        .route("/rotator/target/v2", get(target_v2))
        .route("/rotator/target/bidder_init", get(bidder_init))
        .route(BIDDER_PROCESSOR_PATH, get(bidder_processor))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Everything the engine reads from one inbound request.
fn raw_request(
    state: &AppState,
    query: HashMap<String, String>,
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> RawRequest {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    RawRequest {
        query,
        user_agent: text(header::USER_AGENT.as_str()),
        referer: text(header::REFERER.as_str()),
        forwarded_for: text("x-forwarded-for"),
        remote_addr: peer.map(|ConnectInfo(addr)| addr.ip()),
        geo_hint: text(&state.engine.config().geo_header),
    }
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.render_metrics(),
    )
        .into_response()
}

async fn direct(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, NoContent> {
    let raw = raw_request(&state, query, &headers, peer);
    match state.engine.decide_direct(&raw).await? {
        DirectDecision::VastWrapper(tag) => Ok(Json(tag).into_response()),
        DirectDecision::Redirect(url) => {
            let location = HeaderValue::from_str(&url)
                .map_err(|e| EngineError::Encoding(format!("redirect location: {}", e)))?;
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
    }
}

async fn target(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, NoContent> {
    let raw = raw_request(&state, query, &headers, peer);
    let decision = state.engine.decide_targeting_global(&raw).await?;
    Ok(Json(decision).into_response())
}

async fn target_v2(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, NoContent> {
    let raw = raw_request(&state, query, &headers, peer);
    let decision = state.engine.decide_targeting(&raw).await?;
    Ok(Json(decision).into_response())
}

async fn bidder_init(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, NoContent> {
    let raw = raw_request(&state, query, &headers, peer);
    let session = state.engine.rtb_init(&raw).await?;
    Ok(Json(session).into_response())
}

async fn bidder_processor(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, NoContent> {
    let raw = raw_request(&state, query, &headers, peer);
    let decision = state.engine.run_auction(&raw).await?;
    Ok(Json(decision).into_response())
}

// ===== Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

// ===== Error Handling =====

/// Every engine failure is answered with an empty 204.
#[derive(Debug)]
pub struct NoContent(pub EngineError);

impl From<EngineError> for NoContent {
    fn from(err: EngineError) -> Self {
        NoContent(err)
    }
}

impl IntoResponse for NoContent {
    fn into_response(self) -> Response {
        match self.0 {
            EngineError::Rejected(RejectReason::NotActive) => (
                StatusCode::NO_CONTENT,
                [(NOT_ACTIVE_HEADER, HeaderValue::from_static("true"))],
            )
                .into_response(),
            _ => StatusCode::NO_CONTENT.into_response(),
        }
    }
}
