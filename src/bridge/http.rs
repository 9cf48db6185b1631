use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use super::events::EventSink;
use super::{dispatch, parse_request, reply_frame, BridgeState};

/// HTTP fallback: the same envelope as the WS transport, one JSON reply,
/// no streaming. Schema and command listing are plain GETs so an agent
/// can discover the surface before opening a socket.
pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rpc", post(rpc))
        .route("/schema", get(schema))
        .route("/commands", get(commands))
        .fallback(not_found)
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}

async fn rpc(
    State(state): State<BridgeState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Json<Value> {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(e) => return Json(reply_frame(Value::Null, &Err(e))),
    };

    // Token may ride in the body or as a bearer header.
    let token = request.token.clone().or_else(|| {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(String::from)
    });

    let id = request.id.unwrap_or(0);
    let id_value = request.id.map(|v| json!(v)).unwrap_or(Value::Null);
    let result = dispatch(
        &state,
        id,
        request.cmd,
        request.args,
        token,
        &addr.to_string(),
        EventSink::detached(id),
    )
    .await;
    Json(reply_frame(id_value, &result))
}

async fn schema(State(state): State<BridgeState>) -> Json<Value> {
    let settings = state.core.settings.load();
    Json(state.registry.schema(&settings))
}

async fn commands(State(state): State<BridgeState>) -> Json<Value> {
    let settings = state.core.settings.load();
    Json(state.registry.command_list(&settings))
}
