use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::CoreError;

use super::events::EventSink;
use super::{dispatch, parse_request, reply_frame, BridgeState};

pub fn router(state: BridgeState) -> Router {
    Router::new().route("/", get(upgrade)).with_state(state)
}

async fn upgrade(
    State(state): State<BridgeState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr))
}

/// One WS connection hosts many concurrent request ids. All outbound
/// frames (events and terminal replies) funnel through a single ordered
/// queue per connection; closing the socket cancels every outstanding
/// request.
async fn handle_connection(socket: WebSocket, state: BridgeState, addr: SocketAddr) {
    state.attached.fetch_add(1, Ordering::SeqCst);
    tracing::info!(peer = %addr, "agent connected");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (mut ws_sink, mut ws_stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => {
                let request = match parse_request(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        // Unrecoverable framing problem: report with a null id.
                        let _ = out_tx.send(reply_frame(Value::Null, &Err(e)));
                        continue;
                    }
                };
                let Some(id) = request.id else {
                    let _ = out_tx.send(reply_frame(
                        Value::Null,
                        &Err(CoreError::InvalidRequest("missing id".into())),
                    ));
                    continue;
                };

                // Every request runs as its own task; acceptance order is
                // preserved here, completion order is whatever it is.
                let state = state.clone();
                let out_tx = out_tx.clone();
                let sink = EventSink::new(id, out_tx.clone(), cancel_rx.clone());
                let peer = addr.to_string();
                tokio::spawn(async move {
                    let result =
                        dispatch(&state, id, request.cmd, request.args, request.token, &peer, sink)
                            .await;
                    // A cancelled request has no one left to reply to.
                    if !matches!(result, Err(CoreError::Cancelled)) {
                        let _ = out_tx.send(reply_frame(serde_json::json!(id), &result));
                    }
                });
            }
            Message::Close(_) => break,
            // Ping/pong is handled by the protocol layer; binary is not
            // part of the envelope.
            _ => {}
        }
    }

    let _ = cancel_tx.send(true);
    writer.abort();
    state.attached.fetch_sub(1, Ordering::SeqCst);
    tracing::info!(peer = %addr, "agent disconnected");
}
