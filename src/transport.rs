//! Transport: the axum router binding the WebSocket session protocol
//! and a plain health endpoint to the network.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use tower_http::trace::TraceLayer;

use crate::inference::Recognizer;
use crate::session::{OutboundMessage, SessionCore};

#[derive(Clone)]
pub struct AppState {
    pub recognizer: Arc<dyn Recognizer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// One Session Core per accepted connection. Compute-heavy work is
/// dispatched by the session to a background task (see
/// `session::SessionCore::handle_text`), so this loop races the next
/// inbound frame against the session's finalize-completion channel
/// rather than ever awaiting the pipeline directly — a `ping` sent
/// while a `stop` is still finalizing gets answered immediately.
async fn handle_connection(mut socket: WebSocket, state: AppState) {
    tracing::info!("Client connected | 客户端已连接");
    let mut session = SessionCore::new(Arc::clone(&state.recognizer));

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                let outbound = match message {
                    Message::Text(text) => session.handle_text(text.as_str()),
                    Message::Binary(data) => {
                        session.handle_binary(data.to_vec());
                        Vec::new()
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => Vec::new(),
                };
                if !send_all(&mut socket, outbound).await {
                    break;
                }
            }
            outbound = session.next_finalize_result() => {
                if !send_all(&mut socket, outbound).await {
                    break;
                }
            }
        }
    }

    tracing::info!("Client disconnected | 客户端已断开");
}

/// Sends each outbound message in order; stops at the first write
/// failure (broken connection) and reports whether the caller should
/// keep serving this socket.
async fn send_all(socket: &mut WebSocket, outbound: Vec<OutboundMessage>) -> bool {
    for out in outbound {
        if socket.send(Message::Text(out.to_json().into())).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct StubRecognizer;
    impl Recognizer for StubRecognizer {
        fn transcribe(&self, pcm: &[i16], sr: u32) -> crate::inference::Result<String> {
            Ok(format!("[pcm_bytes={} sr={}]", pcm.len() * 2, sr))
        }
    }

    #[tokio::test]
    async fn health_should_report_ok() {
        let app = router(AppState {
            recognizer: Arc::new(StubRecognizer),
        });
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
