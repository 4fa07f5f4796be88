//! Per-runner WebSocket session.
//!
//! One task owns the socket. The first message must be `register`; after
//! that the task pumps outbound messages from the registry channel and
//! inbound messages to the registry, in arrival order. Dropping the
//! socket detaches the runner.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::RunnerRegistry;
use super::protocol::{self, RunnerMessage, ServerMessage};
use crate::api::SharedState;

/// How long a fresh socket may sit silent before sending `register`.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn runner_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let registry = Arc::clone(&state.registry);
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<RunnerRegistry>) {
    let (mut sender, mut receiver) = socket.split();

    // Registration handshake.
    let first = tokio::time::timeout(REGISTER_TIMEOUT, receiver.next()).await;
    let (runner_type, runner_id) = match first {
        Ok(Some(Ok(Message::Text(text)))) => match protocol::decode(text.as_str()) {
            Ok(RunnerMessage::Register {
                runner_type,
                runner_id,
            }) => (runner_type, runner_id),
            Ok(_) => {
                let _ = sender
                    .send(Message::Close(None))
                    .await;
                tracing::warn!("first runner message was not register");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed register message");
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        },
        _ => {
            tracing::debug!("runner socket closed before register");
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let runner = match registry.register(&runner_type, runner_id, tx).await {
        Ok(runner) => runner,
        Err(e) => {
            tracing::warn!(runner_type, error = %e, "registration rejected");
            if let Ok(text) =
                serde_json::to_string(&serde_json::json!({"type": "error", "payload": {
                    "kind": e.kind(), "message": e.to_string()
                }}))
            {
                let _ = sender.send(Message::Text(text.into())).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let runner_id = runner.id;

    let welcome = ServerMessage::Welcome { runner_id };
    match protocol::encode(&welcome) {
        Ok(text) => {
            if sender.send(Message::Text(text.into())).await.is_err() {
                registry.detach(runner_id).await;
                return;
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode welcome");
            registry.detach(runner_id).await;
            return;
        }
    }

    // Session loop: outbound channel + inbound socket, in arrival order.
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let is_shutdown = matches!(msg, ServerMessage::Shutdown);
                        match protocol::encode(&msg) {
                            Ok(text) => {
                                if sender.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!(runner_id, error = %e, "encode failed");
                            }
                        }
                        if is_shutdown {
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match protocol::decode(text.as_str()) {
                            Ok(msg) => registry.on_message(runner_id, msg).await,
                            Err(e) => {
                                tracing::warn!(runner_id, error = %e, "malformed runner message");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/pong ignored
                    Some(Err(e)) => {
                        tracing::debug!(runner_id, error = %e, "runner socket error");
                        break;
                    }
                }
            }
        }
    }

    registry.detach(runner_id).await;
}
