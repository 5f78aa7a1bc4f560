//! Per-connection WebSocket handling and control-message dispatch.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use valet_error::{ErrorKind, ValetError};
use valet_protocol::{ClientMessage, ServerMessage};

use super::registry::OutboundFrame;
use super::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let client_id = state.registry.register(outbound_tx).await;
    tracing::info!(%client_id, "client connected");

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(OutboundFrame::Message(value)) => {
                    if ws_tx.send(Message::Text(value.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundFrame::Ping) => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                // Registry dropped us (heartbeat eviction): close and stop.
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.registry.touch(&client_id).await;
                    dispatch(&state, &client_id, &text).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    state.registry.touch(&client_id).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    state.registry.touch(&client_id).await;
                    if ws_tx.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(%client_id, error = %err, "socket error");
                    break;
                }
            },
        }
    }

    state.registry.remove(&client_id).await;
    tracing::info!(%client_id, "client disconnected");
}

/// Handle one inbound control message.
///
/// Failures here are local to the sending client: a malformed payload gets
/// an `error` response and nothing else happens.
pub async fn dispatch(state: &Arc<AppState>, client_id: &str, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            state
                .registry
                .send_to(
                    client_id,
                    &ServerMessage::error(format!("malformed message: {err}")),
                )
                .await;
            return;
        }
    };

    if !state.registry.is_authenticated(client_id).await && !message.allowed_unauthenticated() {
        state
            .registry
            .send_to(
                client_id,
                &ServerMessage::AuthFail {
                    reason: "authentication required".to_string(),
                },
            )
            .await;
        return;
    }

    match message {
        ClientMessage::Auth { secret, channel } => {
            let accepted = match &state.secret {
                // Local-trust mode: no secret configured.
                None => true,
                Some(expected) => secret.as_deref() == Some(expected.as_str()),
            };
            if accepted {
                state.registry.mark_authenticated(client_id, channel).await;
                state
                    .registry
                    .send_to(
                        client_id,
                        &ServerMessage::AuthOk {
                            client_id: client_id.to_string(),
                        },
                    )
                    .await;
            } else {
                tracing::warn!(client_id, code = ErrorKind::AuthFailure.as_code(), "authentication rejected");
                state
                    .registry
                    .send_to(
                        client_id,
                        &ServerMessage::AuthFail {
                            reason: "invalid secret".to_string(),
                        },
                    )
                    .await;
            }
        }
        ClientMessage::Ping => {
            state.registry.send_to(client_id, &ServerMessage::Pong).await;
        }
        ClientMessage::AgentRequest {
            session_id,
            message,
            model,
            thinking,
        } => {
            let session_id = session_id.unwrap_or_else(|| state.service.mint_session_id());
            // Subscribe before the execution starts so no early events are
            // missed.
            state.registry.subscribe(client_id, &session_id).await;
            if let Err(err) = state
                .service
                .request(session_id, message, model, thinking)
                .await
            {
                state
                    .registry
                    .send_to(client_id, &ServerMessage::error(err.to_string()))
                    .await;
            }
        }
        ClientMessage::AgentCancel { session_id } => {
            // Cancelling an idle session is a no-op; the terminal event for
            // an active one flows through the session's subscribers.
            if !state.service.cancel(&session_id).await {
                tracing::debug!(client_id, %session_id, "cancel for idle session ignored");
            }
        }
        ClientMessage::SessionList => {
            let sessions = state.service.list().await;
            state
                .registry
                .send_to(
                    client_id,
                    &ServerMessage::SessionData {
                        sessions: Some(sessions),
                        session: None,
                    },
                )
                .await;
        }
        ClientMessage::SessionResume { session_id } => match state.service.meta(&session_id).await
        {
            Some(meta) => {
                state.registry.subscribe(client_id, &session_id).await;
                state
                    .registry
                    .send_to(
                        client_id,
                        &ServerMessage::SessionData {
                            sessions: None,
                            session: Some(meta),
                        },
                    )
                    .await;
            }
            None => {
                state
                    .registry
                    .send_to(
                        client_id,
                        &ServerMessage::error(
                            ValetError::SessionNotFound { session_id }.to_string(),
                        ),
                    )
                    .await;
            }
        },
        ClientMessage::Status => {
            let status = state.status().await;
            state
                .registry
                .send_to(client_id, &ServerMessage::StatusData { status })
                .await;
        }
    }
}
