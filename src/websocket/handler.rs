use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    message::NewMessage,
    middleware::AuthUser,
    state::AppState,
    websocket::types::{ClientMessage, ErrorPayload, ServerEvent},
};

use super::connection::{SessionId, WsSender};

/// Realtime connection for one authenticated user.
///
/// The client joins conversation rooms and receives `message:new`,
/// `message:read`, `typing` and `conversation:updated` events for them.
/// Sends and read receipts over the socket go through the same services as
/// the REST endpoints.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: Uuid, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config.ws_send_buffer);

    let session_id = state.session_hub.connect(user_id, tx.clone());
    tracing::info!("WebSocket session {} opened for user {}", session_id, user_id);

    // Task: send events from the session channel to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to encode event: {:?}", e),
            }
        }
    });

    // Task: receive client frames
    let state_clone = state.clone();
    let tx_clone = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Err(e) =
                        process_client_message(&text, session_id, user_id, &state_clone, &tx_clone).await
                    {
                        tracing::debug!("Rejected frame from session {}: {}", session_id, e);
                        reply(&tx_clone, error_event(&e));
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Heartbeat task
    let tx_heartbeat = tx.clone();
    let heartbeat_every = Duration::from_secs(state.config.ws_heartbeat_secs.max(1));
    let mut heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_every);
        loop {
            interval.tick().await;
            match tx_heartbeat.try_send(ServerEvent::Ping) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => break,
            }
        }
    });

    // Stop all tasks when any one finishes
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            heartbeat_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
            heartbeat_task.abort();
        },
        _ = &mut heartbeat_task => {
            send_task.abort();
            recv_task.abort();
        }
    }

    state.session_hub.disconnect(session_id);
    tracing::info!("WebSocket session {} closed for user {}", session_id, user_id);
}

async fn process_client_message(
    text: &str,
    session_id: SessionId,
    user_id: Uuid,
    state: &AppState,
    tx: &WsSender,
) -> Result<()> {
    let client_msg: ClientMessage = serde_json::from_str(text)
        .map_err(|e| AppError::BadRequest(format!("Invalid message format: {}", e)))?;

    match client_msg {
        ClientMessage::Join { conversation_id } => {
            state.session_hub.join(session_id, conversation_id).await?;
        }

        ClientMessage::Leave { conversation_id } => {
            state.session_hub.leave(session_id, conversation_id);
        }

        ClientMessage::SendMessage {
            conversation_id,
            kind,
            content,
            attachments,
            meta,
        } => {
            let new = NewMessage::from_parts(
                conversation_id,
                user_id,
                &kind,
                content,
                attachments,
                meta,
            )?;
            // The sender's sessions receive message:new as the acknowledgement
            state.message_service.append(new).await?;
        }

        ClientMessage::MarkRead { message_id } => {
            state.message_service.mark_read(message_id, user_id).await?;
        }

        ClientMessage::Typing {
            conversation_id,
            is_typing,
        } => {
            state
                .session_hub
                .typing(session_id, conversation_id, is_typing)?;
        }

        ClientMessage::Ping => reply(tx, ServerEvent::Pong),
    }

    Ok(())
}

fn error_event(e: &AppError) -> ServerEvent {
    ServerEvent::Error(ErrorPayload {
        message: e.client_message(),
    })
}

fn reply(tx: &WsSender, event: ServerEvent) {
    if let Err(e) = tx.try_send(event) {
        tracing::debug!("Dropped reply to client: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_frames_hide_internal_details() {
        match error_event(&AppError::Database(sqlx::Error::PoolTimedOut)) {
            ServerEvent::Error(payload) => assert_eq!(payload.message, "Internal server error"),
            other => panic!("unexpected event {:?}", other),
        }

        match error_event(&AppError::Forbidden("Not a participant".into())) {
            ServerEvent::Error(payload) => assert_eq!(payload.message, "Forbidden: Not a participant"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
