use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::Result,
    message::{
        message_dto::{MarkConversationReadResponse, PageQuery, SendMessageRequest},
        message_models::{MessageResponse, NewMessage},
    },
    middleware::AuthUser,
    state::AppState,
};

/// Send a message to a conversation
#[utoipa::path(
    post,
    path = "/api/conversations/{id}/messages",
    tag = "messages",
    params(
        ("id" = Uuid, Path, description = "Conversation ID")
    ),
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message stored and broadcast", body = MessageResponse),
        (status = 400, description = "Invalid message"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Conversation not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn send_message(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;

    let new = NewMessage::from_parts(
        conversation_id,
        user_id,
        &payload.kind,
        payload.content,
        payload.attachments,
        payload.meta,
    )?;
    let message = state.message_service.append(new).await?;

    Ok((StatusCode::CREATED, Json(MessageResponse::from(message))))
}

/// Page through a conversation's history, newest first
#[utoipa::path(
    get,
    path = "/api/conversations/{id}/messages",
    tag = "messages",
    params(
        ("id" = Uuid, Path, description = "Conversation ID"),
        PageQuery
    ),
    responses(
        (status = 200, description = "Messages older than the cursor", body = Vec<MessageResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Conversation or cursor not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn get_messages(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let messages = state
        .message_service
        .page(conversation_id, user_id, query.before, query.limit)
        .await?;

    let responses: Vec<MessageResponse> = messages
        .into_iter()
        .map(MessageResponse::from)
        .collect();

    Ok((StatusCode::OK, Json(responses)))
}

/// Mark a message as read
#[utoipa::path(
    patch,
    path = "/api/messages/{id}/read",
    tag = "messages",
    params(
        ("id" = Uuid, Path, description = "Message ID to mark as read")
    ),
    responses(
        (status = 200, description = "Message marked as read", body = MessageResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Message not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn mark_message_read(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let message = state.message_service.mark_read(message_id, user_id).await?;

    Ok((StatusCode::OK, Json(MessageResponse::from(message))))
}

/// Mark every message in a conversation as read
#[utoipa::path(
    post,
    path = "/api/conversations/{id}/read",
    tag = "messages",
    params(
        ("id" = Uuid, Path, description = "Conversation ID")
    ),
    responses(
        (status = 200, description = "Messages newly marked as read", body = MarkConversationReadResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Conversation not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let message_ids = state
        .message_service
        .mark_conversation_read(conversation_id, user_id)
        .await?;

    Ok((StatusCode::OK, Json(MarkConversationReadResponse { message_ids })))
}

/// Hide a message from your own view
#[utoipa::path(
    delete,
    path = "/api/messages/{id}",
    tag = "messages",
    params(
        ("id" = Uuid, Path, description = "Message ID")
    ),
    responses(
        (status = 204, description = "Message hidden for the caller"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Message not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn delete_message(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state
        .message_service
        .soft_delete_for_user(message_id, user_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
