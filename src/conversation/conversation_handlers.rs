use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    conversation::conversation_dto::{
        AddParticipantRequest, CreateDirectRequest, CreateGroupRequest, UpdateGroupRequest,
    },
    error::Result,
    middleware::AuthUser,
    state::AppState,
};

/// Get or create the direct conversation with another user
#[utoipa::path(
    post,
    path = "/api/conversations/direct",
    tag = "conversations",
    request_body = CreateDirectRequest,
    responses(
        (status = 200, description = "The direct conversation for this pair", body = crate::conversation::conversation_models::Conversation),
        (status = 400, description = "Cannot start a conversation with yourself"),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn create_direct(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreateDirectRequest>,
) -> Result<impl IntoResponse> {
    let conversation = state
        .conversation_service
        .get_or_create_direct(user_id, payload.user_id)
        .await?;

    Ok((StatusCode::OK, Json(conversation)))
}

/// Create a group conversation
#[utoipa::path(
    post,
    path = "/api/conversations/groups",
    tag = "conversations",
    request_body = CreateGroupRequest,
    responses(
        (status = 201, description = "Group created", body = crate::conversation::conversation_models::Conversation),
        (status = 400, description = "Validation error"),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn create_group(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;

    let mut participants = vec![user_id];
    participants.extend(payload.participant_ids);

    let conversation = state
        .conversation_service
        .create_group(participants, payload.title, payload.avatar_url)
        .await?;

    Ok((StatusCode::CREATED, Json(conversation)))
}

/// List the caller's conversations with previews and unread counts
#[utoipa::path(
    get,
    path = "/api/conversations",
    tag = "conversations",
    responses(
        (status = 200, description = "Conversation summaries", body = Vec<crate::message::message_dto::ConversationSummary>),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<impl IntoResponse> {
    let summaries = state.message_service.summaries(user_id).await?;

    Ok((StatusCode::OK, Json(summaries)))
}

/// Get a conversation
#[utoipa::path(
    get,
    path = "/api/conversations/{id}",
    tag = "conversations",
    params(
        ("id" = Uuid, Path, description = "Conversation ID")
    ),
    responses(
        (status = 200, description = "Conversation", body = crate::conversation::conversation_models::Conversation),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Conversation not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn get_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let conversation = state
        .conversation_service
        .require_participant(conversation_id, user_id)
        .await?;

    Ok((StatusCode::OK, Json(conversation)))
}

/// Update a group's title or avatar
#[utoipa::path(
    patch,
    path = "/api/conversations/{id}",
    tag = "conversations",
    params(
        ("id" = Uuid, Path, description = "Conversation ID")
    ),
    request_body = UpdateGroupRequest,
    responses(
        (status = 200, description = "Group updated", body = crate::conversation::conversation_models::Conversation),
        (status = 400, description = "Validation error or not a group"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Conversation not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn update_group(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;

    let conversation = state
        .conversation_service
        .update_group(user_id, conversation_id, payload.title, payload.avatar_url)
        .await?;

    Ok((StatusCode::OK, Json(conversation)))
}

/// Add a participant
#[utoipa::path(
    post,
    path = "/api/conversations/{id}/participants",
    tag = "conversations",
    params(
        ("id" = Uuid, Path, description = "Conversation ID")
    ),
    request_body = AddParticipantRequest,
    responses(
        (status = 200, description = "Updated conversation", body = crate::conversation::conversation_models::Conversation),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Conversation not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn add_participant(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<AddParticipantRequest>,
) -> Result<impl IntoResponse> {
    let conversation = state
        .conversation_service
        .add_participant(user_id, conversation_id, payload.user_id)
        .await?;

    Ok((StatusCode::OK, Json(conversation)))
}

/// Remove a participant
#[utoipa::path(
    delete,
    path = "/api/conversations/{id}/participants/{user_id}",
    tag = "conversations",
    params(
        ("id" = Uuid, Path, description = "Conversation ID"),
        ("user_id" = Uuid, Path, description = "Participant to remove")
    ),
    responses(
        (status = 200, description = "Updated conversation", body = crate::conversation::conversation_models::Conversation),
        (status = 400, description = "Would leave fewer than two participants"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Conversation or participant not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn remove_participant(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path((conversation_id, removed_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse> {
    let conversation = state
        .conversation_service
        .remove_participant(user_id, conversation_id, removed_id)
        .await?;

    Ok((StatusCode::OK, Json(conversation)))
}
