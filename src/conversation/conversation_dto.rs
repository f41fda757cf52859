use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateDirectRequest {
    /// The other participant
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateGroupRequest {
    /// The caller is always added; at least one other user is required
    #[validate(length(min = 1))]
    pub participant_ids: Vec<Uuid>,
    #[validate(length(min = 1, max = 255))]
    pub title: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateGroupRequest {
    #[validate(length(min = 1, max = 255))]
    pub title: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
}
