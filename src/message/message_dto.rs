use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::conversation::conversation_models::Conversation;
use crate::message::message_models::{Attachment, MessageResponse};

#[derive(Clone, Debug, Deserialize, Validate, ToSchema)]
pub struct SendMessageRequest {
    /// text, image, file, system, product or order
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[validate(length(max = 10000))]
    pub content: Option<String>,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub attachments: Vec<Attachment>,
    #[schema(value_type = Option<Object>)]
    pub meta: Option<serde_json::Value>,
}

fn default_kind() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageQuery {
    /// Return messages strictly older than this one
    pub before: Option<Uuid>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub last_message: Option<MessageResponse>,
    pub unread_count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MarkConversationReadResponse {
    pub message_ids: Vec<Uuid>,
}
