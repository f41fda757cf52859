use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    conversation::conversation_models::Conversation,
    message::message_models::{Attachment, MessageResponse},
};

/// Server-to-client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(MessageNewPayload),
    #[serde(rename = "message:read")]
    MessageRead(MessageReadPayload),
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    #[serde(rename = "conversation:updated")]
    ConversationUpdated(ConversationUpdatedPayload),
    #[serde(rename = "joined")]
    Joined(RoomPayload),
    #[serde(rename = "left")]
    Left(RoomPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageNewPayload {
    pub conversation_id: Uuid,
    pub message: MessageResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReadPayload {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub reader_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationUpdatedPayload {
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPayload {
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

// Client-to-server messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        conversation_id: Uuid,
    },
    Leave {
        conversation_id: Uuid,
    },
    SendMessage {
        conversation_id: Uuid,
        #[serde(default = "default_kind")]
        kind: String,
        content: Option<String>,
        #[serde(default)]
        attachments: Vec<Attachment>,
        meta: Option<serde_json::Value>,
    },
    MarkRead {
        message_id: Uuid,
    },
    Typing {
        conversation_id: Uuid,
        is_typing: bool,
    },
    Ping,
}

fn default_kind() -> String {
    "text".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_event_tags() {
        let event = ServerEvent::MessageRead(MessageReadPayload {
            conversation_id: Uuid::nil(),
            message_id: Uuid::nil(),
            reader_id: Uuid::nil(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "message:read");
        assert_eq!(value["reader_id"], Uuid::nil().to_string());

        assert_eq!(serde_json::to_value(ServerEvent::Pong).unwrap(), json!({ "type": "pong" }));
    }

    #[test]
    fn test_client_message_parsing() {
        let id = Uuid::new_v4();
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "send_message",
            "conversation_id": id,
            "content": "hi"
        }))
        .unwrap();

        match msg {
            ClientMessage::SendMessage {
                conversation_id,
                kind,
                content,
                attachments,
                ..
            } => {
                assert_eq!(conversation_id, id);
                assert_eq!(kind, "text");
                assert_eq!(content.as_deref(), Some("hi"));
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }

        assert!(matches!(
            serde_json::from_value::<ClientMessage>(json!({ "type": "ping" })).unwrap(),
            ClientMessage::Ping
        ));
    }
}
