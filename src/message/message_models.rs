use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
    Product,
    Order,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
            MessageKind::Product => "product",
            MessageKind::Order => "order",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "system" => Ok(MessageKind::System),
            "product" => Ok(MessageKind::Product),
            "order" => Ok(MessageKind::Order),
            other => Err(AppError::Validation(format!("Unknown message type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Attachment {
    pub url: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRef {
    pub product_id: Uuid,
    pub name: Option<String>,
    pub price_cents: Option<i64>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: Uuid,
    pub status: Option<String>,
    pub total_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNotice {
    pub event: String,
    pub subject_id: Option<Uuid>,
}

/// Per-type payload of a message. The variant is the message's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageMeta {
    Text,
    Image,
    File,
    System(SystemNotice),
    Product(ProductRef),
    Order(OrderRef),
}

impl MessageMeta {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageMeta::Text => MessageKind::Text,
            MessageMeta::Image => MessageKind::Image,
            MessageMeta::File => MessageKind::File,
            MessageMeta::System(_) => MessageKind::System,
            MessageMeta::Product(_) => MessageKind::Product,
            MessageMeta::Order(_) => MessageKind::Order,
        }
    }

    /// Builds the payload for `kind` from an untyped request body.
    pub fn from_parts(kind: MessageKind, meta: Option<serde_json::Value>) -> Result<Self> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: MessageKind,
            meta: Option<serde_json::Value>,
        ) -> Result<T> {
            let value = meta.ok_or_else(|| {
                AppError::Validation(format!("Messages of type {} require meta", kind))
            })?;
            serde_json::from_value(value)
                .map_err(|e| AppError::Validation(format!("Invalid {} meta: {}", kind, e)))
        }

        match kind {
            MessageKind::Text => Ok(MessageMeta::Text),
            MessageKind::Image => Ok(MessageMeta::Image),
            MessageKind::File => Ok(MessageMeta::File),
            MessageKind::System => Ok(MessageMeta::System(parse(kind, meta)?)),
            MessageKind::Product => Ok(MessageMeta::Product(parse(kind, meta)?)),
            MessageKind::Order => Ok(MessageMeta::Order(parse(kind, meta)?)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Position in the conversation's log, starting at 1.
    pub seq: i64,
    pub content: Option<String>,
    pub attachments: Vec<Attachment>,
    pub meta: MessageMeta,
    pub read_by: Vec<Uuid>,
    pub deleted_for: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.meta.kind()
    }

    pub fn is_read_by(&self, user_id: Uuid) -> bool {
        self.read_by.contains(&user_id)
    }

    pub fn is_deleted_for(&self, user_id: Uuid) -> bool {
        self.deleted_for.contains(&user_id)
    }
}

/// Row shape of the `messages` table.
#[derive(Debug, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub seq: i64,
    pub kind: String,
    pub content: Option<String>,
    pub attachments: Json<Vec<Attachment>>,
    pub meta: Json<MessageMeta>,
    pub read_by: Vec<Uuid>,
    pub deleted_for: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            seq: row.seq,
            content: row.content,
            attachments: row.attachments.0,
            meta: row.meta.0,
            read_by: row.read_by,
            deleted_for: row.deleted_for,
            created_at: row.created_at,
        }
    }
}

/// A message ready to be appended; the store assigns id order and `seq`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub attachments: Vec<Attachment>,
    pub meta: MessageMeta,
}

impl NewMessage {
    pub fn from_parts(
        conversation_id: Uuid,
        sender_id: Uuid,
        kind: &str,
        content: Option<String>,
        attachments: Vec<Attachment>,
        meta: Option<serde_json::Value>,
    ) -> Result<Self> {
        let kind: MessageKind = kind.parse()?;
        let meta = MessageMeta::from_parts(kind, meta)?;

        let message = Self {
            conversation_id,
            sender_id,
            content,
            attachments,
            meta,
        };
        message.validate()?;

        Ok(message)
    }

    pub fn text(conversation_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            content: Some(content.into()),
            attachments: Vec::new(),
            meta: MessageMeta::Text,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let has_content = self
            .content
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false);

        match self.meta.kind() {
            MessageKind::Text if !has_content => {
                return Err(AppError::Validation(
                    "Text messages require content".to_string(),
                ));
            }
            MessageKind::Image | MessageKind::File if self.attachments.is_empty() => {
                return Err(AppError::Validation(format!(
                    "Messages of type {} require at least one attachment",
                    self.meta.kind()
                )));
            }
            _ => {}
        }

        if self.attachments.iter().any(|a| a.url.trim().is_empty()) {
            return Err(AppError::Validation(
                "Attachment url must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn into_message(self, id: Uuid, seq: i64, created_at: DateTime<Utc>) -> Message {
        Message {
            id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            seq,
            content: self.content,
            attachments: self.attachments,
            meta: self.meta,
            read_by: Vec::new(),
            deleted_for: Vec::new(),
            created_at,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub seq: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Option<String>,
    pub attachments: Vec<Attachment>,
    #[schema(value_type = Object)]
    pub meta: MessageMeta,
    pub read_by: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            seq: message.seq,
            kind: message.kind(),
            content: message.content,
            attachments: message.attachments,
            meta: message.meta,
            read_by: message.read_by,
            created_at: message.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_kind_round_trips_through_str() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::File,
            MessageKind::System,
            MessageKind::Product,
            MessageKind::Order,
        ] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!(matches!(
            "sticker".parse::<MessageKind>(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_text_requires_content() {
        let conversation = Uuid::new_v4();
        let sender = Uuid::new_v4();

        assert!(NewMessage::text(conversation, sender, "hi").validate().is_ok());
        assert!(matches!(
            NewMessage::text(conversation, sender, "   ").validate(),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            NewMessage::from_parts(conversation, sender, "text", None, vec![], None),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_image_requires_attachment() {
        let attachment = Attachment {
            url: "https://cdn.example.com/a.png".into(),
            name: Some("a.png".into()),
            mime_type: Some("image/png".into()),
            size: Some(1024),
        };

        let message = NewMessage::from_parts(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "image",
            None,
            vec![attachment],
            None,
        )
        .unwrap();
        assert_eq!(message.meta, MessageMeta::Image);

        assert!(NewMessage::from_parts(Uuid::new_v4(), Uuid::new_v4(), "file", None, vec![], None)
            .is_err());
    }

    #[test]
    fn test_product_meta_is_typed() {
        let product_id = Uuid::new_v4();
        let message = NewMessage::from_parts(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "product",
            Some("Is this in stock?".into()),
            vec![],
            Some(json!({ "product_id": product_id, "name": "Lamp", "price_cents": 4599 })),
        )
        .unwrap();

        match &message.meta {
            MessageMeta::Product(product) => {
                assert_eq!(product.product_id, product_id);
                assert_eq!(product.price_cents, Some(4599));
            }
            other => panic!("unexpected meta {:?}", other),
        }

        // Order messages must reference an order
        assert!(matches!(
            NewMessage::from_parts(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "order",
                None,
                vec![],
                Some(json!({ "status": "shipped" })),
            ),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_meta_serializes_with_type_tag() {
        let meta = MessageMeta::Order(OrderRef {
            order_id: Uuid::nil(),
            status: Some("paid".into()),
            total_cents: None,
        });
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["type"], "order");
        assert_eq!(value["status"], "paid");

        let text = serde_json::to_value(MessageMeta::Text).unwrap();
        assert_eq!(text, json!({ "type": "text" }));
    }
}
