use uuid::Uuid;

use crate::{
    conversation::conversation_models::Conversation,
    message::message_models::{Message, MessageResponse},
};
use super::{
    connection::{DeliveryReport, RoomRegistry, SessionId},
    types::{
        ConversationUpdatedPayload, MessageNewPayload, MessageReadPayload, ServerEvent,
        TypingPayload,
    },
};

/// Turns committed store writes into room events.
///
/// Callers invoke it only after the write succeeded. Delivery problems stay
/// inside the registry and are reported, never returned as errors.
#[derive(Clone)]
pub struct Dispatcher {
    registry: RoomRegistry,
}

impl Dispatcher {
    pub fn new(registry: RoomRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// `message:new` to the room and to the sender's other sessions.
    pub fn message_new(&self, message: &Message) -> DeliveryReport {
        let event = ServerEvent::MessageNew(MessageNewPayload {
            conversation_id: message.conversation_id,
            message: MessageResponse::from(message.clone()),
        });

        let report = self.registry.broadcast(
            message.conversation_id,
            &event,
            Some(message.sender_id),
            None,
        );
        tracing::debug!(
            "message:new {} in {} delivered={} dropped={}",
            message.id,
            message.conversation_id,
            report.delivered,
            report.dropped
        );
        report
    }

    pub fn message_read(&self, conversation_id: Uuid, message_id: Uuid, reader_id: Uuid) -> DeliveryReport {
        let event = ServerEvent::MessageRead(MessageReadPayload {
            conversation_id,
            message_id,
            reader_id,
        });

        self.registry.broadcast(conversation_id, &event, None, None)
    }

    pub fn typing(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
        origin: SessionId,
    ) -> DeliveryReport {
        let event = ServerEvent::Typing(TypingPayload {
            conversation_id,
            user_id,
            is_typing,
        });

        self.registry
            .broadcast(conversation_id, &event, None, Some(origin))
    }

    pub fn conversation_updated(&self, conversation: &Conversation) -> DeliveryReport {
        let event = ServerEvent::ConversationUpdated(ConversationUpdatedPayload {
            conversation: conversation.clone(),
        });

        self.registry.broadcast(conversation.id, &event, None, None)
    }

    /// Drops a former participant's sessions from the room.
    pub fn evict(&self, conversation_id: Uuid, user_id: Uuid) -> usize {
        let evicted = self.registry.evict_user(conversation_id, user_id);
        if evicted > 0 {
            tracing::info!(
                "Evicted {} session(s) of user {} from room {}",
                evicted,
                user_id,
                conversation_id
            );
        }
        evicted
    }
}
