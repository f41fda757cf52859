use uuid::Uuid;

use crate::conversation::ConversationService;
use crate::error::{AppError, Result};
use super::{
    connection::{RoomRegistry, SessionId, WsSender},
    dispatcher::Dispatcher,
    types::{RoomPayload, ServerEvent},
};

/// Per-connection room operations with participant checks applied.
#[derive(Clone)]
pub struct SessionHub {
    registry: RoomRegistry,
    conversations: ConversationService,
    dispatcher: Dispatcher,
}

impl SessionHub {
    pub fn new(conversations: ConversationService, dispatcher: Dispatcher) -> Self {
        Self {
            registry: dispatcher.registry().clone(),
            conversations,
            dispatcher,
        }
    }

    pub fn connect(&self, user_id: Uuid, tx: WsSender) -> SessionId {
        self.registry.connect(user_id, tx)
    }

    fn user_of(&self, session_id: SessionId) -> Result<Uuid> {
        self.registry
            .session_user(session_id)
            .ok_or(AppError::NotFound("Session not connected".to_string()))
    }

    /// Subscribes the session to a conversation it takes part in.
    pub async fn join(&self, session_id: SessionId, conversation_id: Uuid) -> Result<()> {
        let user_id = self.user_of(session_id)?;
        self.conversations
            .require_participant(conversation_id, user_id)
            .await?;

        self.registry.join(session_id, conversation_id)?;

        // A removal that landed between the check and the join evicted nothing
        // for this session; check again now that it is in the room.
        let current = self.conversations.find(conversation_id).await?;
        if !current.has_participant(user_id) {
            self.registry.leave(session_id, conversation_id);
            return Err(AppError::Forbidden(
                "You are not a participant of this conversation".to_string(),
            ));
        }

        self.ack(session_id, ServerEvent::Joined(RoomPayload { conversation_id }));
        Ok(())
    }

    pub fn leave(&self, session_id: SessionId, conversation_id: Uuid) -> bool {
        let was_joined = self.registry.leave(session_id, conversation_id);
        self.ack(session_id, ServerEvent::Left(RoomPayload { conversation_id }));
        was_joined
    }

    /// Relays a typing indicator to the room's other sessions. Nothing is stored.
    pub fn typing(&self, session_id: SessionId, conversation_id: Uuid, is_typing: bool) -> Result<()> {
        let user_id = self.user_of(session_id)?;
        if !self.registry.joined_rooms(session_id).contains(&conversation_id) {
            return Err(AppError::Forbidden(
                "Join the conversation before sending typing updates".to_string(),
            ));
        }

        self.dispatcher
            .typing(conversation_id, user_id, is_typing, session_id);
        Ok(())
    }

    pub fn disconnect(&self, session_id: SessionId) {
        self.registry.disconnect(session_id);
    }

    fn ack(&self, session_id: SessionId, event: ServerEvent) {
        if let Err(e) = self.registry.send_to_session(session_id, event) {
            tracing::debug!("Could not acknowledge session {}: {}", session_id, e);
        }
    }
}
