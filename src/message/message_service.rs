use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::conversation::ConversationService;
use crate::error::{AppError, Result};
use crate::message::message_dto::ConversationSummary;
use crate::message::message_models::{Message, MessageResponse, NewMessage};
use crate::message::message_repository::MessageRepository;
use crate::websocket::Dispatcher;

#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl PageLimits {
    pub fn clamp(&self, requested: Option<u32>) -> i64 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1)) as i64
    }
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 100,
        }
    }
}

#[derive(Clone)]
pub struct MessageService {
    repo: Arc<dyn MessageRepository>,
    conversations: ConversationService,
    dispatcher: Dispatcher,
    /// Serializes persist + publish per conversation so room events go out
    /// in log order.
    append_gates: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    limits: PageLimits,
}

impl MessageService {
    pub fn new(
        repo: Arc<dyn MessageRepository>,
        conversations: ConversationService,
        dispatcher: Dispatcher,
        limits: PageLimits,
    ) -> Self {
        Self {
            repo,
            conversations,
            dispatcher,
            append_gates: Arc::new(DashMap::new()),
            limits,
        }
    }

    /// Validates, persists and broadcasts a message.
    ///
    /// Runs on its own task: if the requesting connection goes away mid-call
    /// the write still completes and is still broadcast.
    pub async fn append(&self, new: NewMessage) -> Result<Message> {
        let this = self.clone();
        tokio::spawn(async move { this.persist_and_publish(new).await })
            .await
            .map_err(|e| {
                tracing::error!("Append task failed: {:?}", e);
                AppError::InternalError
            })?
    }

    async fn persist_and_publish(&self, new: NewMessage) -> Result<Message> {
        new.validate()?;
        let conversation = self.conversations.find(new.conversation_id).await?;
        conversation.ensure_participant(new.sender_id)?;

        let gate = self
            .append_gates
            .entry(conversation.id)
            .or_default()
            .clone();

        let result = {
            let _ordered = gate.lock().await;
            self.persist_gated(new).await
        };

        drop(gate);
        self.append_gates
            .remove_if(&conversation.id, |_, gate| Arc::strong_count(gate) == 1);

        result
    }

    async fn persist_gated(&self, new: NewMessage) -> Result<Message> {
        // The store re-checks membership atomically with the write
        let message = self.repo.append(new).await?;

        if let Err(e) = self
            .conversations
            .record_last_message(message.conversation_id, message.id, message.created_at)
            .await
        {
            tracing::warn!(
                "Failed to update last message of {}: {}",
                message.conversation_id,
                e
            );
        }

        self.dispatcher.message_new(&message);
        Ok(message)
    }

    /// Newest-first page of messages strictly older than `before`.
    pub async fn page(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        before: Option<Uuid>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        self.conversations
            .require_participant(conversation_id, viewer_id)
            .await?;

        let before_seq = match before {
            Some(cursor) => {
                let message = self
                    .repo
                    .find_by_id(cursor)
                    .await?
                    .filter(|m| m.conversation_id == conversation_id)
                    .ok_or(AppError::NotFound("Cursor message not found".to_string()))?;
                Some(message.seq)
            }
            None => None,
        };

        self.repo
            .page(conversation_id, viewer_id, before_seq, self.limits.clamp(limit))
            .await
    }

    /// Adds a read receipt. Repeated calls are no-ops and broadcast nothing.
    pub async fn mark_read(&self, message_id: Uuid, reader_id: Uuid) -> Result<Message> {
        let this = self.clone();
        tokio::spawn(async move { this.record_read(message_id, reader_id).await })
            .await
            .map_err(|e| {
                tracing::error!("Read receipt task failed: {:?}", e);
                AppError::InternalError
            })?
    }

    async fn record_read(&self, message_id: Uuid, reader_id: Uuid) -> Result<Message> {
        let message = self.find(message_id).await?;
        self.conversations
            .require_participant(message.conversation_id, reader_id)
            .await?;

        let outcome = self
            .repo
            .add_reader(message_id, reader_id)
            .await?
            .ok_or(AppError::NotFound("Message not found".to_string()))?;

        if outcome.newly_read {
            self.dispatcher
                .message_read(outcome.message.conversation_id, message_id, reader_id);
        }

        Ok(outcome.message)
    }

    /// Marks everything the reader hasn't read yet; one receipt per message.
    ///
    /// Detached like `mark_read` so every stored receipt is also announced.
    pub async fn mark_conversation_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<Vec<Uuid>> {
        let this = self.clone();
        tokio::spawn(async move { this.record_conversation_read(conversation_id, reader_id).await })
            .await
            .map_err(|e| {
                tracing::error!("Read receipt task failed: {:?}", e);
                AppError::InternalError
            })?
    }

    async fn record_conversation_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<Vec<Uuid>> {
        self.conversations
            .require_participant(conversation_id, reader_id)
            .await?;

        let read = self
            .repo
            .mark_conversation_read(conversation_id, reader_id)
            .await?;

        for message_id in &read {
            self.dispatcher
                .message_read(conversation_id, *message_id, reader_id);
        }

        Ok(read)
    }

    /// Hides a message for one participant only.
    pub async fn soft_delete_for_user(&self, message_id: Uuid, user_id: Uuid) -> Result<()> {
        let message = self.find(message_id).await?;
        self.conversations
            .require_participant(message.conversation_id, user_id)
            .await?;

        self.repo
            .add_deleted_for(message_id, user_id)
            .await?
            .ok_or(AppError::NotFound("Message not found".to_string()))?;

        Ok(())
    }

    pub async fn find(&self, message_id: Uuid) -> Result<Message> {
        self.repo
            .find_by_id(message_id)
            .await?
            .ok_or(AppError::NotFound("Message not found".to_string()))
    }

    pub async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> Result<i64> {
        self.repo.count_unread(conversation_id, user_id).await
    }

    /// The user's conversation list with previews and unread counts.
    pub async fn summaries(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        let conversations = self.conversations.list_for_user(user_id).await?;

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let last_message = match conversation.last_message_id {
                Some(id) => self
                    .repo
                    .find_by_id(id)
                    .await?
                    .filter(|m| !m.is_deleted_for(user_id))
                    .map(MessageResponse::from),
                None => None,
            };
            let unread_count = self.repo.count_unread(conversation.id, user_id).await?;

            summaries.push(ConversationSummary {
                conversation,
                last_message,
                unread_count,
            });
        }

        Ok(summaries)
    }
}
