//! In-process implementation of the conversation and message repositories.
//!
//! Used when no `DATABASE_URL` is configured and as the fixture store in tests.
//! Conversation records sit behind one async lock together with the dedup
//! index so key reservation and record insertion happen in a single step.
//! Message logs are sharded per conversation in a `DashMap`; no map guard is
//! held across an `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    conversation::conversation_models::{
        Conversation, MembershipChange, MembershipPlan, NewConversation,
    },
    conversation::conversation_repository::ConversationRepository,
    error::{AppError, Result},
    message::message_models::{Message, NewMessage},
    message::message_repository::{not_a_participant, MessageRepository, ReadOutcome},
};

#[derive(Default)]
struct ConversationTable {
    rows: HashMap<Uuid, Conversation>,
    dedup_index: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    conversations: RwLock<ConversationTable>,
    /// conversation id -> messages ordered by seq (seq = index + 1)
    logs: DashMap<Uuid, Vec<Message>>,
    /// message id -> (conversation id, seq)
    index: DashMap<Uuid, (Uuid, i64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_message<T>(&self, id: Uuid, f: impl FnOnce(&mut Message) -> T) -> Option<T> {
        let (conversation_id, seq) = *self.index.get(&id)?;
        let mut log = self.logs.get_mut(&conversation_id)?;
        let message = log.value_mut().get_mut((seq - 1) as usize)?;
        Some(f(message))
    }
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn create(&self, new: NewConversation) -> Result<Conversation> {
        let mut table = self.conversations.write().await;

        if let Some(key) = new.dedup_key.as_ref() {
            if table.dedup_index.contains_key(key) {
                return Err(AppError::Conflict(
                    "Direct conversation already exists".to_string(),
                ));
            }
            table.dedup_index.insert(key.clone(), new.id);
        }

        let conversation = new.into_conversation(Utc::now());
        table.rows.insert(conversation.id, conversation.clone());

        Ok(conversation)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.rows.get(&id).cloned())
    }

    async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Conversation>> {
        let table = self.conversations.read().await;
        Ok(table
            .dedup_index
            .get(dedup_key)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn find_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let table = self.conversations.read().await;
        Ok(table
            .rows
            .values()
            .filter(|c| c.has_participant(user_id))
            .cloned()
            .collect())
    }

    async fn apply_membership(&self, id: Uuid, change: MembershipChange) -> Result<Conversation> {
        let mut table = self.conversations.write().await;

        let current = table
            .rows
            .get(&id)
            .cloned()
            .ok_or(AppError::NotFound("Conversation not found".to_string()))?;

        let mut plan = match MembershipPlan::for_change(&current, change)? {
            Some(plan) => plan,
            None => return Ok(current),
        };

        if let Some(key) = plan.dedup_key.as_ref() {
            if table.dedup_index.get(key).is_some_and(|owner| *owner != id) {
                plan = plan.keep_group();
            }
        }

        if let Some(old_key) = current.dedup_key.as_ref() {
            table.dedup_index.remove(old_key);
        }
        if let Some(new_key) = plan.dedup_key.as_ref() {
            table.dedup_index.insert(new_key.clone(), id);
        }

        let updated = Conversation {
            participants: plan.participants,
            is_group: plan.is_group,
            dedup_key: plan.dedup_key,
            updated_at: Utc::now(),
            ..current
        };
        table.rows.insert(id, updated.clone());

        Ok(updated)
    }

    async fn update_details(
        &self,
        id: Uuid,
        title: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Conversation> {
        let mut table = self.conversations.write().await;
        let conversation = table
            .rows
            .get_mut(&id)
            .ok_or(AppError::NotFound("Conversation not found".to_string()))?;

        if let Some(title) = title {
            conversation.title = Some(title.to_string());
        }
        if let Some(avatar_url) = avatar_url {
            conversation.avatar_url = Some(avatar_url.to_string());
        }
        conversation.updated_at = Utc::now();

        Ok(conversation.clone())
    }

    async fn set_last_message(&self, id: Uuid, message_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut table = self.conversations.write().await;
        if let Some(conversation) = table.rows.get_mut(&id) {
            conversation.last_message_id = Some(message_id);
            conversation.last_message_at = Some(at);
            conversation.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn append(&self, new: NewMessage) -> Result<Message> {
        // Held until the message is in the log so a membership change can't slip in between
        let table = self.conversations.read().await;
        match table.rows.get(&new.conversation_id) {
            None => return Err(AppError::NotFound("Conversation not found".to_string())),
            Some(conversation) if !conversation.has_participant(new.sender_id) => {
                return Err(not_a_participant());
            }
            Some(_) => {}
        }

        let message = {
            let mut log = self.logs.entry(new.conversation_id).or_default();
            let seq = log.len() as i64 + 1;
            // created_at never goes backwards within one log
            let now = Utc::now();
            let created_at = log.last().map_or(now, |last| last.created_at.max(now));
            let message = new.into_message(Uuid::new_v4(), seq, created_at);
            log.push(message.clone());
            message
        };

        self.index
            .insert(message.id, (message.conversation_id, message.seq));
        drop(table);

        Ok(message)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self.with_message(id, |message| message.clone()))
    }

    async fn page(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let log = match self.logs.get(&conversation_id) {
            Some(log) => log,
            None => return Ok(Vec::new()),
        };

        let messages = log.value();
        let end = match before_seq {
            Some(seq) => (seq - 1).clamp(0, messages.len() as i64) as usize,
            None => messages.len(),
        };

        Ok(messages[..end]
            .iter()
            .rev()
            .filter(|m| !m.is_deleted_for(viewer))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn add_reader(&self, id: Uuid, reader_id: Uuid) -> Result<Option<ReadOutcome>> {
        let table = self.conversations.read().await;
        let conversation_id = match self.index.get(&id) {
            Some(entry) => entry.value().0,
            None => return Ok(None),
        };
        if !table
            .rows
            .get(&conversation_id)
            .is_some_and(|c| c.has_participant(reader_id))
        {
            return Err(not_a_participant());
        }

        Ok(self.with_message(id, |message| {
            let newly_read = !message.is_read_by(reader_id);
            if newly_read {
                message.read_by.push(reader_id);
            }
            ReadOutcome {
                message: message.clone(),
                newly_read,
            }
        }))
    }

    async fn add_deleted_for(&self, id: Uuid, user_id: Uuid) -> Result<Option<Message>> {
        Ok(self.with_message(id, |message| {
            if !message.is_deleted_for(user_id) {
                message.deleted_for.push(user_id);
            }
            message.clone()
        }))
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<Vec<Uuid>> {
        let mut log = match self.logs.get_mut(&conversation_id) {
            Some(log) => log,
            None => return Ok(Vec::new()),
        };

        let mut newly_read = Vec::new();
        for message in log.value_mut().iter_mut() {
            if message.sender_id != reader_id && !message.is_read_by(reader_id) {
                message.read_by.push(reader_id);
                newly_read.push(message.id);
            }
        }

        Ok(newly_read)
    }

    async fn count_unread(&self, conversation_id: Uuid, user_id: Uuid) -> Result<i64> {
        Ok(self
            .logs
            .get(&conversation_id)
            .map(|log| {
                log.value()
                    .iter()
                    .filter(|m| {
                        m.sender_id != user_id && !m.is_read_by(user_id) && !m.is_deleted_for(user_id)
                    })
                    .count() as i64
            })
            .unwrap_or(0))
    }
}
