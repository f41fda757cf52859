use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use super::conversation_models::{Conversation, MembershipChange, MembershipPlan, NewConversation};

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Inserts a conversation. A direct conversation whose dedup key is
    /// already taken fails with `AppError::Conflict`.
    async fn create(&self, new: NewConversation) -> Result<Conversation>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Conversation>>;

    async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Conversation>>;

    async fn find_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>>;

    /// Applies a membership change and the group/direct policy in one step.
    async fn apply_membership(&self, id: Uuid, change: MembershipChange) -> Result<Conversation>;

    async fn update_details(
        &self,
        id: Uuid,
        title: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Conversation>;

    async fn set_last_message(&self, id: Uuid, message_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn create(&self, new: NewConversation) -> Result<Conversation> {
        if new.dedup_key.is_some() {
            // A losing concurrent insert comes back empty instead of erroring
            let conversation = sqlx::query_as::<_, Conversation>(
                "INSERT INTO conversations (id, participants, is_group, dedup_key, title, avatar_url)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (dedup_key) WHERE dedup_key IS NOT NULL DO NOTHING
                 RETURNING *",
            )
            .bind(new.id)
            .bind(new.participants)
            .bind(new.is_group)
            .bind(new.dedup_key)
            .bind(new.title)
            .bind(new.avatar_url)
            .fetch_optional(&self.pool)
            .await?;

            return conversation.ok_or_else(|| {
                AppError::Conflict("Direct conversation already exists".to_string())
            });
        }

        let conversation = sqlx::query_as::<_, Conversation>(
            "INSERT INTO conversations (id, participants, is_group, dedup_key, title, avatar_url)
             VALUES ($1, $2, $3, NULL, $4, $5)
             RETURNING *",
        )
        .bind(new.id)
        .bind(new.participants)
        .bind(new.is_group)
        .bind(new.title)
        .bind(new.avatar_url)
        .fetch_one(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE dedup_key = $1",
        )
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn find_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let conversations = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations
             WHERE $1 = ANY(participants)
             ORDER BY last_message_at DESC NULLS LAST, updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(conversations)
    }

    async fn apply_membership(&self, id: Uuid, change: MembershipChange) -> Result<Conversation> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound("Conversation not found".to_string()))?;

        let mut plan = match MembershipPlan::for_change(&current, change)? {
            Some(plan) => plan,
            None => {
                tx.commit().await?;
                return Ok(current);
            }
        };

        if let Some(key) = plan.dedup_key.as_deref() {
            let taken: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE dedup_key = $1 AND id <> $2)",
            )
            .bind(key)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

            if taken {
                plan = plan.keep_group();
            }
        }

        let conversation = sqlx::query_as::<_, Conversation>(
            "UPDATE conversations
             SET participants = $2, is_group = $3, dedup_key = $4, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(plan.participants)
        .bind(plan.is_group)
        .bind(plan.dedup_key)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(conversation)
    }

    async fn update_details(
        &self,
        id: Uuid,
        title: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Conversation> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "UPDATE conversations
             SET title = COALESCE($2, title),
                 avatar_url = COALESCE($3, avatar_url),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(title)
        .bind(avatar_url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("Conversation not found".to_string()))?;

        Ok(conversation)
    }

    async fn set_last_message(&self, id: Uuid, message_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET last_message_id = $2, last_message_at = $3, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(message_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
