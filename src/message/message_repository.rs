use async_trait::async_trait;
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::error::{AppError, Result};
use super::message_models::{Message, MessageRow, NewMessage};

/// Result of adding a reader to a message.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub message: Message,
    /// False when the reader was already in `read_by`.
    pub newly_read: bool,
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Appends to the conversation's log, assigning the next `seq`.
    /// Fails with `NotFound` when the conversation doesn't exist and with
    /// `Forbidden` when the sender isn't a participant at write time.
    async fn append(&self, new: NewMessage) -> Result<Message>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>>;

    /// Up to `limit` messages with `seq < before_seq` (or the newest when
    /// `before_seq` is `None`), newest first, skipping ones hidden for `viewer`.
    async fn page(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>>;

    /// `None` for an unknown message. `Forbidden` when the reader isn't a
    /// participant of the message's conversation at write time.
    async fn add_reader(&self, id: Uuid, reader_id: Uuid) -> Result<Option<ReadOutcome>>;

    async fn add_deleted_for(&self, id: Uuid, user_id: Uuid) -> Result<Option<Message>>;

    /// Marks every message not sent by `reader_id` as read by them.
    /// Returns the newly read message ids in log order.
    async fn mark_conversation_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<Vec<Uuid>>;

    async fn count_unread(&self, conversation_id: Uuid, user_id: Uuid) -> Result<i64>;
}

pub(crate) fn not_a_participant() -> AppError {
    AppError::Forbidden("You are not a participant of this conversation".to_string())
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn append(&self, new: NewMessage) -> Result<Message> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the conversation serializes appends and keeps seq gap-free.
        // Membership is part of the predicate, so a concurrent removal wins.
        let seq: Option<i64> = sqlx::query_scalar(
            "UPDATE conversations SET last_seq = last_seq + 1
             WHERE id = $1 AND $2 = ANY(participants)
             RETURNING last_seq",
        )
        .bind(new.conversation_id)
        .bind(new.sender_id)
        .fetch_optional(&mut *tx)
        .await?;

        let seq = match seq {
            Some(seq) => seq,
            None => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM conversations WHERE id = $1)")
                        .bind(new.conversation_id)
                        .fetch_one(&mut *tx)
                        .await?;
                return Err(if exists {
                    not_a_participant()
                } else {
                    AppError::NotFound("Conversation not found".to_string())
                });
            }
        };

        let kind = new.meta.kind().to_string();
        let row = sqlx::query_as::<_, MessageRow>(
            "INSERT INTO messages (id, conversation_id, sender_id, seq, kind, content, attachments, meta)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new.conversation_id)
        .bind(new.sender_id)
        .bind(seq)
        .bind(kind)
        .bind(new.content)
        .bind(Json(new.attachments))
        .bind(Json(new.meta))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(row.into())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Message::from))
    }

    async fn page(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages
             WHERE conversation_id = $1
               AND NOT ($2 = ANY(deleted_for))
               AND ($3::BIGINT IS NULL OR seq < $3)
             ORDER BY seq DESC
             LIMIT $4",
        )
        .bind(conversation_id)
        .bind(viewer)
        .bind(before_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn add_reader(&self, id: Uuid, reader_id: Uuid) -> Result<Option<ReadOutcome>> {
        let mut tx = self.pool.begin().await?;

        // FOR SHARE holds off a concurrent membership change until the receipt lands
        let participants: Option<Vec<Uuid>> = sqlx::query_scalar(
            "SELECT c.participants FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE m.id = $1
             FOR SHARE OF c",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        match participants {
            None => return Ok(None),
            Some(participants) if !participants.contains(&reader_id) => {
                return Err(not_a_participant());
            }
            Some(_) => {}
        }

        let updated = sqlx::query_as::<_, MessageRow>(
            "UPDATE messages
             SET read_by = array_append(read_by, $2)
             WHERE id = $1 AND NOT ($2 = ANY(read_by))
             RETURNING *",
        )
        .bind(id)
        .bind(reader_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match updated {
            Some(row) => ReadOutcome {
                message: row.into(),
                newly_read: true,
            },
            None => {
                let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = $1")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                ReadOutcome {
                    message: row.into(),
                    newly_read: false,
                }
            }
        };

        tx.commit().await?;

        Ok(Some(outcome))
    }

    async fn add_deleted_for(&self, id: Uuid, user_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "UPDATE messages
             SET deleted_for = CASE
                 WHEN $2 = ANY(deleted_for) THEN deleted_for
                 ELSE array_append(deleted_for, $2)
             END
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Message::from))
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<Vec<Uuid>> {
        let mut rows: Vec<(Uuid, i64)> = sqlx::query_as(
            "UPDATE messages
             SET read_by = array_append(read_by, $2)
             WHERE conversation_id = $1
               AND sender_id <> $2
               AND NOT ($2 = ANY(read_by))
             RETURNING id, seq",
        )
        .bind(conversation_id)
        .bind(reader_id)
        .fetch_all(&self.pool)
        .await?;

        rows.sort_by_key(|(_, seq)| *seq);

        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }

    async fn count_unread(&self, conversation_id: Uuid, user_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = $1
               AND sender_id <> $2
               AND NOT ($2 = ANY(read_by))
               AND NOT ($2 = ANY(deleted_for))",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
