//! Domain-level store for conversations and their message timelines.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use haven_core::model::{Conversation, ConversationId, DeliveryStatus, Message, Sender};

use crate::{Database, FromRow, Row, SqlValue, Statement, StorageError, ToSql};

fn text_at(row: &Row, index: usize) -> Result<String, StorageError> {
    match row.get(index) {
        Some(SqlValue::Text(text)) => Ok(text.clone()),
        Some(other) => Err(StorageError::QueryFailed(format!(
            "expected text at column {index}, found {other:?}"
        ))),
        None => Err(StorageError::QueryFailed(format!(
            "missing column {index} in row"
        ))),
    }
}

fn timestamp_at(row: &Row, index: usize) -> Result<DateTime<Utc>, StorageError> {
    let raw = text_at(row, index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| {
            StorageError::QueryFailed(format!("invalid timestamp '{raw}': {error}"))
        })
}

impl FromRow for Conversation {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(Conversation {
            id: ConversationId::new(text_at(row, 0)?),
            created_at: timestamp_at(row, 1)?,
        })
    }
}

impl FromRow for Message {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let sender_raw = text_at(row, 2)?;
        let sender = Sender::parse(&sender_raw).ok_or_else(|| {
            StorageError::QueryFailed(format!("unknown sender '{sender_raw}' in messages table"))
        })?;
        let status_raw = text_at(row, 5)?;
        let delivery_status = DeliveryStatus::parse(&status_raw).ok_or_else(|| {
            StorageError::QueryFailed(format!(
                "unknown delivery status '{status_raw}' in messages table"
            ))
        })?;

        Ok(Message {
            id: text_at(row, 0)?,
            conversation_id: ConversationId::new(text_at(row, 1)?),
            sender,
            text: text_at(row, 3)?,
            created_at: timestamp_at(row, 4)?,
            delivery_status,
        })
    }
}

/// Typed facade over the raw [`Database`] for the two tables the engine
/// owns. All writes go through the single writer connection; reads fan
/// out to blocking tasks.
#[derive(Debug, Clone)]
pub struct ChatStore<D: Database> {
    db: Arc<D>,
}

impl<D: Database> ChatStore<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    pub async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), StorageError> {
        self.db
            .execute(
                "INSERT INTO conversations (id, created_at) VALUES (?1, ?2)",
                &[
                    &conversation.id.as_str(),
                    &conversation.created_at.to_rfc3339(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, StorageError> {
        self.db
            .query(
                "SELECT id, created_at FROM conversations ORDER BY created_at DESC, id ASC",
                &[],
            )
            .await
    }

    pub async fn conversation_exists(&self, id: &ConversationId) -> Result<bool, StorageError> {
        let rows: Vec<Row> = self
            .db
            .query(
                "SELECT 1 FROM conversations WHERE id = ?1",
                &[&id.as_str()],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Delete a conversation together with its messages in one
    /// transaction. Deleting an id that does not exist is a no-op.
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<(), StorageError> {
        let statements = vec![
            Statement::new(
                "DELETE FROM messages WHERE conversation_id = ?1",
                &[&id.as_str()],
            ),
            Statement::new("DELETE FROM conversations WHERE id = ?1", &[&id.as_str()]),
        ];
        self.db.execute_batch(statements).await
    }

    pub async fn append_message(&self, message: &Message) -> Result<(), StorageError> {
        self.db
            .execute(
                "INSERT INTO messages (id, conversation_id, sender, text, created_at, delivery_status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                &[
                    &message.id,
                    &message.conversation_id.as_str(),
                    &message.sender.as_str(),
                    &message.text,
                    &message.created_at.to_rfc3339(),
                    &message.delivery_status.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Full timeline in chronological order. Ties on `created_at` fall
    /// back to insertion order so the hydrated view matches what the
    /// user saw live.
    pub async fn list_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, StorageError> {
        self.db
            .query(
                "SELECT id, conversation_id, sender, text, created_at, delivery_status \
                 FROM messages WHERE conversation_id = ?1 \
                 ORDER BY created_at ASC, rowid ASC",
                &[&conversation_id.as_str()],
            )
            .await
    }

    pub async fn update_delivery_status(
        &self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<(), StorageError> {
        let updated = self
            .db
            .execute(
                "UPDATE messages SET delivery_status = ?1 WHERE id = ?2",
                &[&status.as_str(), &message_id],
            )
            .await?;

        if updated == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub async fn clear_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), StorageError> {
        self.db
            .execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                &[&conversation_id.as_str()],
            )
            .await?;
        Ok(())
    }
}
