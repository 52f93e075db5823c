use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use murmur_shared::protocol::{MessageDraft, MessageRecord};
use murmur_shared::types::{ChatId, MessageId};

use crate::database::{sortable, Database};
use crate::error::{Result, StoreError};

impl Database {
    /// Store a new message. The id is assigned here; `created_at` comes from
    /// the caller's clock.
    pub fn insert_message(
        &self,
        draft: MessageDraft,
        created_at: DateTime<Utc>,
    ) -> Result<MessageRecord> {
        let record = MessageRecord::from_draft(MessageId::new(), created_at, draft);
        self.conn().execute(
            "INSERT INTO messages (id, chat_id, created_at, doc) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.as_str(),
                record.chat_id.as_str(),
                sortable(&record.created_at),
                serde_json::to_string(&record)?,
            ],
        )?;
        tracing::debug!(message = %record.id, chat = %record.chat_id, "message stored");
        Ok(record)
    }

    /// Newest `limit` messages of a chat, newest first.
    pub fn recent_messages(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<MessageRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, doc FROM messages
             WHERE chat_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![chat_id.as_str(), limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, doc) = row?;
            messages.push(decode_message(id, &doc)?);
        }
        Ok(messages)
    }

    pub fn get_message(&self, id: &MessageId) -> Result<Option<MessageRecord>> {
        let doc: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM messages WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|doc| decode_message(id.to_string(), &doc))
            .transpose()
    }

    /// Flip `seen` on a message. Returns the chat it belongs to.
    pub fn mark_seen(&self, id: &MessageId) -> Result<ChatId> {
        let mut record = self
            .get_message(id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        record.seen = true;
        self.conn().execute(
            "UPDATE messages SET doc = ?2 WHERE id = ?1",
            params![id.as_str(), serde_json::to_string(&record)?],
        )?;
        Ok(record.chat_id)
    }
}

fn decode_message(id: String, doc: &str) -> Result<MessageRecord> {
    Ok(MessageRecord::from_json(MessageId(id), doc)?)
}
