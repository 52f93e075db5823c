use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use murmur_shared::protocol::ChatRecord;
use murmur_shared::types::{ChatId, UserId};

use crate::database::{sortable, Database};
use crate::document::ChatDraft;
use crate::error::{Result, StoreError};

impl Database {
    pub fn insert_chat(&self, draft: ChatDraft, now: DateTime<Utc>) -> Result<ChatRecord> {
        let record = draft.into_record(ChatId::new(), now);
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO chats (id, last_time, doc) VALUES (?1, ?2, ?3)",
            params![
                record.id.as_str(),
                sortable(&record.last_time),
                serde_json::to_string(&record)?,
            ],
        )?;
        for member in &record.members {
            tx.execute(
                "INSERT OR IGNORE INTO chat_members (chat_id, uid) VALUES (?1, ?2)",
                params![record.id.as_str(), member.as_str()],
            )?;
        }
        tx.commit()?;

        tracing::info!(chat = %record.id, "chat created");
        Ok(record)
    }

    pub fn get_chat(&self, id: &ChatId) -> Result<Option<ChatRecord>> {
        let doc: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM chats WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|doc| decode_chat(id.to_string(), &doc)).transpose()
    }

    /// Rewrite a chat document, keeping the `last_time` column in sync.
    pub fn update_chat(&self, chat: &ChatRecord) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE chats SET last_time = ?2, doc = ?3 WHERE id = ?1",
            params![
                chat.id.as_str(),
                sortable(&chat.last_time),
                serde_json::to_string(chat)?,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("chat {}", chat.id)));
        }
        Ok(())
    }

    /// Chats `uid` belongs to, most recent activity first.
    pub fn chats_for_member(&self, uid: &UserId) -> Result<Vec<ChatRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.doc FROM chats c
             INNER JOIN chat_members m ON m.chat_id = c.id
             WHERE m.uid = ?1
             ORDER BY c.last_time DESC",
        )?;

        let rows = stmt.query_map(params![uid.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut chats = Vec::new();
        for row in rows {
            let (id, doc) = row?;
            chats.push(decode_chat(id, &doc)?);
        }
        Ok(chats)
    }
}

fn decode_chat(id: String, doc: &str) -> Result<ChatRecord> {
    Ok(ChatRecord::from_json(ChatId(id), doc)?)
}

#[cfg(test)]
mod tests {
    use murmur_shared::protocol::UserProfile;

    use super::*;

    fn profile(uid: &str) -> UserProfile {
        UserProfile {
            uid: UserId::from(uid),
            display_name: uid.to_uppercase(),
            ..Default::default()
        }
    }

    #[test]
    fn chat_round_trips_with_member_details() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("c.db")).unwrap();

        let chat = db
            .insert_chat(ChatDraft::between(&profile("a"), &profile("b")), Utc::now())
            .unwrap();
        let loaded = db.get_chat(&chat.id).unwrap().unwrap();

        assert_eq!(loaded, chat);
        assert_eq!(loaded.member_details[&UserId::from("b")].display_name, "B");
        assert!(db.get_chat(&ChatId::from("nope")).unwrap().is_none());
    }

    #[test]
    fn updating_missing_chat_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("c.db")).unwrap();
        let ghost = ChatDraft::between(&profile("a"), &profile("b"))
            .into_record(ChatId::from("ghost"), Utc::now());
        assert!(matches!(
            db.update_chat(&ghost),
            Err(StoreError::NotFound(_))
        ));
    }
}
