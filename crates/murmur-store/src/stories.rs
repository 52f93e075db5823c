use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use murmur_shared::protocol::{StoryDraft, StoryRecord};
use murmur_shared::types::{StoryId, UserId};

use crate::database::{sortable, Database};
use crate::error::{Result, StoreError};

impl Database {
    pub fn insert_story(&self, draft: StoryDraft, now: DateTime<Utc>) -> Result<StoryRecord> {
        let record = StoryRecord::from_draft(StoryId::new(), now, draft);
        self.conn().execute(
            "INSERT INTO stories (id, expire_at, doc) VALUES (?1, ?2, ?3)",
            params![
                record.id.as_str(),
                sortable(&record.expire_at),
                serde_json::to_string(&record)?,
            ],
        )?;
        Ok(record)
    }

    /// Stories that have not expired at `now`, latest expiry first.
    pub fn active_stories(&self, now: DateTime<Utc>) -> Result<Vec<StoryRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, doc FROM stories
             WHERE expire_at > ?1
             ORDER BY expire_at DESC",
        )?;
        let rows = stmt.query_map(params![sortable(&now)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut stories = Vec::new();
        for row in rows {
            let (id, doc) = row?;
            stories.push(decode_story(id, &doc)?);
        }
        Ok(stories)
    }

    /// Add `viewer` to the story's viewer set (no duplicates).
    pub fn add_story_viewer(&self, id: &StoryId, viewer: UserId) -> Result<()> {
        let doc: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM stories WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let doc = doc.ok_or_else(|| StoreError::NotFound(format!("story {id}")))?;

        let mut record = decode_story(id.to_string(), &doc)?;
        if record.viewers.contains(&viewer) {
            return Ok(());
        }
        record.viewers.push(viewer);
        self.conn().execute(
            "UPDATE stories SET doc = ?2 WHERE id = ?1",
            params![id.as_str(), serde_json::to_string(&record)?],
        )?;
        Ok(())
    }
}

fn decode_story(id: String, doc: &str) -> Result<StoryRecord> {
    Ok(StoryRecord::from_json(StoryId(id), doc)?)
}
