//! Per-user documents: settings and public profiles.

use rusqlite::{params, OptionalExtension};

use murmur_shared::protocol::{UserProfile, UserSettings};
use murmur_shared::types::UserId;

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn get_settings(&self, uid: &UserId) -> Result<Option<UserSettings>> {
        let doc: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM settings WHERE uid = ?1",
                params![uid.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(doc.map(|doc| serde_json::from_str(&doc)).transpose()?)
    }

    pub fn put_settings(&self, uid: &UserId, settings: &UserSettings) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (uid, doc) VALUES (?1, ?2)
             ON CONFLICT(uid) DO UPDATE SET doc = excluded.doc",
            params![uid.as_str(), serde_json::to_string(settings)?],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, uid: &UserId) -> Result<Option<UserProfile>> {
        let doc: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM profiles WHERE uid = ?1",
                params![uid.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(doc.map(|doc| serde_json::from_str(&doc)).transpose()?)
    }

    pub fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        self.conn().execute(
            "INSERT INTO profiles (uid, username, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT(uid) DO UPDATE SET username = excluded.username, doc = excluded.doc",
            params![
                profile.uid.as_str(),
                profile.username.as_deref(),
                serde_json::to_string(profile)?,
            ],
        )?;
        Ok(())
    }

    /// Profiles whose username starts with `prefix`, ordered by username.
    pub fn search_profiles(&self, prefix: &str, limit: usize) -> Result<Vec<UserProfile>> {
        // Range scan instead of LIKE so `%` and `_` in the prefix stay literal.
        let upper = format!("{prefix}\u{f8ff}");
        let mut stmt = self.conn().prepare(
            "SELECT doc FROM profiles
             WHERE username >= ?1 AND username <= ?2
             ORDER BY username
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![prefix, upper, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(serde_json::from_str(&row?)?);
        }
        Ok(profiles)
    }

    /// Remove the profile and settings documents of `uid`.
    pub fn delete_user(&self, uid: &UserId) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute("DELETE FROM profiles WHERE uid = ?1", params![uid.as_str()])?;
        tx.execute("DELETE FROM settings WHERE uid = ?1", params![uid.as_str()])?;
        tx.commit()?;
        tracing::info!(uid = %uid, "user documents deleted");
        Ok(())
    }
}
