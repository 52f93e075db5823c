//! Database connection management and the SQLite-backed document store.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. [`SqliteStore`] puts it
//! behind a mutex and exposes it as a [`DocumentStore`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use rusqlite::Connection;
use tokio::sync::broadcast;

use murmur_shared::protocol::{
    ChatRecord, MessageDraft, MessageRecord, StoryDraft, StoryRecord, UserProfile, UserSettings,
};
use murmur_shared::types::{ChatId, UserId};

use crate::clock::ServerClock;
use crate::document::{ChatDraft, DocumentStore, StoreEvent, WriteBatch, WriteOp, EVENT_CAPACITY};
use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/murmur/murmur.db`
    /// - macOS:   `~/Library/Application Support/com.murmur.murmur/murmur.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\murmur\murmur\data\murmur.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "murmur", "murmur").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("murmur.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Apply every op inside one transaction. Returns the change events to
    /// publish once the transaction has committed.
    pub fn apply_batch(&self, batch: WriteBatch, now: DateTime<Utc>) -> Result<Vec<StoreEvent>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut events = Vec::new();

        for op in batch.into_ops() {
            let event = match op {
                WriteOp::MarkSeen { message_id } => {
                    let chat_id = self.mark_seen(&message_id)?;
                    StoreEvent::MessagesChanged(chat_id)
                }
                WriteOp::ResetUnread { chat_id, uid } => {
                    let mut chat = self.require_chat(&chat_id)?;
                    chat.unread_count.insert(uid, 0);
                    self.update_chat(&chat)?;
                    StoreEvent::ChatChanged {
                        chat_id,
                        members: chat.members,
                    }
                }
                WriteOp::TouchChat {
                    chat_id,
                    last_message,
                    increment_unread_for,
                } => {
                    let mut chat = self.require_chat(&chat_id)?;
                    chat.last_message = last_message;
                    chat.last_time = now;
                    *chat.unread_count.entry(increment_unread_for).or_insert(0) += 1;
                    self.update_chat(&chat)?;
                    StoreEvent::ChatChanged {
                        chat_id,
                        members: chat.members,
                    }
                }
                WriteOp::UpdateSettings { uid, patch } => {
                    let mut settings = self.get_settings(&uid)?.unwrap_or_default();
                    patch.apply(&mut settings, now);
                    self.put_settings(&uid, &settings)?;
                    StoreEvent::SettingsChanged(uid)
                }
                WriteOp::AddStoryViewer { story_id, viewer } => {
                    self.add_story_viewer(&story_id, viewer)?;
                    StoreEvent::StoriesChanged
                }
            };
            if !events.contains(&event) {
                events.push(event);
            }
        }

        tx.commit()?;
        Ok(events)
    }

    fn require_chat(&self, chat_id: &ChatId) -> Result<ChatRecord> {
        self.get_chat(chat_id)?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))
    }
}

/// Fixed-width timestamp text so that SQL ordering matches time ordering.
pub(crate) fn sortable(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// [`DocumentStore`] over a local SQLite file.
pub struct SqliteStore {
    db: Mutex<Database>,
    clock: ServerClock,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Mutex::new(db),
            clock: ServerClock::new(),
            events,
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    /// Open the database in the platform data directory.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Database::new()?))
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        match self.db.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn add_message(&self, draft: MessageDraft) -> Result<MessageRecord> {
        let record = self.db().insert_message(draft, self.clock.now())?;
        self.emit(StoreEvent::MessagesChanged(record.chat_id.clone()));
        Ok(record)
    }

    async fn recent_messages(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<MessageRecord>> {
        self.db().recent_messages(chat_id, limit)
    }

    async fn get_chat(&self, chat_id: &ChatId) -> Result<Option<ChatRecord>> {
        self.db().get_chat(chat_id)
    }

    async fn chats_for_member(&self, uid: &UserId) -> Result<Vec<ChatRecord>> {
        self.db().chats_for_member(uid)
    }

    async fn create_chat(&self, draft: ChatDraft) -> Result<ChatRecord> {
        let record = self.db().insert_chat(draft, self.clock.now())?;
        self.emit(StoreEvent::ChatChanged {
            chat_id: record.id.clone(),
            members: record.members.clone(),
        });
        Ok(record)
    }

    async fn get_settings(&self, uid: &UserId) -> Result<Option<UserSettings>> {
        self.db().get_settings(uid)
    }

    async fn put_settings(&self, uid: &UserId, settings: &UserSettings) -> Result<()> {
        self.db().put_settings(uid, settings)?;
        self.emit(StoreEvent::SettingsChanged(uid.clone()));
        Ok(())
    }

    async fn get_profile(&self, uid: &UserId) -> Result<Option<UserProfile>> {
        self.db().get_profile(uid)
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        self.db().put_profile(profile)?;
        self.emit(StoreEvent::ProfileChanged(profile.uid.clone()));
        Ok(())
    }

    async fn search_profiles(&self, prefix: &str, limit: usize) -> Result<Vec<UserProfile>> {
        self.db().search_profiles(prefix, limit)
    }

    async fn delete_user(&self, uid: &UserId) -> Result<()> {
        self.db().delete_user(uid)?;
        self.emit(StoreEvent::ProfileChanged(uid.clone()));
        Ok(())
    }

    async fn add_story(&self, draft: StoryDraft) -> Result<StoryRecord> {
        let record = self.db().insert_story(draft, self.clock.now())?;
        self.emit(StoreEvent::StoriesChanged);
        Ok(record)
    }

    async fn active_stories(&self, now: DateTime<Utc>) -> Result<Vec<StoryRecord>> {
        self.db().active_stories(now)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let events = self.db().apply_batch(batch, self.clock.now())?;
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
