//! In-process [`DocumentStore`] used by tests and the demo binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use murmur_shared::protocol::{
    ChatRecord, MessageDraft, MessageRecord, StoryDraft, StoryRecord, UserProfile, UserSettings,
};
use murmur_shared::types::{ChatId, MessageId, StoryId, UserId};

use crate::clock::ServerClock;
use crate::document::{ChatDraft, DocumentStore, StoreEvent, WriteBatch, WriteOp, EVENT_CAPACITY};
use crate::error::{Result, StoreError};

#[derive(Default)]
struct Collections {
    messages: HashMap<MessageId, MessageRecord>,
    chats: HashMap<ChatId, ChatRecord>,
    settings: HashMap<UserId, UserSettings>,
    profiles: HashMap<UserId, UserProfile>,
    stories: HashMap<StoryId, StoryRecord>,
}

pub struct MemoryStore {
    inner: Mutex<Collections>,
    clock: ServerClock,
    events: broadcast::Sender<StoreEvent>,
    offline: AtomicBool,
    rejecting_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Collections::default()),
            clock: ServerClock::new(),
            events,
            offline: AtomicBool::new(false),
            rejecting_commits: AtomicBool::new(false),
        }
    }

    /// Simulate losing the backend: every call fails with
    /// [`StoreError::Unavailable`] until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make [`DocumentStore::commit`] alone fail with
    /// [`StoreError::Unavailable`]. Reads and message writes keep working.
    pub fn set_rejecting_commits(&self, rejecting: bool) {
        self.rejecting_commits.store(rejecting, Ordering::SeqCst);
    }

    /// Number of stored messages in a chat.
    pub fn message_count(&self, chat_id: &ChatId) -> usize {
        self.lock()
            .messages
            .values()
            .filter(|m| &m.chat_id == chat_id)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(db: &Collections, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::MarkSeen { message_id } => db
            .messages
            .contains_key(message_id)
            .then_some(())
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}"))),
        WriteOp::ResetUnread { chat_id, .. } | WriteOp::TouchChat { chat_id, .. } => db
            .chats
            .contains_key(chat_id)
            .then_some(())
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}"))),
        WriteOp::AddStoryViewer { story_id, .. } => db
            .stories
            .contains_key(story_id)
            .then_some(())
            .ok_or_else(|| StoreError::NotFound(format!("story {story_id}"))),
        WriteOp::UpdateSettings { .. } => Ok(()),
    }
}

fn apply(db: &mut Collections, op: WriteOp, now: DateTime<Utc>) -> Option<StoreEvent> {
    match op {
        WriteOp::MarkSeen { message_id } => {
            let message = db.messages.get_mut(&message_id)?;
            message.seen = true;
            Some(StoreEvent::MessagesChanged(message.chat_id.clone()))
        }
        WriteOp::ResetUnread { chat_id, uid } => {
            let chat = db.chats.get_mut(&chat_id)?;
            chat.unread_count.insert(uid, 0);
            Some(StoreEvent::ChatChanged {
                chat_id,
                members: chat.members.clone(),
            })
        }
        WriteOp::TouchChat {
            chat_id,
            last_message,
            increment_unread_for,
        } => {
            let chat = db.chats.get_mut(&chat_id)?;
            chat.last_message = last_message;
            chat.last_time = now;
            *chat.unread_count.entry(increment_unread_for).or_insert(0) += 1;
            Some(StoreEvent::ChatChanged {
                chat_id,
                members: chat.members.clone(),
            })
        }
        WriteOp::UpdateSettings { uid, patch } => {
            let settings = db.settings.entry(uid.clone()).or_default();
            patch.apply(settings, now);
            Some(StoreEvent::SettingsChanged(uid))
        }
        WriteOp::AddStoryViewer { story_id, viewer } => {
            let story = db.stories.get_mut(&story_id)?;
            if !story.viewers.contains(&viewer) {
                story.viewers.push(viewer);
            }
            Some(StoreEvent::StoriesChanged)
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn add_message(&self, draft: MessageDraft) -> Result<MessageRecord> {
        self.ensure_online()?;
        let record = MessageRecord::from_draft(MessageId::new(), self.clock.now(), draft);
        self.lock()
            .messages
            .insert(record.id.clone(), record.clone());

        debug!(message = %record.id, chat = %record.chat_id, "message stored");
        self.emit(StoreEvent::MessagesChanged(record.chat_id.clone()));
        Ok(record)
    }

    async fn recent_messages(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<MessageRecord>> {
        self.ensure_online()?;
        let db = self.lock();
        let mut messages: Vec<MessageRecord> = db
            .messages
            .values()
            .filter(|m| &m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn get_chat(&self, chat_id: &ChatId) -> Result<Option<ChatRecord>> {
        self.ensure_online()?;
        Ok(self.lock().chats.get(chat_id).cloned())
    }

    async fn chats_for_member(&self, uid: &UserId) -> Result<Vec<ChatRecord>> {
        self.ensure_online()?;
        let db = self.lock();
        let mut chats: Vec<ChatRecord> = db
            .chats
            .values()
            .filter(|c| c.has_member(uid))
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.last_time.cmp(&a.last_time));
        Ok(chats)
    }

    async fn create_chat(&self, draft: ChatDraft) -> Result<ChatRecord> {
        self.ensure_online()?;
        let record = draft.into_record(ChatId::new(), self.clock.now());
        self.lock().chats.insert(record.id.clone(), record.clone());
        self.emit(StoreEvent::ChatChanged {
            chat_id: record.id.clone(),
            members: record.members.clone(),
        });
        Ok(record)
    }

    async fn get_settings(&self, uid: &UserId) -> Result<Option<UserSettings>> {
        self.ensure_online()?;
        Ok(self.lock().settings.get(uid).cloned())
    }

    async fn put_settings(&self, uid: &UserId, settings: &UserSettings) -> Result<()> {
        self.ensure_online()?;
        self.lock().settings.insert(uid.clone(), settings.clone());
        self.emit(StoreEvent::SettingsChanged(uid.clone()));
        Ok(())
    }

    async fn get_profile(&self, uid: &UserId) -> Result<Option<UserProfile>> {
        self.ensure_online()?;
        Ok(self.lock().profiles.get(uid).cloned())
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        self.ensure_online()?;
        self.lock()
            .profiles
            .insert(profile.uid.clone(), profile.clone());
        self.emit(StoreEvent::ProfileChanged(profile.uid.clone()));
        Ok(())
    }

    async fn search_profiles(&self, prefix: &str, limit: usize) -> Result<Vec<UserProfile>> {
        self.ensure_online()?;
        let db = self.lock();
        let mut found: Vec<UserProfile> = db
            .profiles
            .values()
            .filter(|p| {
                p.username
                    .as_deref()
                    .is_some_and(|name| name.starts_with(prefix))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.username.cmp(&b.username));
        found.truncate(limit);
        Ok(found)
    }

    async fn delete_user(&self, uid: &UserId) -> Result<()> {
        self.ensure_online()?;
        {
            let mut db = self.lock();
            db.profiles.remove(uid);
            db.settings.remove(uid);
        }
        self.emit(StoreEvent::ProfileChanged(uid.clone()));
        Ok(())
    }

    async fn add_story(&self, draft: StoryDraft) -> Result<StoryRecord> {
        self.ensure_online()?;
        let record = StoryRecord::from_draft(StoryId::new(), self.clock.now(), draft);
        self.lock()
            .stories
            .insert(record.id.clone(), record.clone());
        self.emit(StoreEvent::StoriesChanged);
        Ok(record)
    }

    async fn active_stories(&self, now: DateTime<Utc>) -> Result<Vec<StoryRecord>> {
        self.ensure_online()?;
        let db = self.lock();
        let mut stories: Vec<StoryRecord> = db
            .stories
            .values()
            .filter(|s| s.is_active(now))
            .cloned()
            .collect();
        stories.sort_by(|a, b| b.expire_at.cmp(&a.expire_at));
        Ok(stories)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.ensure_online()?;
        if self.rejecting_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut db = self.lock();
            for op in batch.ops() {
                validate(&db, op)?;
            }
            for op in batch.into_ops() {
                if let Some(event) = apply(&mut db, op, now) {
                    if !events.contains(&event) {
                        events.push(event);
                    }
                }
            }
        }
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::protocol::{MessageBody, SettingsPatch, StoryMedia, Visibility};

    fn profile(uid: &str) -> UserProfile {
        UserProfile {
            uid: UserId::from(uid),
            display_name: uid.to_uppercase(),
            username: Some(uid.to_string()),
            ..Default::default()
        }
    }

    fn text(chat: &ChatRecord, from: &str, body: &str) -> MessageDraft {
        MessageDraft {
            chat_id: chat.id.clone(),
            sender_id: UserId::from(from),
            body: MessageBody::Text(body.into()),
        }
    }

    #[tokio::test]
    async fn recent_messages_newest_first_and_limited() {
        let store = MemoryStore::new();
        let chat = store
            .create_chat(ChatDraft::between(&profile("a"), &profile("b")))
            .await
            .unwrap();
        for i in 0..5 {
            store.add_message(text(&chat, "a", &format!("{i}"))).await.unwrap();
        }

        let recent = store.recent_messages(&chat.id, 3).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["4", "3", "2"]);
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        let chat = store
            .create_chat(ChatDraft::between(&profile("a"), &profile("b")))
            .await
            .unwrap();

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::TouchChat {
                chat_id: chat.id.clone(),
                last_message: "hello".into(),
                increment_unread_for: UserId::from("b"),
            })
            .push(WriteOp::MarkSeen {
                message_id: MessageId::from("missing"),
            });

        assert!(matches!(
            store.commit(batch).await,
            Err(StoreError::NotFound(_))
        ));
        let unchanged = store.get_chat(&chat.id).await.unwrap().unwrap();
        assert_eq!(unchanged.last_message, "");
        assert_eq!(unchanged.unread_for(&UserId::from("b")), 0);
    }

    #[tokio::test]
    async fn touch_chat_increments_and_reset_zeroes() {
        let store = MemoryStore::new();
        let chat = store
            .create_chat(ChatDraft::between(&profile("a"), &profile("b")))
            .await
            .unwrap();
        let touch = WriteOp::TouchChat {
            chat_id: chat.id.clone(),
            last_message: "x".into(),
            increment_unread_for: UserId::from("b"),
        };
        store.commit(touch.clone().into()).await.unwrap();
        store.commit(touch.into()).await.unwrap();

        let after = store.get_chat(&chat.id).await.unwrap().unwrap();
        assert_eq!(after.unread_for(&UserId::from("b")), 2);
        assert_eq!(after.unread_for(&UserId::from("a")), 0);
        assert!(after.last_time > chat.last_time);

        store
            .commit(
                WriteOp::ResetUnread {
                    chat_id: chat.id.clone(),
                    uid: UserId::from("b"),
                }
                .into(),
            )
            .await
            .unwrap();
        let reset = store.get_chat(&chat.id).await.unwrap().unwrap();
        assert_eq!(reset.unread_for(&UserId::from("b")), 0);
    }

    #[tokio::test]
    async fn change_feed_reports_writes() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        let chat = store
            .create_chat(ChatDraft::between(&profile("a"), &profile("b")))
            .await
            .unwrap();
        store.add_message(text(&chat, "a", "hi")).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::ChatChanged { .. }));
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::MessagesChanged(chat.id.clone())
        );
    }

    #[tokio::test]
    async fn offline_store_rejects_calls() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.get_settings(&UserId::from("a")).await,
            Err(StoreError::Unavailable)
        ));
        store.set_offline(false);
        assert!(store.get_settings(&UserId::from("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_commits_leave_message_writes_working() {
        let store = MemoryStore::new();
        let chat = store
            .create_chat(ChatDraft::between(&profile("a"), &profile("b")))
            .await
            .unwrap();
        store.set_rejecting_commits(true);

        store.add_message(text(&chat, "a", "hi")).await.unwrap();
        let touch = WriteOp::TouchChat {
            chat_id: chat.id.clone(),
            last_message: "hi".into(),
            increment_unread_for: UserId::from("b"),
        };
        assert!(matches!(
            store.commit(touch.clone().into()).await,
            Err(StoreError::Unavailable)
        ));
        assert_eq!(store.message_count(&chat.id), 1);

        store.set_rejecting_commits(false);
        store.commit(touch.into()).await.unwrap();
    }

    #[tokio::test]
    async fn settings_patch_creates_document() {
        let store = MemoryStore::new();
        let uid = UserId::from("a");
        store
            .commit(
                WriteOp::UpdateSettings {
                    uid: uid.clone(),
                    patch: SettingsPatch {
                        blocked_users: Some(vec![UserId::from("b")]),
                        ..Default::default()
                    },
                }
                .into(),
            )
            .await
            .unwrap();
        let settings = store.get_settings(&uid).await.unwrap().unwrap();
        assert!(settings.has_blocked(&UserId::from("b")));
    }

    #[tokio::test]
    async fn stories_filtered_by_expiry_and_viewers_unioned() {
        let store = MemoryStore::new();
        let story = store
            .add_story(StoryDraft {
                owner: profile("a"),
                media_url: "u".into(),
                media_type: StoryMedia::Image,
                visibility: Visibility::Public,
                ttl_hours: 24,
            })
            .await
            .unwrap();

        let viewer = WriteOp::AddStoryViewer {
            story_id: story.id.clone(),
            viewer: UserId::from("b"),
        };
        store.commit(viewer.clone().into()).await.unwrap();
        store.commit(viewer.into()).await.unwrap();

        let active = store.active_stories(Utc::now()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].viewers, vec![UserId::from("b")]);

        let later = story.expire_at + chrono::Duration::seconds(1);
        assert!(store.active_stories(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn profile_search_by_prefix() {
        let store = MemoryStore::new();
        for name in ["alice", "alan", "bob"] {
            store.put_profile(&profile(name)).await.unwrap();
        }
        let found = store.search_profiles("al", 10).await.unwrap();
        let names: Vec<_> = found.iter().filter_map(|p| p.username.as_deref()).collect();
        assert_eq!(names, ["alan", "alice"]);
    }
}
