//! The durable document store contract.
//!
//! Mirrors what the messaging core needs from a hosted document database:
//! collection-scoped queries, server-assigned ids and timestamps, atomic
//! batches with server-side counter updates, and a change feed that lets
//! subscribers re-query when something they watch has changed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use murmur_shared::protocol::{
    ChatRecord, MemberDetails, MessageDraft, MessageRecord, SettingsPatch, StoryDraft,
    StoryRecord, UserProfile, UserSettings,
};
use murmur_shared::types::{ChatId, MessageId, StoryId, UserId};

use crate::error::Result;

/// Capacity of the change feed. Lagging receivers skip ahead and re-query.
pub const EVENT_CAPACITY: usize = 256;

/// What changed in the store. Subscribers re-read what they care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    MessagesChanged(ChatId),
    ChatChanged { chat_id: ChatId, members: [UserId; 2] },
    SettingsChanged(UserId),
    ProfileChanged(UserId),
    StoriesChanged,
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Flip a message's `seen` flag to true.
    MarkSeen { message_id: MessageId },
    /// Set `unreadCount[uid]` to zero.
    ResetUnread { chat_id: ChatId, uid: UserId },
    /// Update the conversation summary and bump the recipient's counter by
    /// one, stamping `lastTime` with the store's clock.
    TouchChat {
        chat_id: ChatId,
        last_message: String,
        increment_unread_for: UserId,
    },
    /// Merge a partial update into a settings document (created if absent).
    UpdateSettings { uid: UserId, patch: SettingsPatch },
    /// Array-union a viewer into a story.
    AddStoryViewer { story_id: StoryId, viewer: UserId },
}

/// Writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

impl From<WriteOp> for WriteBatch {
    fn from(op: WriteOp) -> Self {
        Self { ops: vec![op] }
    }
}

/// A new two-member conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatDraft {
    pub members: [UserId; 2],
    pub member_details: BTreeMap<UserId, MemberDetails>,
    pub created_by: UserId,
}

impl ChatDraft {
    pub fn between(creator: &UserProfile, peer: &UserProfile) -> Self {
        Self {
            members: [creator.uid.clone(), peer.uid.clone()],
            member_details: BTreeMap::from([
                (creator.uid.clone(), MemberDetails::own(creator)),
                (peer.uid.clone(), MemberDetails::of(peer)),
            ]),
            created_by: creator.uid.clone(),
        }
    }

    pub fn into_record(self, id: ChatId, now: DateTime<Utc>) -> ChatRecord {
        let unread_count = self.members.iter().map(|m| (m.clone(), 0)).collect();
        ChatRecord {
            id,
            members: self.members,
            member_details: self.member_details,
            last_message: String::new(),
            last_time: now,
            unread_count,
            created_by: self.created_by,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a message; the store assigns id and `createdAt`.
    async fn add_message(&self, draft: MessageDraft) -> Result<MessageRecord>;

    /// The `limit` most recent messages of a chat, newest first.
    async fn recent_messages(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<MessageRecord>>;

    async fn get_chat(&self, chat_id: &ChatId) -> Result<Option<ChatRecord>>;

    /// Chats whose `members` contain `uid`, most recent activity first.
    async fn chats_for_member(&self, uid: &UserId) -> Result<Vec<ChatRecord>>;

    async fn create_chat(&self, draft: ChatDraft) -> Result<ChatRecord>;

    async fn get_settings(&self, uid: &UserId) -> Result<Option<UserSettings>>;

    async fn put_settings(&self, uid: &UserId, settings: &UserSettings) -> Result<()>;

    async fn get_profile(&self, uid: &UserId) -> Result<Option<UserProfile>>;

    async fn put_profile(&self, profile: &UserProfile) -> Result<()>;

    /// Profiles whose username starts with `prefix`.
    async fn search_profiles(&self, prefix: &str, limit: usize) -> Result<Vec<UserProfile>>;

    /// Remove the user's profile and settings documents.
    async fn delete_user(&self, uid: &UserId) -> Result<()>;

    async fn add_story(&self, draft: StoryDraft) -> Result<StoryRecord>;

    /// Stories with `expireAt > now`, latest expiry first.
    async fn active_stories(&self, now: DateTime<Utc>) -> Result<Vec<StoryRecord>>;

    /// Apply every op or none of them.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
