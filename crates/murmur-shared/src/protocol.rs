//! Document shapes read from and written to the shared backend.
//!
//! Field names follow the existing backend schema exactly (camelCase, with a
//! few legacy spellings such as `photoURL`), so other clients of the same
//! backend keep working. Document ids live outside the document body and are
//! therefore `#[serde(skip)]`.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::ENCRYPTED_PREVIEW;
use crate::error::MurmurError;
use crate::types::{ChatId, MessageId, StoryId, UserId};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Encrypted,
}

/// Coarse media class derived from the MIME type of an attachment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }

    /// Conversation preview for a media message, e.g. `[IMAGE]`.
    pub fn preview_tag(&self) -> String {
        format!("[{}]", self.as_str().to_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub url: String,
    pub kind: MediaKind,
    pub file_name: String,
    pub file_size: Option<u64>,
}

/// What a message carries. Exactly one variant applies to any record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Encrypted { ciphertext: String, self_destruct: u32 },
    Media { caption: String, media: MediaDescriptor },
}

impl MessageBody {
    /// Preview text stored on the conversation. Never leaks the body of an
    /// encrypted message.
    pub fn preview(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Encrypted { .. } => ENCRYPTED_PREVIEW.to_string(),
            Self::Media { media, .. } => media.kind.preview_tag(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Encrypted { .. } => MessageKind::Encrypted,
            Self::Text(_) | Self::Media { .. } => MessageKind::Text,
        }
    }
}

/// A message as stored in the `messages` collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(skip)]
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub self_destruct: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl MessageRecord {
    /// Materialize a draft once the store has assigned id and timestamp.
    pub fn from_draft(id: MessageId, created_at: DateTime<Utc>, draft: MessageDraft) -> Self {
        let (text, kind, self_destruct, media) = match draft.body {
            MessageBody::Text(text) => (text, MessageKind::Text, 0, None),
            MessageBody::Encrypted {
                ciphertext,
                self_destruct,
            } => (ciphertext, MessageKind::Encrypted, self_destruct, None),
            MessageBody::Media { caption, media } => (caption, MessageKind::Text, 0, Some(media)),
        };

        Self {
            id,
            chat_id: draft.chat_id,
            sender_id: draft.sender_id,
            text,
            created_at,
            seen: false,
            kind,
            self_destruct,
            media_url: media.as_ref().map(|m| m.url.clone()),
            media_type: media.as_ref().map(|m| m.kind),
            file_name: media.as_ref().map(|m| m.file_name.clone()),
            file_size: media.and_then(|m| m.file_size),
        }
    }

    /// Typed view of the body. Media wins over the kind tag, matching how
    /// media messages are written (always `type = text`).
    pub fn body(&self) -> MessageBody {
        if let Some(url) = &self.media_url {
            return MessageBody::Media {
                caption: self.text.clone(),
                media: MediaDescriptor {
                    url: url.clone(),
                    kind: self.media_type.unwrap_or(MediaKind::File),
                    file_name: self.file_name.clone().unwrap_or_default(),
                    file_size: self.file_size,
                },
            };
        }
        match self.kind {
            MessageKind::Text => MessageBody::Text(self.text.clone()),
            MessageKind::Encrypted => MessageBody::Encrypted {
                ciphertext: self.text.clone(),
                self_destruct: self.self_destruct,
            },
        }
    }

    pub fn to_json(&self) -> Result<String, MurmurError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(id: MessageId, json: &str) -> Result<Self, MurmurError> {
        let mut record: Self = serde_json::from_str(json)?;
        record.id = id;
        Ok(record)
    }
}

/// An outgoing message before the store assigns id and creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub body: MessageBody,
}

// ---------------------------------------------------------------------------
// Users & chats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: UserId,
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "photoURL", default)]
    pub photo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Display snapshot of a member, captured when the chat is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberDetails {
    pub display_name: String,
    #[serde(rename = "photoURL", default)]
    pub photo_url: String,
    #[serde(default)]
    pub email: String,
}

impl MemberDetails {
    /// Snapshot of the creator, under their display name.
    pub fn own(profile: &UserProfile) -> Self {
        Self {
            display_name: profile.display_name.clone(),
            photo_url: profile.photo_url.clone(),
            email: profile.email.clone(),
        }
    }

    /// Snapshot of the invited peer, preferring their username.
    pub fn of(profile: &UserProfile) -> Self {
        let display_name = profile
            .username
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| profile.display_name.clone());
        Self {
            display_name,
            photo_url: profile.photo_url.clone(),
            email: profile.email.clone(),
        }
    }
}

/// A two-party conversation as stored in the `chats` collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(skip)]
    pub id: ChatId,
    pub members: [UserId; 2],
    pub member_details: BTreeMap<UserId, MemberDetails>,
    #[serde(default)]
    pub last_message: String,
    pub last_time: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: BTreeMap<UserId, u64>,
    pub created_by: UserId,
}

impl ChatRecord {
    pub fn has_member(&self, uid: &UserId) -> bool {
        self.members.contains(uid)
    }

    /// The other member, from `me`'s point of view.
    pub fn peer_of(&self, me: &UserId) -> Option<&UserId> {
        if !self.has_member(me) {
            return None;
        }
        self.members.iter().find(|m| *m != me)
    }

    pub fn unread_for(&self, uid: &UserId) -> u64 {
        self.unread_count.get(uid).copied().unwrap_or(0)
    }

    /// True for a chat whose members are exactly `a` and `b`.
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        self.has_member(a) && self.has_member(b) && a != b
    }

    pub fn from_json(id: ChatId, json: &str) -> Result<Self, MurmurError> {
        let mut record: Self = serde_json::from_str(json)?;
        record.id = id;
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSettings {
    pub hide_last_seen: bool,
    pub disable_read_receipts: bool,
    pub blocked_users: Vec<UserId>,
    pub chat_lock: bool,
    pub chat_lock_pin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_logout_at: Option<DateTime<Utc>>,
}

impl UserSettings {
    pub fn has_blocked(&self, uid: &UserId) -> bool {
        self.blocked_users.contains(uid)
    }
}

/// Partial update of a settings document. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub hide_last_seen: Option<bool>,
    pub disable_read_receipts: Option<bool>,
    pub blocked_users: Option<Vec<UserId>>,
    pub chat_lock: Option<bool>,
    pub chat_lock_pin: Option<String>,
    /// Stamp `lastLogoutAt` with the store's clock.
    pub stamp_logout: bool,
}

impl SettingsPatch {
    pub fn apply(&self, settings: &mut UserSettings, now: DateTime<Utc>) {
        if let Some(v) = self.hide_last_seen {
            settings.hide_last_seen = v;
        }
        if let Some(v) = self.disable_read_receipts {
            settings.disable_read_receipts = v;
        }
        if let Some(v) = &self.blocked_users {
            settings.blocked_users = v.clone();
        }
        if let Some(v) = self.chat_lock {
            settings.chat_lock = v;
        }
        if let Some(v) = &self.chat_lock_pin {
            settings.chat_lock_pin = v.clone();
        }
        if self.stamp_logout {
            settings.last_logout_at = Some(now);
        }
    }
}

// ---------------------------------------------------------------------------
// Stories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoryMedia {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Friends,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryRecord {
    #[serde(skip)]
    pub id: StoryId,
    pub user_id: UserId,
    pub user_display_name: String,
    #[serde(rename = "userPhotoURL", default)]
    pub user_photo_url: String,
    pub media_url: String,
    pub media_type: StoryMedia,
    pub visibility: Visibility,
    #[serde(default)]
    pub viewers: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
}

impl StoryRecord {
    pub fn from_draft(id: StoryId, created_at: DateTime<Utc>, draft: StoryDraft) -> Self {
        Self {
            id,
            user_id: draft.owner.uid,
            user_display_name: draft.owner.display_name,
            user_photo_url: draft.owner.photo_url,
            media_url: draft.media_url,
            media_type: draft.media_type,
            visibility: draft.visibility,
            viewers: Vec::new(),
            created_at,
            expire_at: expiry(created_at, draft.ttl_hours),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expire_at
    }

    pub fn seen_by(&self, uid: &UserId) -> bool {
        self.viewers.contains(uid)
    }

    pub fn from_json(id: StoryId, json: &str) -> Result<Self, MurmurError> {
        let mut record: Self = serde_json::from_str(json)?;
        record.id = id;
        Ok(record)
    }
}

/// `created_at + ttl_hours`, capped at the latest representable instant.
fn expiry(created_at: DateTime<Utc>, ttl_hours: i64) -> DateTime<Utc> {
    Duration::try_hours(ttl_hours)
        .and_then(|ttl| created_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryDraft {
    pub owner: UserProfile,
    pub media_url: String,
    pub media_type: StoryMedia,
    pub visibility: Visibility,
    /// Lifetime in hours, normally [`STORY_TTL_HOURS`](crate::constants::STORY_TTL_HOURS).
    pub ttl_hours: i64,
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

/// Value stored at `status/{uid}` in the ephemeral channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub state: PresenceState,
    /// Server time of the last change, Unix epoch millis.
    pub last_changed: i64,
}

impl PresenceRecord {
    pub fn is_online(&self) -> bool {
        self.state == PresenceState::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn text_message_uses_backend_field_names() {
        let record = MessageRecord::from_draft(
            MessageId::from("m1"),
            ts(),
            MessageDraft {
                chat_id: ChatId::from("c1"),
                sender_id: UserId::from("alice"),
                body: MessageBody::Text("hi".into()),
            },
        );
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["chatId"], "c1");
        assert_eq!(json["senderId"], "alice");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["seen"], false);
        assert_eq!(json["type"], "text");
        assert_eq!(json["selfDestruct"], 0);
        assert!(json.get("mediaUrl").is_none());
        assert!(json.get("id").is_none());
    }

    #[test]
    fn media_message_is_always_text_kind() {
        let draft = MessageDraft {
            chat_id: ChatId::from("c1"),
            sender_id: UserId::from("alice"),
            body: MessageBody::Media {
                caption: String::new(),
                media: MediaDescriptor {
                    url: "https://blobs/x.png".into(),
                    kind: MediaKind::Image,
                    file_name: "x.png".into(),
                    file_size: Some(42),
                },
            },
        };
        let record = MessageRecord::from_draft(MessageId::new(), ts(), draft.clone());
        assert_eq!(record.kind, MessageKind::Text);
        assert_eq!(record.media_type, Some(MediaKind::Image));
        assert_eq!(record.body(), draft.body);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["mediaType"], "image");
        assert_eq!(json["fileName"], "x.png");
        assert_eq!(json["fileSize"], 42);
    }

    #[test]
    fn encrypted_message_round_trips_through_json() {
        let record = MessageRecord::from_draft(
            MessageId::from("m9"),
            ts(),
            MessageDraft {
                chat_id: ChatId::from("c1"),
                sender_id: UserId::from("bob"),
                body: MessageBody::Encrypted {
                    ciphertext: "Zm9v".into(),
                    self_destruct: 60,
                },
            },
        );
        let json = record.to_json().unwrap();
        let back = MessageRecord::from_json(MessageId::from("m9"), &json).unwrap();
        assert_eq!(back, record);
        assert!(matches!(
            back.body(),
            MessageBody::Encrypted { self_destruct: 60, .. }
        ));
    }

    #[test]
    fn legacy_message_without_type_is_text() {
        let json = r#"{"chatId":"c","senderId":"u","text":"old","createdAt":"2024-03-01T12:00:00Z","seen":true}"#;
        let record = MessageRecord::from_json(MessageId::from("m"), json).unwrap();
        assert_eq!(record.body(), MessageBody::Text("old".into()));
    }

    #[test]
    fn previews_never_leak_encrypted_bodies() {
        let encrypted = MessageBody::Encrypted {
            ciphertext: "c2VjcmV0".into(),
            self_destruct: 0,
        };
        assert_eq!(encrypted.preview(), ENCRYPTED_PREVIEW);
        assert_eq!(MessageBody::Text("hi".into()).preview(), "hi");
        assert_eq!(MediaKind::Video.preview_tag(), "[VIDEO]");
    }

    #[test]
    fn media_kind_from_mime() {
        assert_eq!(MediaKind::from_mime("image/png"), MediaKind::Image);
        assert_eq!(MediaKind::from_mime("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_mime("audio/webm"), MediaKind::Audio);
        assert_eq!(MediaKind::from_mime("application/pdf"), MediaKind::File);
    }

    #[test]
    fn chat_helpers() {
        let chat = ChatRecord {
            id: ChatId::from("c"),
            members: [UserId::from("a"), UserId::from("b")],
            member_details: BTreeMap::new(),
            last_message: String::new(),
            last_time: ts(),
            unread_count: BTreeMap::from([(UserId::from("b"), 3)]),
            created_by: UserId::from("a"),
        };
        assert_eq!(chat.peer_of(&UserId::from("a")), Some(&UserId::from("b")));
        assert_eq!(chat.peer_of(&UserId::from("z")), None);
        assert_eq!(chat.unread_for(&UserId::from("b")), 3);
        assert_eq!(chat.unread_for(&UserId::from("a")), 0);

        let json = serde_json::to_value(&chat).unwrap();
        assert_eq!(json["unreadCount"]["b"], 3);
        assert!(json.get("memberDetails").is_some());
    }

    #[test]
    fn settings_fill_missing_fields_with_defaults() {
        let settings: UserSettings = serde_json::from_str(r#"{"blockedUsers":["x"]}"#).unwrap();
        assert!(settings.has_blocked(&UserId::from("x")));
        assert!(!settings.hide_last_seen);
        assert!(settings.last_logout_at.is_none());
    }

    #[test]
    fn settings_patch_touches_only_given_fields() {
        let mut settings = UserSettings {
            hide_last_seen: true,
            ..Default::default()
        };
        SettingsPatch {
            disable_read_receipts: Some(true),
            stamp_logout: true,
            ..Default::default()
        }
        .apply(&mut settings, ts());

        assert!(settings.hide_last_seen);
        assert!(settings.disable_read_receipts);
        assert_eq!(settings.last_logout_at, Some(ts()));
    }

    #[test]
    fn story_expires_after_a_day() {
        let story = StoryRecord::from_draft(
            StoryId::from("s"),
            ts(),
            StoryDraft {
                owner: UserProfile {
                    uid: UserId::from("a"),
                    display_name: "Ann".into(),
                    ..Default::default()
                },
                media_url: "u".into(),
                media_type: StoryMedia::Image,
                visibility: Visibility::Friends,
                ttl_hours: crate::constants::STORY_TTL_HOURS,
            },
        );
        assert!(story.is_active(ts() + Duration::hours(23)));
        assert!(!story.is_active(ts() + Duration::hours(24)));

        let json = serde_json::to_value(&story).unwrap();
        assert_eq!(json["visibility"], "friends");
        assert!(json.get("userPhotoURL").is_some());
    }

    #[test]
    fn absurd_story_lifetime_saturates() {
        let story = StoryRecord::from_draft(
            StoryId::from("s"),
            ts(),
            StoryDraft {
                owner: UserProfile::default(),
                media_url: "u".into(),
                media_type: StoryMedia::Image,
                visibility: Visibility::Public,
                ttl_hours: i64::MAX,
            },
        );
        assert_eq!(story.expire_at, DateTime::<Utc>::MAX_UTC);
        assert!(story.is_active(ts() + Duration::days(365 * 100)));
    }

    #[test]
    fn presence_json_shape() {
        let json = serde_json::to_value(PresenceRecord {
            state: PresenceState::Online,
            last_changed: 5,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"state": "online", "last_changed": 5}));
    }
}
