//! Building and sending outgoing messages.
//!
//! A message is first persisted, then the conversation summary is updated in
//! a single batch (preview, `lastTime`, peer's unread counter + 1). Once the
//! message is stored the send counts as done, even if the summary write
//! fails.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use murmur_shared::constants::{
    SELF_DESTRUCT_OPTIONS, VOICE_CONTENT_TYPE, VOICE_DISPLAY_NAME, VOICE_FILE_NAME,
};
use murmur_shared::crypto::{self, EncryptionKey};
use murmur_shared::protocol::{MediaDescriptor, MediaKind, MessageBody, MessageDraft, MessageRecord};
use murmur_shared::types::{ChatId, UserId};
use murmur_store::{StoreError, WriteOp};

use crate::error::{ClientError, Result};
use crate::media;
use crate::session::Session;
use crate::subscription::Liveness;

/// Composer input of one conversation.
#[derive(Debug, Default)]
pub struct Composer {
    draft: String,
    encrypt: bool,
    self_destruct: u32,
    pending_key: Option<EncryptionKey>,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn encrypt(&self) -> bool {
        self.encrypt
    }

    pub fn set_encrypt(&mut self, on: bool) {
        self.encrypt = on;
    }

    pub fn self_destruct(&self) -> u32 {
        self.self_destruct
    }

    /// Only the offered durations are accepted.
    pub fn set_self_destruct(&mut self, secs: u32) -> bool {
        if !SELF_DESTRUCT_OPTIONS.contains(&secs) {
            return false;
        }
        self.self_destruct = secs;
        true
    }

    /// Key of the last encrypted send, still waiting to be shown.
    pub fn pending_key(&self) -> Option<&str> {
        self.pending_key.as_ref().map(EncryptionKey::as_str)
    }

    /// Hand out the key once. Later calls return `None`.
    pub fn take_key(&mut self) -> Option<String> {
        self.pending_key.take().map(|key| key.as_str().to_string())
    }

    pub fn dismiss_key(&mut self) {
        self.pending_key = None;
    }

    fn reset_secrecy(&mut self) {
        self.encrypt = false;
        self.self_destruct = 0;
    }
}

/// A file picked for sending.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

/// Sends messages into one conversation on behalf of the session user.
#[derive(Clone)]
pub struct Dispatcher {
    session: Arc<Session>,
    chat_id: ChatId,
    peer: UserId,
    liveness: Liveness,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>, chat_id: ChatId, peer: UserId, liveness: Liveness) -> Self {
        Self {
            session,
            chat_id,
            peer,
            liveness,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn peer_blocked(&self) -> bool {
        self.session.is_blocked(&self.peer)
    }

    /// Send the composer's text, encrypted if the toggle is on.
    ///
    /// Surrounding whitespace is not sent. Returns `Ok(None)` when nothing
    /// was sent: blocked peer or blank draft. On failure the draft is left in
    /// place.
    pub async fn send(&self, composer: &mut Composer) -> Result<Option<MessageRecord>> {
        if self.blocked() {
            return Ok(None);
        }
        let text = composer.draft.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let text = text.to_string();

        let (body, key) = if composer.encrypt {
            let key = crypto::generate_key();
            let ciphertext = crypto::encrypt(&text, &key)?;
            (
                MessageBody::Encrypted {
                    ciphertext,
                    self_destruct: composer.self_destruct,
                },
                Some(key),
            )
        } else {
            (MessageBody::Text(text), None)
        };

        let record = self.deliver(body).await?;
        composer.draft.clear();
        if key.is_some() {
            composer.pending_key = key;
            composer.reset_secrecy();
        }
        Ok(Some(record))
    }

    /// Upload a file and send it with the draft as caption. Pictures are
    /// compressed first. Media is never encrypted.
    pub async fn send_media(
        &self,
        composer: &mut Composer,
        upload: MediaUpload,
        progress: Option<mpsc::UnboundedSender<f64>>,
    ) -> Result<Option<MessageRecord>> {
        if self.blocked() {
            return Ok(None);
        }
        let caption = composer.draft.clone();
        let display_name = upload.file_name.clone();
        let upload = media::compress_in_background(upload).await;
        let sent = self
            .upload_and_send(caption, upload, display_name, progress)
            .await?;
        if sent.is_some() {
            composer.draft.clear();
        }
        Ok(sent)
    }

    /// Send a recorded voice clip.
    pub async fn send_voice(&self, clip: Bytes) -> Result<Option<MessageRecord>> {
        if self.blocked() {
            return Ok(None);
        }
        let upload = MediaUpload {
            file_name: VOICE_FILE_NAME.to_string(),
            content_type: VOICE_CONTENT_TYPE.to_string(),
            data: clip,
        };
        self.upload_and_send(String::new(), upload, VOICE_DISPLAY_NAME.to_string(), None)
            .await
    }

    fn blocked(&self) -> bool {
        let blocked = self.peer_blocked();
        if blocked {
            debug!(chat = %self.chat_id, "peer is blocked, not sending");
        }
        blocked
    }

    async fn upload_and_send(
        &self,
        caption: String,
        upload: MediaUpload,
        display_name: String,
        progress: Option<mpsc::UnboundedSender<f64>>,
    ) -> Result<Option<MessageRecord>> {
        let size = upload.data.len();
        let max = self.session.config().max_upload_bytes;
        if size > max {
            return Err(StoreError::BlobTooLarge { size, max }.into());
        }

        let path = format!(
            "chat_media/{}/{}_{}",
            self.chat_id,
            Utc::now().timestamp_millis(),
            upload.file_name
        );
        let url = self
            .session
            .blobs()
            .upload(&path, upload.data, &upload.content_type, progress)
            .await
            .map_err(|e| {
                error!(chat = %self.chat_id, path = %path, error = %e, "upload failed");
                ClientError::from(e)
            })?;

        if !self.liveness.is_alive() {
            debug!(chat = %self.chat_id, path = %path, "view closed during upload, dropping");
            return Ok(None);
        }

        let body = MessageBody::Media {
            caption,
            media: MediaDescriptor {
                url,
                kind: MediaKind::from_mime(&upload.content_type),
                file_name: display_name,
                file_size: Some(size as u64),
            },
        };
        self.deliver(body).await.map(Some)
    }

    async fn deliver(&self, body: MessageBody) -> Result<MessageRecord> {
        let preview = body.preview();
        let store = self.session.store();

        let record = store
            .add_message(MessageDraft {
                chat_id: self.chat_id.clone(),
                sender_id: self.session.uid().clone(),
                body,
            })
            .await
            .map_err(|e| {
                error!(chat = %self.chat_id, error = %e, "failed to send message");
                ClientError::from(e)
            })?;

        if let Err(e) = store
            .commit(
                WriteOp::TouchChat {
                    chat_id: self.chat_id.clone(),
                    last_message: preview,
                    increment_unread_for: self.peer.clone(),
                }
                .into(),
            )
            .await
        {
            warn!(chat = %self.chat_id, message = %record.id, error = %e, "failed to update chat summary");
        }

        info!(chat = %self.chat_id, message = %record.id, kind = ?record.kind, "message sent");
        Ok(record)
    }
}
