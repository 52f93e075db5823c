//! Ephemeral stories: publishing, visibility, grouping and playback.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use murmur_shared::constants::STORY_SLIDE_MS;
use murmur_shared::protocol::{StoryDraft, StoryMedia, StoryRecord, Visibility};
use murmur_shared::types::UserId;
use murmur_store::{StoreError, WriteOp};

use crate::dispatch::MediaUpload;
use crate::error::{ClientError, Result};
use crate::session::Session;

/// Stories the local user may see: their own, public ones, and friends-only
/// stories of chat partners. Expired stories never show.
pub fn visible(
    stories: Vec<StoryRecord>,
    me: &UserId,
    partners: &HashSet<UserId>,
    now: DateTime<Utc>,
) -> Vec<StoryRecord> {
    stories
        .into_iter()
        .filter(|story| story.is_active(now))
        .filter(|story| {
            &story.user_id == me
                || story.visibility == Visibility::Public
                || partners.contains(&story.user_id)
        })
        .collect()
}

/// All active stories of one owner, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryGroup {
    pub owner: UserId,
    pub owner_name: String,
    pub owner_photo: String,
    pub stories: Vec<StoryRecord>,
}

impl StoryGroup {
    pub fn has_unseen(&self, me: &UserId) -> bool {
        self.stories.iter().any(|story| !story.seen_by(me))
    }
}

/// Group by owner. The local user's group comes first, the others follow in
/// owner order.
pub fn group_by_owner(stories: Vec<StoryRecord>, me: &UserId) -> Vec<StoryGroup> {
    let mut by_owner: BTreeMap<UserId, Vec<StoryRecord>> = BTreeMap::new();
    for story in stories {
        by_owner.entry(story.user_id.clone()).or_default().push(story);
    }

    let mut groups: Vec<StoryGroup> = by_owner
        .into_iter()
        .map(|(owner, mut stories)| {
            stories.sort_by_key(|story| story.created_at);
            let newest = stories.last();
            StoryGroup {
                owner_name: newest.map(|s| s.user_display_name.clone()).unwrap_or_default(),
                owner_photo: newest.map(|s| s.user_photo_url.clone()).unwrap_or_default(),
                owner,
                stories,
            }
        })
        .collect();

    if let Some(pos) = groups.iter().position(|group| &group.owner == me) {
        let mine = groups.remove(pos);
        groups.insert(0, mine);
    }
    groups
}

fn story_media(content_type: &str) -> StoryMedia {
    if content_type.starts_with("video") {
        StoryMedia::Video
    } else {
        StoryMedia::Image
    }
}

pub struct StoryFeed {
    session: Arc<Session>,
}

impl StoryFeed {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Upload and publish a story. It expires after the configured lifetime.
    pub async fn publish(
        &self,
        upload: MediaUpload,
        visibility: Visibility,
        progress: Option<mpsc::UnboundedSender<f64>>,
    ) -> Result<StoryRecord> {
        let size = upload.data.len();
        let max = self.session.config().max_upload_bytes;
        if size > max {
            return Err(StoreError::BlobTooLarge { size, max }.into());
        }

        let me = self.session.me();
        let path = format!(
            "stories/{}/{}_{}",
            me.uid,
            Utc::now().timestamp_millis(),
            upload.file_name
        );
        let media_type = story_media(&upload.content_type);
        let media_url = self
            .session
            .blobs()
            .upload(&path, upload.data, &upload.content_type, progress)
            .await
            .map_err(|e| {
                error!(path = %path, error = %e, "story upload failed");
                ClientError::from(e)
            })?;

        let story = self
            .session
            .store()
            .add_story(StoryDraft {
                owner: me.clone(),
                media_url,
                media_type,
                visibility,
                ttl_hours: self.session.config().story_ttl_hours,
            })
            .await?;
        info!(story = %story.id, ?visibility, "story published");
        Ok(story)
    }

    /// Active stories visible to the local user, grouped for the story bar.
    pub async fn load(&self) -> Result<Vec<StoryGroup>> {
        let me = self.session.uid();
        let store = self.session.store();
        let now = Utc::now();

        let partners: HashSet<UserId> = store
            .chats_for_member(me)
            .await?
            .iter()
            .filter_map(|chat| chat.peer_of(me).cloned())
            .collect();
        let stories = store.active_stories(now).await?;
        Ok(group_by_owner(visible(stories, me, &partners, now), me))
    }

    /// Record the local user as a viewer, once.
    pub async fn mark_viewed(&self, story: &StoryRecord) -> Result<()> {
        let me = self.session.uid();
        if story.seen_by(me) {
            return Ok(());
        }
        self.session
            .store()
            .commit(
                WriteOp::AddStoryViewer {
                    story_id: story.id.clone(),
                    viewer: me.clone(),
                }
                .into(),
            )
            .await?;
        debug!(story = %story.id, "story viewed");
        Ok(())
    }
}

/// Plays one owner's stories, a fixed slide duration each.
#[derive(Debug, Clone)]
pub struct StoryPlayer {
    stories: Vec<StoryRecord>,
    index: usize,
    elapsed: Duration,
    slide: Duration,
    finished: bool,
}

impl StoryPlayer {
    pub fn new(group: StoryGroup) -> Self {
        Self::with_slide(group, Duration::from_millis(STORY_SLIDE_MS))
    }

    pub fn with_slide(group: StoryGroup, slide: Duration) -> Self {
        Self {
            finished: group.stories.is_empty(),
            stories: group.stories,
            index: 0,
            elapsed: Duration::ZERO,
            slide,
        }
    }

    pub fn current(&self) -> Option<&StoryRecord> {
        if self.finished {
            return None;
        }
        self.stories.get(self.index)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Progress of the current slide, `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        (self.elapsed.as_secs_f64() / self.slide.as_secs_f64()).min(1.0)
    }

    /// Let `dt` of playback pass. Returns `true` when the slide changed.
    pub fn advance(&mut self, dt: Duration) -> bool {
        if self.finished {
            return false;
        }
        self.elapsed += dt;
        if self.elapsed < self.slide {
            return false;
        }
        self.next();
        true
    }

    pub fn next(&mut self) {
        self.elapsed = Duration::ZERO;
        if self.index + 1 < self.stories.len() {
            self.index += 1;
        } else {
            self.finished = true;
        }
    }

    pub fn previous(&mut self) {
        self.elapsed = Duration::ZERO;
        self.index = self.index.saturating_sub(1);
    }
}
