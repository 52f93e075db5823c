//! The conversation list and user search.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, error, info};

use murmur_shared::protocol::{ChatRecord, UserProfile};
use murmur_shared::types::{ChatId, UserId};
use murmur_store::{ChatDraft, StoreEvent};

use crate::error::Result;
use crate::presence::PresenceBoard;
use crate::session::Session;
use crate::subscription::Subscriptions;

/// Maximum number of profiles a user search returns.
pub const SEARCH_LIMIT: usize = 10;

/// One row of the conversation list, seen from the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub peer: UserId,
    pub peer_name: String,
    pub peer_photo: String,
    pub preview: String,
    pub last_time: DateTime<Utc>,
    pub unread: u64,
}

impl ChatSummary {
    pub fn from_record(record: &ChatRecord, me: &UserId) -> Option<Self> {
        let peer = record.peer_of(me)?.clone();
        let details = record.member_details.get(&peer).cloned().unwrap_or_default();
        Some(Self {
            chat_id: record.id.clone(),
            peer_name: details.display_name,
            peer_photo: details.photo_url,
            preview: record.last_message.clone(),
            last_time: record.last_time,
            unread: record.unread_for(me),
            peer,
        })
    }
}

/// Case-insensitive match on the peer's name. A blank query keeps everything.
pub fn filter_by_name(chats: &[ChatSummary], query: &str) -> Vec<ChatSummary> {
    let needle = query.trim().to_lowercase();
    chats
        .iter()
        .filter(|chat| needle.is_empty() || chat.peer_name.to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

/// Live list of the local user's conversations.
pub struct ChatDirectory {
    session: Arc<Session>,
    chats: watch::Sender<Vec<ChatSummary>>,
    presence: PresenceBoard,
    subs: Subscriptions,
}

impl ChatDirectory {
    /// Load the list and keep it in sync with the store.
    pub async fn open(session: Arc<Session>) -> Result<Arc<Self>> {
        let directory = Arc::new(Self {
            presence: PresenceBoard::new(session.channel().clone()),
            chats: watch::channel(Vec::new()).0,
            subs: Subscriptions::new(),
            session,
        });

        let events = directory.session.store().subscribe();
        directory.refresh().await?;
        directory
            .subs
            .spawn(listen(Arc::downgrade(&directory), events));
        Ok(directory)
    }

    /// Current conversations, most recent first.
    pub fn chats(&self) -> Vec<ChatSummary> {
        self.chats.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatSummary>> {
        self.chats.subscribe()
    }

    pub fn presence(&self) -> &PresenceBoard {
        &self.presence
    }

    pub fn filter(&self, query: &str) -> Vec<ChatSummary> {
        filter_by_name(&self.chats.borrow(), query)
    }

    /// Query the store directly, bypassing the live list.
    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        let me = self.session.uid();
        let records = self.session.store().chats_for_member(me).await?;
        Ok(records
            .iter()
            .filter_map(|record| ChatSummary::from_record(record, me))
            .collect())
    }

    /// Open the conversation with `peer`, creating it on first contact.
    pub async fn start_chat(&self, peer: &UserProfile) -> Result<ChatRecord> {
        let me = self.session.me();
        let store = self.session.store();

        let existing = store
            .chats_for_member(&me.uid)
            .await?
            .into_iter()
            .find(|chat| chat.is_between(&me.uid, &peer.uid));
        if let Some(chat) = existing {
            debug!(chat = %chat.id, "reusing existing chat");
            return Ok(chat);
        }

        let chat = store.create_chat(ChatDraft::between(me, peer)).await?;
        info!(chat = %chat.id, peer = %peer.uid, "chat created");
        Ok(chat)
    }

    /// Profiles whose username starts with `query`, without the local user.
    pub async fn search_users(&self, query: &str) -> Result<Vec<UserProfile>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let me = self.session.uid();
        let mut found = self
            .session
            .store()
            .search_profiles(query, SEARCH_LIMIT + 1)
            .await?;
        found.retain(|profile| &profile.uid != me);
        found.truncate(SEARCH_LIMIT);
        Ok(found)
    }

    pub fn close(&self) {
        self.subs.teardown();
    }

    async fn refresh(&self) -> Result<()> {
        let chats = self.list_chats().await?;
        for chat in &chats {
            self.presence.track(&self.subs, &chat.peer);
        }
        self.chats.send_replace(chats);
        Ok(())
    }
}

async fn listen(directory: Weak<ChatDirectory>, mut events: broadcast::Receiver<StoreEvent>) {
    loop {
        let relevant = match events.recv().await {
            Ok(StoreEvent::ChatChanged { members, .. }) => {
                let Some(directory) = directory.upgrade() else {
                    return;
                };
                members.contains(directory.session.uid())
            }
            Ok(_) => false,
            Err(RecvError::Lagged(_)) => true,
            Err(RecvError::Closed) => return,
        };
        if !relevant {
            continue;
        }
        let Some(directory) = directory.upgrade() else {
            return;
        };
        if let Err(e) = directory.refresh().await {
            error!(error = %e, "failed to refresh chat list");
        }
    }
}
