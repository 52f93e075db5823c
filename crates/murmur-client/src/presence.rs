//! Presence and typing over the ephemeral channel.
//!
//! Each user writes only their own keys: `status/{uid}` and
//! `chats/{chatId}/typing/{uid}`. Going offline on a lost connection is left
//! entirely to the server-side disconnect rule.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use murmur_shared::protocol::{PresenceRecord, PresenceState};
use murmur_shared::types::{ChatId, UserId};
use murmur_store::{server_timestamp, EphemeralChannel};

use crate::error::Result;
use crate::subscription::{Liveness, Subscriptions};

pub fn status_path(uid: &UserId) -> String {
    format!("status/{uid}")
}

pub fn typing_path(chat_id: &ChatId, uid: &UserId) -> String {
    format!("chats/{chat_id}/typing/{uid}")
}

fn status_value(state: PresenceState) -> Value {
    json!({ "state": state, "last_changed": server_timestamp() })
}

/// Register the offline-on-disconnect rule, then announce online. The order
/// matters: a connection lost in between must still end up offline.
pub async fn announce_online(channel: &dyn EphemeralChannel, uid: &UserId) -> Result<()> {
    let path = status_path(uid);
    channel
        .on_disconnect_set(&path, status_value(PresenceState::Offline))
        .await?;
    channel.set(&path, status_value(PresenceState::Online)).await?;
    debug!(uid = %uid, "online");
    Ok(())
}

pub async fn go_offline(channel: &dyn EphemeralChannel, uid: &UserId) -> Result<()> {
    channel
        .set(&status_path(uid), status_value(PresenceState::Offline))
        .await?;
    Ok(())
}

/// Re-announce presence every time the channel (re)connects.
pub fn spawn_keeper(subs: &Subscriptions, channel: Arc<dyn EphemeralChannel>, uid: UserId) {
    let mut connected = channel.connected();
    subs.spawn(async move {
        loop {
            let is_connected = *connected.borrow_and_update();
            if is_connected {
                if let Err(e) = announce_online(channel.as_ref(), &uid).await {
                    warn!(uid = %uid, error = %e, "failed to announce presence");
                }
            }
            if connected.changed().await.is_err() {
                return;
            }
        }
    });
}

pub fn decode_presence(value: Option<&Value>) -> Option<PresenceRecord> {
    serde_json::from_value(value?.clone()).ok()
}

/// "Just now", "5m ago", "3h ago", or the date for anything older.
pub fn relative_last_seen(last_changed_ms: i64, now: DateTime<Utc>) -> String {
    let diff = now.timestamp_millis() - last_changed_ms;
    if diff < 60_000 {
        "Just now".to_string()
    } else if diff < 3_600_000 {
        format!("{}m ago", diff / 60_000)
    } else if diff < 86_400_000 {
        format!("{}h ago", diff / 3_600_000)
    } else {
        match Utc.timestamp_millis_opt(last_changed_ms).single() {
            Some(at) => at.format("%b %-d, %Y").to_string(),
            None => "a long time ago".to_string(),
        }
    }
}

/// What the local user knows about the other member of a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerState {
    pub presence: Option<PresenceRecord>,
    pub typing: bool,
    /// The peer asked not to reveal when they were last online.
    pub hides_last_seen: bool,
}

impl PeerState {
    /// Header line under the peer's name. `None` shows nothing.
    pub fn label(&self, now: DateTime<Utc>) -> Option<String> {
        if self.typing {
            return Some("Typing...".to_string());
        }
        let presence = self.presence.as_ref()?;
        if presence.is_online() {
            return Some("Online".to_string());
        }
        if self.hides_last_seen {
            return None;
        }
        Some(format!(
            "Last seen {}",
            relative_last_seen(presence.last_changed, now)
        ))
    }
}

/// Follow the peer's status and typing flag in one conversation.
pub fn watch_peer(
    subs: &Subscriptions,
    channel: &dyn EphemeralChannel,
    chat_id: &ChatId,
    peer: &UserId,
    hides_last_seen: bool,
) -> watch::Receiver<PeerState> {
    let (tx, rx) = watch::channel(PeerState {
        hides_last_seen,
        ..Default::default()
    });
    let tx = Arc::new(tx);

    let mut status = channel.watch(&status_path(peer));
    let status_tx = tx.clone();
    subs.spawn(async move {
        loop {
            let presence = decode_presence(status.borrow_and_update().as_ref());
            status_tx.send_modify(|state| state.presence = presence);
            if status.changed().await.is_err() {
                return;
            }
        }
    });

    let mut typing = channel.watch(&typing_path(chat_id, peer));
    subs.spawn(async move {
        loop {
            let is_typing = *typing.borrow_and_update() == Some(Value::Bool(true));
            tx.send_modify(|state| state.typing = is_typing);
            if typing.changed().await.is_err() {
                return;
            }
        }
    });

    rx
}

/// Writes the local user's typing flag for one conversation.
pub struct TypingNotifier {
    channel: Arc<dyn EphemeralChannel>,
    path: String,
    idle: Duration,
    pending_reset: Mutex<Option<JoinHandle<()>>>,
    liveness: Liveness,
}

impl TypingNotifier {
    pub fn new(
        channel: Arc<dyn EphemeralChannel>,
        chat_id: &ChatId,
        me: &UserId,
        idle: Duration,
        liveness: Liveness,
    ) -> Self {
        Self {
            channel,
            path: typing_path(chat_id, me),
            idle,
            pending_reset: Mutex::new(None),
            liveness,
        }
    }

    /// Set the flag now and clear it after `idle` without another
    /// keystroke. Does nothing while the peer is blocked.
    pub async fn keystroke(&self, blocked: bool) -> Result<()> {
        if blocked || !self.liveness.is_alive() {
            return Ok(());
        }
        self.channel.set(&self.path, json!(true)).await?;

        let channel = self.channel.clone();
        let path = self.path.clone();
        let idle = self.idle;
        let liveness = self.liveness.clone();
        let reset = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if !liveness.is_alive() {
                return;
            }
            if let Err(e) = channel.set(&path, json!(false)).await {
                debug!(error = %e, "typing reset failed");
            }
        });
        if let Some(previous) = self.pending().replace(reset) {
            previous.abort();
        }
        Ok(())
    }

    /// Clear the flag immediately (send or teardown).
    pub async fn stop(&self) -> Result<()> {
        if let Some(pending) = self.pending().take() {
            pending.abort();
        }
        self.channel.set(&self.path, json!(false)).await?;
        Ok(())
    }

    fn pending(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.pending_reset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        if let Some(pending) = self.pending().take() {
            pending.abort();
        }
    }
}

/// Online state of every conversation partner, for the chat list.
pub struct PresenceBoard {
    channel: Arc<dyn EphemeralChannel>,
    online: Arc<watch::Sender<BTreeMap<UserId, bool>>>,
    tracked: Mutex<HashSet<UserId>>,
}

impl PresenceBoard {
    pub fn new(channel: Arc<dyn EphemeralChannel>) -> Self {
        Self {
            channel,
            online: Arc::new(watch::channel(BTreeMap::new()).0),
            tracked: Mutex::new(HashSet::new()),
        }
    }

    /// Start following `uid`, once.
    pub fn track(&self, subs: &Subscriptions, uid: &UserId) {
        {
            let mut tracked = match self.tracked.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !tracked.insert(uid.clone()) {
                return;
            }
        }

        let mut status = self.channel.watch(&status_path(uid));
        let online = self.online.clone();
        let uid = uid.clone();
        subs.spawn(async move {
            loop {
                let is_online = decode_presence(status.borrow_and_update().as_ref())
                    .is_some_and(|p| p.is_online());
                online.send_modify(|map| {
                    map.insert(uid.clone(), is_online);
                });
                if status.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    pub fn is_online(&self, uid: &UserId) -> bool {
        self.online.borrow().get(uid).copied().unwrap_or(false)
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<UserId, bool>> {
        self.online.subscribe()
    }
}
