//! Local blocking.
//!
//! A block lives only in the blocker's settings document. The blocked user
//! is never told and can keep sending.

use tracing::info;

use murmur_shared::protocol::{SettingsPatch, UserSettings};
use murmur_shared::types::UserId;

use crate::error::Result;
use crate::session::Session;

pub const UNBLOCK_NOTICE: &str = "You blocked this user. Unblock to send messages.";

pub fn is_blocked(settings: &UserSettings, peer: &UserId) -> bool {
    settings.has_blocked(peer)
}

/// What the composer area shows for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerState {
    Open,
    /// Input is replaced by the unblock affordance.
    Blocked,
}

impl ComposerState {
    pub fn for_peer(settings: &UserSettings, peer: &UserId) -> Self {
        if is_blocked(settings, peer) {
            ComposerState::Blocked
        } else {
            ComposerState::Open
        }
    }

    pub fn notice(&self) -> Option<&'static str> {
        match self {
            ComposerState::Open => None,
            ComposerState::Blocked => Some(UNBLOCK_NOTICE),
        }
    }
}

impl Session {
    pub fn is_blocked(&self, peer: &UserId) -> bool {
        is_blocked(&self.settings(), peer)
    }

    pub fn composer_state(&self, peer: &UserId) -> ComposerState {
        ComposerState::for_peer(&self.settings(), peer)
    }

    /// Block or unblock `peer`. Returns whether the peer is now blocked.
    pub async fn toggle_block(&self, peer: &UserId) -> Result<bool> {
        let mut blocked = self.settings().blocked_users;
        let now_blocked = match blocked.iter().position(|uid| uid == peer) {
            Some(index) => {
                blocked.remove(index);
                false
            }
            None => {
                blocked.push(peer.clone());
                true
            }
        };

        self.update_settings(SettingsPatch {
            blocked_users: Some(blocked),
            ..Default::default()
        })
        .await?;
        info!(peer = %peer, blocked = now_blocked, "block toggled");
        Ok(now_blocked)
    }
}

#[cfg(test)]
mod tests {
    use crate::session::tests::World;

    use super::*;

    #[tokio::test]
    async fn toggle_is_local_to_the_blocker() {
        let world = World::new();
        let (alice, _) = world.sign_in("alice").await;
        let (bob, _) = world.sign_in("bob").await;
        let bob_id = UserId::from("bob");
        let alice_id = UserId::from("alice");

        assert_eq!(alice.composer_state(&bob_id), ComposerState::Open);
        assert!(alice.toggle_block(&bob_id).await.unwrap());
        assert!(alice.is_blocked(&bob_id));
        assert_eq!(
            alice.composer_state(&bob_id).notice(),
            Some(UNBLOCK_NOTICE)
        );
        assert!(!bob.is_blocked(&alice_id));

        assert!(!alice.toggle_block(&bob_id).await.unwrap());
        assert!(!alice.is_blocked(&bob_id));
        assert_eq!(alice.composer_state(&bob_id).notice(), None);
    }
}
