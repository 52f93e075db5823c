//! The signed-in user's context.
//!
//! A [`Session`] owns the backends, the user's live settings and every
//! session-wide listener. Views receive an `Arc<Session>` and start their own
//! listeners in their own [`Subscriptions`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use murmur_shared::protocol::{SettingsPatch, UserProfile, UserSettings};
use murmur_shared::types::UserId;
use murmur_store::{BlobStore, DocumentStore, EphemeralChannel, StoreEvent, WriteOp};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::presence;
use crate::subscription::Subscriptions;

#[derive(Error, Debug)]
pub enum IdentityError {
    /// Sensitive operations need a fresh sign-in.
    #[error("Recent login required")]
    RequiresRecentLogin,

    #[error("Identity provider error: {0}")]
    Provider(String),
}

/// The authentication backend.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Profile of the signed-in user, if any.
    fn current_user(&self) -> Option<UserProfile>;

    /// When the current session token was issued.
    fn issued_at(&self) -> Option<DateTime<Utc>>;

    async fn sign_out(&self) -> std::result::Result<(), IdentityError>;

    /// Delete the identity itself (not the user's documents).
    async fn delete_identity(&self) -> std::result::Result<(), IdentityError>;
}

/// In-process identity provider for tests and the demo binary.
pub struct LocalIdentity {
    user: Mutex<Option<UserProfile>>,
    issued_at: DateTime<Utc>,
    requires_recent_login: AtomicBool,
}

impl LocalIdentity {
    pub fn signed_in(profile: UserProfile) -> Self {
        Self::issued(profile, Utc::now())
    }

    pub fn issued(profile: UserProfile, issued_at: DateTime<Utc>) -> Self {
        Self {
            user: Mutex::new(Some(profile)),
            issued_at,
            requires_recent_login: AtomicBool::new(false),
        }
    }

    /// Make `delete_identity` fail until the user signs in again.
    pub fn set_requires_recent_login(&self, value: bool) {
        self.requires_recent_login.store(value, Ordering::SeqCst);
    }

    pub fn is_signed_in(&self) -> bool {
        self.current_user().is_some()
    }

    fn user(&self) -> std::sync::MutexGuard<'_, Option<UserProfile>> {
        match self.user.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentity {
    fn current_user(&self) -> Option<UserProfile> {
        self.user().clone()
    }

    fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.current_user().map(|_| self.issued_at)
    }

    async fn sign_out(&self) -> std::result::Result<(), IdentityError> {
        self.user().take();
        Ok(())
    }

    async fn delete_identity(&self) -> std::result::Result<(), IdentityError> {
        if self.requires_recent_login.load(Ordering::SeqCst) {
            return Err(IdentityError::RequiresRecentLogin);
        }
        self.user().take();
        Ok(())
    }
}

/// Everything a session talks to.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn DocumentStore>,
    pub channel: Arc<dyn EphemeralChannel>,
    pub blobs: Arc<dyn BlobStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

/// A session ends once the account was logged out everywhere after this
/// session's token was issued.
pub fn must_terminate(settings: &UserSettings, issued_at: DateTime<Utc>) -> bool {
    settings
        .last_logout_at
        .is_some_and(|logout| logout > issued_at)
}

pub struct Session {
    me: UserProfile,
    issued_at: DateTime<Utc>,
    backends: Backends,
    config: ClientConfig,
    settings: watch::Sender<UserSettings>,
    terminated: watch::Sender<bool>,
    unlocked: AtomicBool,
    subs: Subscriptions,
}

impl Session {
    /// Bootstrap the session: make sure the profile and settings documents
    /// exist, then start presence and the settings listener.
    pub async fn init(backends: Backends, config: ClientConfig) -> Result<Arc<Self>> {
        let me = backends
            .identity
            .current_user()
            .ok_or(ClientError::NotSignedIn)?;
        let issued_at = backends.identity.issued_at().unwrap_or_else(Utc::now);

        if backends.store.get_profile(&me.uid).await?.is_none() {
            backends.store.put_profile(&me).await?;
        }

        let settings = match backends.store.get_settings(&me.uid).await? {
            Some(settings) => settings,
            None => {
                let defaults = UserSettings::default();
                backends.store.put_settings(&me.uid, &defaults).await?;
                defaults
            }
        };

        if must_terminate(&settings, issued_at) {
            warn!(uid = %me.uid, "session was logged out on all devices");
            if let Err(e) = backends.identity.sign_out().await {
                warn!(error = %e, "sign-out failed");
            }
            return Err(ClientError::NotSignedIn);
        }

        let session = Arc::new(Self {
            me,
            issued_at,
            backends,
            config,
            settings: watch::channel(settings).0,
            terminated: watch::channel(false).0,
            unlocked: AtomicBool::new(false),
            subs: Subscriptions::new(),
        });

        let events = session.backends.store.subscribe();
        session
            .subs
            .spawn(watch_settings(Arc::downgrade(&session), events));
        presence::spawn_keeper(
            &session.subs,
            session.backends.channel.clone(),
            session.me.uid.clone(),
        );

        info!(uid = %session.me.uid, "session started");
        Ok(session)
    }

    pub fn me(&self) -> &UserProfile {
        &self.me
    }

    pub fn uid(&self) -> &UserId {
        &self.me.uid
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.backends.store
    }

    pub fn channel(&self) -> &Arc<dyn EphemeralChannel> {
        &self.backends.channel
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.backends.blobs
    }

    /// Latest known settings.
    pub fn settings(&self) -> UserSettings {
        self.settings.borrow().clone()
    }

    pub fn watch_settings(&self) -> watch::Receiver<UserSettings> {
        self.settings.subscribe()
    }

    /// Flips to `true` once the session has ended, for whatever reason.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    pub fn is_active(&self) -> bool {
        !*self.terminated.borrow()
    }

    /// Whether the app gate is closed.
    pub fn is_locked(&self) -> bool {
        self.settings.borrow().chat_lock && !self.unlocked.load(Ordering::SeqCst)
    }

    /// Open the app gate with the configured pin.
    pub fn unlock_app(&self, pin: &str) -> bool {
        let matches = {
            let settings = self.settings.borrow();
            settings.chat_lock_pin == pin
        };
        if matches {
            self.unlocked.store(true, Ordering::SeqCst);
        }
        matches
    }

    /// Merge a partial update into the settings document.
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<()> {
        self.backends
            .store
            .commit(
                WriteOp::UpdateSettings {
                    uid: self.me.uid.clone(),
                    patch,
                }
                .into(),
            )
            .await?;
        self.reload_settings().await
    }

    pub async fn logout(&self) -> Result<()> {
        self.end("logout").await;
        self.backends
            .identity
            .sign_out()
            .await
            .map_err(|e| ClientError::Permission(e.to_string()))
    }

    /// End every session of this account, this one included.
    pub async fn logout_all_devices(&self) -> Result<()> {
        self.update_settings(SettingsPatch {
            stamp_logout: true,
            ..Default::default()
        })
        .await?;
        self.logout().await
    }

    /// Delete the user's documents, then the identity.
    pub async fn delete_account(&self) -> Result<()> {
        self.backends.store.delete_user(&self.me.uid).await?;
        if let Err(e) = self.backends.identity.delete_identity().await {
            warn!(uid = %self.me.uid, error = %e, "identity deletion refused");
            return Err(ClientError::Permission(e.to_string()));
        }
        self.end("account deleted").await;
        Ok(())
    }

    /// Stop every session listener and mark the user offline.
    pub async fn teardown(&self) {
        self.end("teardown").await;
    }

    async fn end(&self, reason: &str) {
        if *self.terminated.borrow() {
            return;
        }
        if let Err(e) = presence::go_offline(self.backends.channel.as_ref(), &self.me.uid).await {
            debug!(error = %e, "could not write offline status");
        }
        self.unlocked.store(false, Ordering::SeqCst);
        self.terminated.send_replace(true);
        self.subs.teardown();
        info!(uid = %self.me.uid, reason, "session ended");
    }

    async fn reload_settings(&self) -> Result<()> {
        let Some(settings) = self.backends.store.get_settings(&self.me.uid).await? else {
            return Ok(());
        };
        let revoked = must_terminate(&settings, self.issued_at);
        self.settings.send_replace(settings);

        if revoked && self.is_active() {
            warn!(uid = %self.me.uid, "logged out from another device");
            if let Err(e) = self.backends.identity.sign_out().await {
                warn!(error = %e, "sign-out failed");
            }
            self.end("logged out everywhere").await;
        }
        Ok(())
    }
}

async fn watch_settings(
    session: Weak<Session>,
    mut events: tokio::sync::broadcast::Receiver<StoreEvent>,
) {
    loop {
        let reload = match events.recv().await {
            Ok(StoreEvent::SettingsChanged(_)) | Err(RecvError::Lagged(_)) => true,
            Ok(_) => false,
            Err(RecvError::Closed) => return,
        };
        if !reload {
            continue;
        }
        let Some(session) = session.upgrade() else {
            return;
        };
        if let Err(e) = session.reload_settings().await {
            warn!(error = %e, "failed to refresh settings");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Duration;
    use murmur_store::{MemoryBlobStore, MemoryChannelHub, MemoryStore};

    use super::*;

    pub(crate) fn profile(uid: &str) -> UserProfile {
        UserProfile {
            uid: UserId::from(uid),
            display_name: uid.to_uppercase(),
            username: Some(uid.to_string()),
            ..Default::default()
        }
    }

    pub(crate) struct World {
        pub store: Arc<MemoryStore>,
        pub hub: MemoryChannelHub,
        pub blobs: Arc<MemoryBlobStore>,
    }

    impl World {
        pub fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                hub: MemoryChannelHub::new(),
                blobs: Arc::new(MemoryBlobStore::new(1024 * 1024)),
            }
        }

        pub fn backends(&self, identity: Arc<LocalIdentity>) -> Backends {
            Backends {
                store: self.store.clone(),
                channel: Arc::new(self.hub.connect()),
                blobs: self.blobs.clone(),
                identity,
            }
        }

        pub async fn sign_in(&self, uid: &str) -> (Arc<Session>, Arc<LocalIdentity>) {
            let identity = Arc::new(LocalIdentity::signed_in(profile(uid)));
            let session = Session::init(self.backends(identity.clone()), ClientConfig::default())
                .await
                .unwrap();
            (session, identity)
        }
    }

    #[tokio::test]
    async fn init_bootstraps_documents() {
        let world = World::new();
        let (session, _) = world.sign_in("alice").await;

        let uid = UserId::from("alice");
        assert_eq!(world.store.get_settings(&uid).await.unwrap(), Some(UserSettings::default()));
        assert!(world.store.get_profile(&uid).await.unwrap().is_some());
        assert_eq!(session.settings(), UserSettings::default());
        assert!(!session.is_locked());
    }

    #[tokio::test]
    async fn init_requires_identity() {
        let world = World::new();
        let identity = Arc::new(LocalIdentity::signed_in(profile("alice")));
        identity.sign_out().await.unwrap();
        let result = Session::init(world.backends(identity), ClientConfig::default()).await;
        assert!(matches!(result, Err(ClientError::NotSignedIn)));
    }

    #[tokio::test]
    async fn pin_gate() {
        let world = World::new();
        let (session, _) = world.sign_in("alice").await;
        session
            .update_settings(SettingsPatch {
                chat_lock: Some(true),
                chat_lock_pin: Some("2468".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(session.is_locked());
        assert!(!session.unlock_app("1111"));
        assert!(session.is_locked());
        assert!(session.unlock_app("2468"));
        assert!(!session.is_locked());

        session.teardown().await;
        assert!(session.is_locked());
    }

    #[tokio::test]
    async fn logout_all_devices_ends_older_sessions() {
        let world = World::new();
        let old_identity = Arc::new(LocalIdentity::issued(
            profile("alice"),
            Utc::now() - Duration::hours(1),
        ));
        let old = Session::init(world.backends(old_identity.clone()), ClientConfig::default())
            .await
            .unwrap();
        let mut old_terminated = old.terminated();

        let (current, current_identity) = world.sign_in("alice").await;
        current.logout_all_devices().await.unwrap();
        assert!(!current_identity.is_signed_in());

        old_terminated.wait_for(|ended| *ended).await.unwrap();
        assert!(!old_identity.is_signed_in());

        // A session issued after the stamp is fine.
        let fresh = Arc::new(LocalIdentity::issued(
            profile("alice"),
            Utc::now() + Duration::seconds(1),
        ));
        assert!(Session::init(world.backends(fresh), ClientConfig::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn stale_session_is_refused_at_init() {
        let world = World::new();
        let (session, _) = world.sign_in("alice").await;
        session.logout_all_devices().await.unwrap();

        let stale = Arc::new(LocalIdentity::issued(
            profile("alice"),
            Utc::now() - Duration::days(1),
        ));
        let result = Session::init(world.backends(stale.clone()), ClientConfig::default()).await;
        assert!(matches!(result, Err(ClientError::NotSignedIn)));
        assert!(!stale.is_signed_in());
    }

    #[tokio::test]
    async fn delete_account_maps_refusal_to_permission() {
        let world = World::new();
        let (session, identity) = world.sign_in("alice").await;
        identity.set_requires_recent_login(true);

        let err = session.delete_account().await.unwrap_err();
        assert!(matches!(err, ClientError::Permission(_)));
        assert!(identity.is_signed_in());

        identity.set_requires_recent_login(false);
        session.delete_account().await.unwrap();
        assert!(!identity.is_signed_in());
        assert!(!session.is_active());
        assert!(world
            .store
            .get_profile(&UserId::from("alice"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn logout_writes_offline() {
        let world = World::new();
        let (session, _) = world.sign_in("alice").await;
        let observer = world.hub.connect();
        let mut status = observer.watch("status/alice");
        status
            .wait_for(|v| v.as_ref().is_some_and(|v| v["state"] == "online"))
            .await
            .unwrap();

        session.logout().await.unwrap();
        assert_eq!(world.hub.value("status/alice").unwrap()["state"], "offline");
        assert!(!session.is_active());
    }
}
