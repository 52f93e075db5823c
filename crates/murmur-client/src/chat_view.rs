//! One open conversation.
//!
//! A [`ChatView`] owns everything the conversation screen needs while it is
//! mounted: the live message window, read receipts, the peer's presence and
//! typing flag, the composer and the encrypted bubbles revealed so far.
//! [`ChatView::close`] (or dropping it) stops all of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use murmur_shared::protocol::{ChatRecord, MessageRecord};
use murmur_shared::types::{ChatId, MessageId, UserId};
use murmur_store::{DocumentStore, StoreError, StoreEvent};

use crate::access::ComposerState;
use crate::assistant;
use crate::dispatch::{Composer, Dispatcher, MediaUpload};
use crate::error::{ClientError, Result};
use crate::events::{EventSink, ViewEvent};
use crate::pagination::{LiveWindow, WindowView};
use crate::presence::{self, PeerState, TypingNotifier};
use crate::receipts::ReadTracker;
use crate::recording::{AudioDevice, VoiceRecorder};
use crate::self_destruct::SecretMessage;
use crate::session::Session;
use crate::subscription::Subscriptions;

pub struct ChatView {
    session: Arc<Session>,
    chat_id: ChatId,
    peer: UserId,
    subs: Subscriptions,
    window: Arc<LiveWindow>,
    peer_state: watch::Receiver<PeerState>,
    typing: TypingNotifier,
    dispatcher: Dispatcher,
    composer: tokio::sync::Mutex<Composer>,
    secrets: Mutex<HashMap<MessageId, Arc<SecretMessage>>>,
    events: EventSink,
}

impl ChatView {
    /// Mount the view for `chat`.
    pub async fn open(session: Arc<Session>, chat: &ChatRecord) -> Result<Arc<Self>> {
        let me = session.uid().clone();
        let peer = chat
            .peer_of(&me)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat {} for {me}", chat.id)))?;
        let store = session.store().clone();
        let channel = session.channel().clone();
        let config = session.config().clone();

        let hides_last_seen = store
            .get_settings(&peer)
            .await?
            .is_some_and(|settings| settings.hide_last_seen);

        let subs = Subscriptions::new();
        let window = LiveWindow::spawn(
            &subs,
            store.clone(),
            chat.id.clone(),
            config.page_size,
            config.load_more_debounce,
        );
        let peer_state =
            presence::watch_peer(&subs, channel.as_ref(), &chat.id, &peer, hides_last_seen);
        let typing = TypingNotifier::new(
            channel,
            &chat.id,
            &me,
            config.typing_idle,
            subs.liveness(),
        );
        let dispatcher = Dispatcher::new(
            session.clone(),
            chat.id.clone(),
            peer.clone(),
            subs.liveness(),
        );

        let view = Arc::new(Self {
            session,
            chat_id: chat.id.clone(),
            peer,
            window,
            peer_state,
            typing,
            dispatcher,
            composer: tokio::sync::Mutex::new(Composer::new()),
            secrets: Mutex::new(HashMap::new()),
            events: EventSink::new(),
            subs,
        });

        view.subs.spawn(track_reads(
            view.session.clone(),
            view.window.subscribe(),
            view.chat_id.clone(),
            view.events.clone(),
        ));
        view.subs.spawn(report_peer(
            view.peer_state.clone(),
            view.chat_id.clone(),
            view.events.clone(),
        ));

        info!(chat = %view.chat_id, peer = %view.peer, "chat opened");
        Ok(view)
    }

    /// Close this view and open `chat` instead. Nothing carries over.
    pub async fn switch_to(self: Arc<Self>, chat: &ChatRecord) -> Result<Arc<Self>> {
        self.close().await;
        Self::open(self.session.clone(), chat).await
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn window(&self) -> WindowView {
        self.window.view()
    }

    pub fn subscribe_window(&self) -> watch::Receiver<WindowView> {
        self.window.subscribe()
    }

    pub fn load_more(&self) -> bool {
        self.window.request_load_more(&self.subs)
    }

    /// The loaded window rendered for the chat assistant.
    pub async fn assistant_context(&self) -> Result<String> {
        let chat = self
            .session
            .store()
            .get_chat(&self.chat_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", self.chat_id)))?;
        Ok(assistant::build_context(
            &self.window().messages,
            &chat,
            self.session.uid(),
        ))
    }

    pub fn peer_state(&self) -> PeerState {
        self.peer_state.borrow().clone()
    }

    pub fn peer_label(&self) -> Option<String> {
        self.peer_state.borrow().label(Utc::now())
    }

    pub fn composer_state(&self) -> ComposerState {
        self.session.composer_state(&self.peer)
    }

    /// The user typed: keep the draft and refresh the typing flag.
    pub async fn input(&self, text: &str) {
        self.composer.lock().await.set_draft(text);
        let blocked = self.session.is_blocked(&self.peer);
        if let Err(e) = self.typing.keystroke(blocked).await {
            debug!(chat = %self.chat_id, error = %e, "typing flag not written");
        }
    }

    pub async fn draft(&self) -> String {
        self.composer.lock().await.draft().to_string()
    }

    pub async fn set_encrypt(&self, on: bool) {
        self.composer.lock().await.set_encrypt(on);
    }

    pub async fn set_self_destruct(&self, secs: u32) -> bool {
        self.composer.lock().await.set_self_destruct(secs)
    }

    /// Key of the last encrypted message, handed out once.
    pub async fn take_key(&self) -> Option<String> {
        self.composer.lock().await.take_key()
    }

    pub async fn dismiss_key(&self) {
        self.composer.lock().await.dismiss_key();
    }

    pub async fn send(&self) -> Result<Option<MessageRecord>> {
        self.stop_typing().await;
        let mut composer = self.composer.lock().await;
        let sent = self.dispatcher.send(&mut composer).await;
        self.report_failure(sent)
    }

    pub async fn send_media(
        &self,
        upload: MediaUpload,
        progress: Option<mpsc::UnboundedSender<f64>>,
    ) -> Result<Option<MessageRecord>> {
        self.stop_typing().await;
        let mut composer = self.composer.lock().await;
        let sent = self.dispatcher.send_media(&mut composer, upload, progress).await;
        self.report_failure(sent)
    }

    pub async fn send_voice(&self, clip: Bytes) -> Result<Option<MessageRecord>> {
        let sent = self.dispatcher.send_voice(clip).await;
        self.report_failure(sent)
    }

    pub fn recorder(&self, device: Arc<dyn AudioDevice>) -> VoiceRecorder {
        VoiceRecorder::new(self.dispatcher.clone(), device)
    }

    /// The display state of an encrypted message in this view, created on
    /// first access. `None` for any other kind of message.
    pub fn secret(&self, message: &MessageRecord) -> Option<Arc<SecretMessage>> {
        let mut secrets = self.secrets();
        if let Some(secret) = secrets.get(&message.id) {
            return Some(secret.clone());
        }
        let secret = Arc::new(SecretMessage::from_record(message)?);
        secrets.insert(message.id.clone(), secret.clone());
        Some(secret)
    }

    /// Try `key` on an encrypted message of this view.
    pub fn reveal(&self, message: &MessageRecord, key: &str) -> Result<()> {
        match self.secret(message) {
            Some(secret) => secret.reveal(key),
            None => Err(ClientError::CryptoMismatch),
        }
    }

    /// Unmount: clear the typing flag, stop every listener and countdown.
    pub async fn close(&self) {
        if !self.subs.is_alive() {
            return;
        }
        self.stop_typing().await;
        self.subs.teardown();
        for secret in self.secrets().drain().map(|(_, secret)| secret) {
            secret.stop();
        }
        debug!(chat = %self.chat_id, "chat closed");
    }

    async fn stop_typing(&self) {
        if let Err(e) = self.typing.stop().await {
            debug!(chat = %self.chat_id, error = %e, "typing flag not cleared");
        }
    }

    fn report_failure(&self, sent: Result<Option<MessageRecord>>) -> Result<Option<MessageRecord>> {
        if let Err(e) = &sent {
            self.events.emit(ViewEvent::SendFailed {
                chat_id: self.chat_id.to_string(),
                message: e.user_message(),
            });
        }
        sent
    }

    fn secrets(&self) -> MutexGuard<'_, HashMap<MessageId, Arc<SecretMessage>>> {
        match self.secrets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ChatView {
    fn drop(&mut self) {
        for secret in self.secrets().values() {
            secret.stop();
        }
    }
}

/// Mark incoming messages seen and clear the local unread counter whenever
/// the window or the conversation summary changes. The summary can be bumped
/// after the message itself shows up.
async fn track_reads(
    session: Arc<Session>,
    mut window: watch::Receiver<WindowView>,
    chat_id: ChatId,
    events: EventSink,
) {
    let store = session.store().clone();
    let mut feed = store.subscribe();
    let mut tracker = ReadTracker::new(session.uid().clone(), chat_id.clone());
    let mut window_changed = true;

    loop {
        let view = window.borrow_and_update().clone();
        if !view.loading {
            if window_changed {
                events.emit(ViewEvent::MessagesChanged {
                    chat_id: chat_id.to_string(),
                    count: view.messages.len(),
                    follow_bottom: view.follow_bottom,
                });
            }
            mark_read(store.as_ref(), &session, &chat_id, &mut tracker, &view).await;
        }

        window_changed = loop {
            tokio::select! {
                changed = window.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break true;
                }
                event = feed.recv() => match event {
                    Ok(StoreEvent::ChatChanged { chat_id: touched, .. }) if touched == chat_id => {
                        break false;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => break false,
                    Err(RecvError::Closed) => return,
                },
            }
        };
    }
}

async fn mark_read(
    store: &dyn DocumentStore,
    session: &Session,
    chat_id: &ChatId,
    tracker: &mut ReadTracker,
    view: &WindowView,
) {
    let my_unread = match store.get_chat(chat_id).await {
        Ok(Some(chat)) => chat.unread_for(session.uid()),
        Ok(None) => 0,
        Err(e) => {
            warn!(chat = %chat_id, error = %e, "could not read unread counter");
            return;
        }
    };
    let receipts_enabled = !session.settings().disable_read_receipts;

    let batch = tracker.plan(&view.messages, my_unread, receipts_enabled);
    if batch.is_empty() {
        return;
    }
    if let Err(e) = store.commit(batch.clone()).await {
        error!(chat = %chat_id, error = %e, "failed to mark messages read");
        tracker.rollback(&batch);
    }
}

async fn report_peer(mut peer: watch::Receiver<PeerState>, chat_id: ChatId, events: EventSink) {
    loop {
        let label = peer.borrow_and_update().label(Utc::now());
        events.emit(ViewEvent::PeerStatus {
            chat_id: chat_id.to_string(),
            label,
        });
        if peer.changed().await.is_err() {
            return;
        }
    }
}
