//! Growing live window over a conversation's newest messages.
//!
//! The store is asked for the `limit` newest messages (descending); the
//! window keeps them in chronological order. `limit` only ever grows, by one
//! page at a time, and every snapshot replaces the whole window.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error};

use murmur_shared::protocol::MessageRecord;
use murmur_shared::types::{ChatId, MessageId};
use murmur_store::{DocumentStore, StoreEvent};

use crate::subscription::Subscriptions;

/// What a snapshot did to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// Scroll to the bottom: the newest message changed. Never set for a
    /// back-fill that only prepended older messages.
    pub follow_bottom: bool,
}

#[derive(Debug, Clone)]
pub struct PageCursor {
    step: usize,
    limit: usize,
    window: Vec<MessageRecord>,
    loading_more: bool,
    /// Limit the pending load-more grows to. `loading_more` stays set until a
    /// snapshot at this limit arrives.
    target: Option<usize>,
    received_first: bool,
    newest: Option<MessageId>,
}

impl PageCursor {
    pub fn new(step: usize) -> Self {
        let step = step.max(1);
        Self {
            step,
            limit: step,
            window: Vec::new(),
            loading_more: false,
            target: None,
            received_first: false,
            newest: None,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Messages in chronological order (oldest first).
    pub fn messages(&self) -> &[MessageRecord] {
        &self.window
    }

    /// True until the first snapshot arrives.
    pub fn is_loading(&self) -> bool {
        !self.received_first
    }

    pub fn is_loading_more(&self) -> bool {
        self.loading_more
    }

    /// Replace the window with a store result in descending order, queried
    /// with `limit`. Live updates at the old limit leave a pending load-more
    /// in flight.
    pub fn apply_snapshot(
        &mut self,
        limit: usize,
        mut newest_first: Vec<MessageRecord>,
    ) -> SnapshotOutcome {
        let newest = newest_first.first().map(|m| m.id.clone());
        newest_first.reverse();
        self.window = newest_first;
        self.received_first = true;
        if self.reached_target(limit) {
            self.target = None;
            self.loading_more = false;
        }

        let follow_bottom = newest.is_some() && newest != self.newest;
        self.newest = newest;
        SnapshotOutcome { follow_bottom }
    }

    pub fn can_load_more(&self) -> bool {
        self.received_first && !self.loading_more && self.window.len() >= self.limit
    }

    /// Accept a load-more request. Returns `false` when it is rejected.
    pub fn begin_load_more(&mut self) -> bool {
        if !self.can_load_more() {
            return false;
        }
        self.loading_more = true;
        self.target = Some(self.limit + self.step);
        true
    }

    /// Grow the limit by one page. Called after the debounce.
    pub fn commit_load_more(&mut self) -> usize {
        if let Some(target) = self.target {
            self.limit = target;
        }
        self.limit
    }

    /// A query at `limit` failed. When it was the load-more query, drop the
    /// request and shrink back to the previous page count. Returns the limit
    /// to query with when it changed.
    pub fn fail_snapshot(&mut self, limit: usize) -> Option<usize> {
        let target = self.target.filter(|target| limit >= *target)?;
        self.target = None;
        self.loading_more = false;
        if self.limit == target {
            self.limit -= self.step;
        }
        Some(self.limit)
    }

    fn reached_target(&self, limit: usize) -> bool {
        self.target.map_or(true, |target| limit >= target)
    }

    /// Back to a single page, e.g. when the view switches conversation.
    pub fn reset(&mut self) {
        *self = Self::new(self.step);
    }
}

/// Published state of a [`LiveWindow`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowView {
    pub messages: Vec<MessageRecord>,
    pub loading: bool,
    pub loading_more: bool,
    pub limit: usize,
    pub follow_bottom: bool,
    /// Bumped on every snapshot, so identical windows still notify.
    pub revision: u64,
}

/// A [`PageCursor`] kept in sync with the store's change feed.
pub struct LiveWindow {
    chat_id: ChatId,
    cursor: Mutex<PageCursor>,
    limit_tx: watch::Sender<usize>,
    view_tx: watch::Sender<WindowView>,
    debounce: Duration,
}

impl LiveWindow {
    /// Start listening. The listener lives in `subs` and stops on teardown.
    pub fn spawn(
        subs: &Subscriptions,
        store: Arc<dyn DocumentStore>,
        chat_id: ChatId,
        page_size: usize,
        debounce: Duration,
    ) -> Arc<Self> {
        let cursor = PageCursor::new(page_size);
        let (limit_tx, limit_rx) = watch::channel(cursor.limit());
        let (view_tx, _) = watch::channel(WindowView {
            loading: true,
            limit: cursor.limit(),
            ..Default::default()
        });

        let window = Arc::new(Self {
            chat_id,
            cursor: Mutex::new(cursor),
            limit_tx,
            view_tx,
            debounce,
        });

        let events = store.subscribe();
        subs.spawn(window.clone().listen(store, events, limit_rx));
        window
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn subscribe(&self) -> watch::Receiver<WindowView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> WindowView {
        self.view_tx.borrow().clone()
    }

    pub fn limit(&self) -> usize {
        self.cursor().limit()
    }

    /// Ask for one more page. Rejected while a request is in flight or when
    /// the window is not full. The limit grows after the debounce.
    pub fn request_load_more(self: &Arc<Self>, subs: &Subscriptions) -> bool {
        let accepted = {
            let mut cursor = self.cursor();
            let accepted = cursor.begin_load_more();
            if accepted {
                self.publish(&cursor, false);
            }
            accepted
        };
        if !accepted {
            return false;
        }

        let window = self.clone();
        subs.spawn(async move {
            tokio::time::sleep(window.debounce).await;
            let limit = window.cursor().commit_load_more();
            debug!(chat = %window.chat_id, limit, "loading older messages");
            window.limit_tx.send_replace(limit);
        });
        true
    }

    async fn listen(
        self: Arc<Self>,
        store: Arc<dyn DocumentStore>,
        mut events: tokio::sync::broadcast::Receiver<StoreEvent>,
        mut limit_rx: watch::Receiver<usize>,
    ) {
        loop {
            let limit = *limit_rx.borrow_and_update();
            match store.recent_messages(&self.chat_id, limit).await {
                Ok(newest_first) => {
                    let mut cursor = self.cursor();
                    let outcome = cursor.apply_snapshot(limit, newest_first);
                    self.publish(&cursor, outcome.follow_bottom);
                }
                Err(e) => {
                    error!(chat = %self.chat_id, limit, error = %e, "failed to load messages");
                    let mut cursor = self.cursor();
                    if let Some(previous) = cursor.fail_snapshot(limit) {
                        self.publish(&cursor, false);
                        self.limit_tx.send_replace(previous);
                    }
                }
            }

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(StoreEvent::MessagesChanged(chat_id)) if chat_id == self.chat_id => break,
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => return,
                    },
                    changed = limit_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    fn publish(&self, cursor: &PageCursor, follow_bottom: bool) {
        self.view_tx.send_modify(|view| {
            view.messages = cursor.messages().to_vec();
            view.loading = cursor.is_loading();
            view.loading_more = cursor.is_loading_more();
            view.limit = cursor.limit();
            view.follow_bottom = follow_bottom;
            view.revision += 1;
        });
    }

    fn cursor(&self) -> MutexGuard<'_, PageCursor> {
        match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use murmur_shared::protocol::{MessageBody, MessageDraft, UserProfile};
    use murmur_shared::types::UserId;
    use murmur_store::{ChatDraft, MemoryStore};

    use super::*;

    fn records(n: usize) -> Vec<MessageRecord> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                MessageRecord::from_draft(
                    MessageId::from(format!("m{i:02}")),
                    base + ChronoDuration::seconds(i as i64),
                    MessageDraft {
                        chat_id: ChatId::from("c"),
                        sender_id: UserId::from("a"),
                        body: MessageBody::Text(i.to_string()),
                    },
                )
            })
            .collect()
    }

    /// What the store would return for `limit` over `all` (oldest first).
    fn query(all: &[MessageRecord], limit: usize) -> Vec<MessageRecord> {
        all.iter().rev().take(limit).cloned().collect()
    }

    fn load(cursor: &mut PageCursor, all: &[MessageRecord]) -> SnapshotOutcome {
        let limit = cursor.limit();
        cursor.apply_snapshot(limit, query(all, limit))
    }

    #[test]
    fn forty_five_messages_three_pages() {
        let all = records(45);
        let mut cursor = PageCursor::new(20);
        assert!(cursor.is_loading());

        load(&mut cursor, &all);
        assert_eq!(cursor.messages(), &all[25..]);

        assert!(cursor.begin_load_more());
        assert_eq!(cursor.commit_load_more(), 40);
        let outcome = load(&mut cursor, &all);
        assert_eq!(cursor.messages(), &all[5..]);
        assert!(!outcome.follow_bottom);

        assert!(cursor.begin_load_more());
        assert_eq!(cursor.commit_load_more(), 60);
        load(&mut cursor, &all);
        assert_eq!(cursor.messages(), &all[..]);

        // Window smaller than the limit: the history is exhausted.
        assert!(!cursor.begin_load_more());
    }

    #[test]
    fn load_more_rejected_while_in_flight() {
        let all = records(30);
        let mut cursor = PageCursor::new(20);
        assert!(!cursor.begin_load_more());

        cursor.apply_snapshot(20, query(&all, 20));
        assert!(cursor.begin_load_more());
        assert!(!cursor.begin_load_more());
    }

    #[test]
    fn live_update_during_debounce_keeps_request_pending() {
        let all = records(100);
        let mut cursor = PageCursor::new(20);
        cursor.apply_snapshot(20, query(&all[..99], 20));
        assert!(cursor.begin_load_more());

        // A new message arrives before the debounce fires.
        cursor.apply_snapshot(20, query(&all, 20));
        assert!(cursor.is_loading_more());
        assert!(!cursor.begin_load_more());

        assert_eq!(cursor.commit_load_more(), 40);
        cursor.apply_snapshot(40, query(&all, 40));
        assert!(!cursor.is_loading_more());
        assert_eq!(cursor.limit(), 40);
        assert_eq!(cursor.messages().len(), 40);
    }

    #[test]
    fn failed_load_more_rolls_back_the_limit() {
        let all = records(30);
        let mut cursor = PageCursor::new(20);
        assert_eq!(cursor.fail_snapshot(20), None);

        cursor.apply_snapshot(20, query(&all, 20));
        assert!(cursor.begin_load_more());
        // A failed refresh at the old limit leaves the request alone.
        assert_eq!(cursor.fail_snapshot(20), None);
        assert!(cursor.is_loading_more());

        assert_eq!(cursor.commit_load_more(), 40);
        assert_eq!(cursor.fail_snapshot(40), Some(20));
        assert_eq!(cursor.limit(), 20);
        assert!(!cursor.is_loading_more());
        assert!(cursor.begin_load_more());
    }

    #[test]
    fn follow_bottom_only_for_new_messages() {
        let all = records(3);
        let mut cursor = PageCursor::new(20);
        assert!(cursor.apply_snapshot(20, query(&all[..2], 20)).follow_bottom);
        assert!(!cursor.apply_snapshot(20, query(&all[..2], 20)).follow_bottom);
        assert!(cursor.apply_snapshot(20, query(&all, 20)).follow_bottom);
    }

    #[test]
    fn reset_returns_to_first_page() {
        let mut cursor = PageCursor::new(20);
        cursor.apply_snapshot(20, query(&records(25), 20));
        cursor.begin_load_more();
        cursor.commit_load_more();
        cursor.reset();
        assert_eq!(cursor.limit(), 20);
        assert!(cursor.is_loading());
        assert!(cursor.messages().is_empty());
    }

    async fn wait_for(rx: &mut watch::Receiver<WindowView>, pred: impl Fn(&WindowView) -> bool) {
        loop {
            if pred(&rx.borrow_and_update()) {
                return;
            }
            rx.changed().await.unwrap();
        }
    }

    fn member(uid: &str) -> UserProfile {
        UserProfile {
            uid: UserId::from(uid),
            ..Default::default()
        }
    }

    async fn seeded(n: usize) -> (Arc<MemoryStore>, ChatId) {
        let store = Arc::new(MemoryStore::new());
        let chat = store
            .create_chat(ChatDraft::between(&member("a"), &member("b")))
            .await
            .unwrap();
        for i in 0..n {
            say(&store, &chat.id, "a", &i.to_string()).await;
        }
        (store, chat.id)
    }

    async fn say(store: &MemoryStore, chat_id: &ChatId, from: &str, text: &str) {
        store
            .add_message(MessageDraft {
                chat_id: chat_id.clone(),
                sender_id: UserId::from(from),
                body: MessageBody::Text(text.into()),
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn live_window_follows_store_and_grows() {
        let (store, chat_id) = seeded(25).await;

        let subs = Subscriptions::new();
        let window = LiveWindow::spawn(
            &subs,
            store.clone(),
            chat_id.clone(),
            20,
            Duration::from_millis(500),
        );
        let mut rx = window.subscribe();
        wait_for(&mut rx, |v| !v.loading).await;
        let view = window.view();
        assert_eq!(view.messages.len(), 20);
        assert_eq!(view.messages.last().unwrap().text, "24");
        assert!(view.follow_bottom);

        assert!(window.request_load_more(&subs));
        assert!(!window.request_load_more(&subs));
        assert_eq!(window.limit(), 20);

        wait_for(&mut rx, |v| v.limit == 40 && !v.loading_more).await;
        let view = window.view();
        assert_eq!(view.messages.len(), 25);
        assert_eq!(view.messages.first().unwrap().text, "0");
        assert!(!view.follow_bottom);

        say(&store, &chat_id, "b", "new").await;
        wait_for(&mut rx, |v| v.messages.len() == 26).await;
        assert!(window.view().follow_bottom);

        subs.teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn live_message_during_debounce_does_not_double_the_page() {
        let (store, chat_id) = seeded(100).await;
        let subs = Subscriptions::new();
        let window = LiveWindow::spawn(
            &subs,
            store.clone(),
            chat_id.clone(),
            20,
            Duration::from_millis(500),
        );
        let mut rx = window.subscribe();
        wait_for(&mut rx, |v| !v.loading).await;

        assert!(window.request_load_more(&subs));
        say(&store, &chat_id, "b", "live").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(window.view().loading_more);
        assert!(!window.request_load_more(&subs));

        wait_for(&mut rx, |v| v.limit == 40 && !v.loading_more).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let view = window.view();
        assert_eq!(view.limit, 40);
        assert_eq!(view.messages.len(), 40);
        assert_eq!(view.messages.last().unwrap().text, "live");

        subs.teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_query_clears_loading_more() {
        let (store, chat_id) = seeded(25).await;
        let subs = Subscriptions::new();
        let window = LiveWindow::spawn(
            &subs,
            store.clone(),
            chat_id.clone(),
            20,
            Duration::from_millis(500),
        );
        let mut rx = window.subscribe();
        wait_for(&mut rx, |v| !v.loading).await;

        assert!(window.request_load_more(&subs));
        store.set_offline(true);
        wait_for(&mut rx, |v| !v.loading_more).await;
        assert_eq!(window.view().limit, 20);
        assert_eq!(window.limit(), 20);
        assert_eq!(window.view().messages.len(), 20);

        store.set_offline(false);
        assert!(window.request_load_more(&subs));
        wait_for(&mut rx, |v| v.limit == 40 && !v.loading_more).await;
        assert_eq!(window.view().messages.len(), 25);

        subs.teardown();
    }
}
