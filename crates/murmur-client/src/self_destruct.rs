//! Local reveal and expiry of encrypted messages.
//!
//! Expiry is view-only: the ciphertext stays in the store, only the decrypted
//! text held by this display instance is dropped.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use murmur_shared::crypto;
use murmur_shared::protocol::{MessageBody, MessageRecord};

use crate::error::{ClientError, Result};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealState {
    Locked,
    Decrypted {
        plaintext: String,
        /// Seconds left, `None` when the message has no timer.
        remaining: Option<u32>,
    },
    Expired,
}

/// `5s`, `1m`, `1h`.
pub fn countdown_label(secs: u32) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}

/// The synchronous state machine behind one encrypted bubble.
#[derive(Debug, Clone)]
pub struct SecretReveal {
    ciphertext: String,
    self_destruct: u32,
    state: RevealState,
    error: Option<String>,
}

impl SecretReveal {
    pub fn new(ciphertext: impl Into<String>, self_destruct: u32) -> Self {
        Self {
            ciphertext: ciphertext.into(),
            self_destruct,
            state: RevealState::Locked,
            error: None,
        }
    }

    /// `None` for anything but an encrypted message.
    pub fn from_record(record: &MessageRecord) -> Option<Self> {
        match record.body() {
            MessageBody::Encrypted {
                ciphertext,
                self_destruct,
            } => Some(Self::new(ciphertext, self_destruct)),
            _ => None,
        }
    }

    pub fn state(&self) -> &RevealState {
        &self.state
    }

    /// Inline error from the last key attempt.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn plaintext(&self) -> Option<&str> {
        match &self.state {
            RevealState::Decrypted { plaintext, .. } => Some(plaintext),
            _ => None,
        }
    }

    pub fn remaining(&self) -> Option<u32> {
        match &self.state {
            RevealState::Decrypted { remaining, .. } => *remaining,
            _ => None,
        }
    }

    /// Fraction of the countdown still left, `1.0` right after reveal.
    pub fn progress(&self) -> Option<f64> {
        let remaining = self.remaining()?;
        Some(f64::from(remaining) / f64::from(self.self_destruct))
    }

    /// Badge shown on the locked bubble, e.g. `1m`.
    pub fn timer_label(&self) -> Option<String> {
        (self.self_destruct > 0).then(|| countdown_label(self.self_destruct))
    }

    pub fn has_timer(&self) -> bool {
        self.self_destruct > 0
    }

    /// Try a key. Returns `Ok(false)` when the input is blank and was ignored.
    /// A wrong key leaves the state as it was.
    pub fn submit_key(&mut self, key: &str) -> Result<bool> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(false);
        }

        match crypto::decrypt(&self.ciphertext, key) {
            Some(plaintext) => {
                self.state = RevealState::Decrypted {
                    plaintext,
                    remaining: self.has_timer().then_some(self.self_destruct),
                };
                self.error = None;
                Ok(true)
            }
            None => {
                let err = ClientError::CryptoMismatch;
                self.error = Some(err.user_message());
                Err(err)
            }
        }
    }

    /// Advance the countdown by one second. Returns `true` when the state
    /// changed.
    pub fn tick(&mut self) -> bool {
        let RevealState::Decrypted {
            remaining: Some(left),
            ..
        } = &mut self.state
        else {
            return false;
        };

        *left = left.saturating_sub(1);
        if *left == 0 {
            self.state = RevealState::Expired;
        }
        true
    }
}

/// A [`SecretReveal`] with its own 1-second countdown task.
///
/// Revealing again replaces the running countdown instead of adding a second
/// one. Dropping the value stops the countdown.
pub struct SecretMessage {
    reveal: Arc<Mutex<SecretReveal>>,
    updates: Arc<watch::Sender<RevealState>>,
    countdown: Mutex<Option<JoinHandle<()>>>,
}

impl SecretMessage {
    pub fn new(reveal: SecretReveal) -> Self {
        let (updates, _) = watch::channel(reveal.state().clone());
        Self {
            reveal: Arc::new(Mutex::new(reveal)),
            updates: Arc::new(updates),
            countdown: Mutex::new(None),
        }
    }

    pub fn from_record(record: &MessageRecord) -> Option<Self> {
        SecretReveal::from_record(record).map(Self::new)
    }

    pub fn subscribe(&self) -> watch::Receiver<RevealState> {
        self.updates.subscribe()
    }

    pub fn state(&self) -> RevealState {
        lock(&self.reveal).state().clone()
    }

    pub fn snapshot(&self) -> SecretReveal {
        lock(&self.reveal).clone()
    }

    /// Submit a key typed by the recipient.
    pub fn reveal(&self, key: &str) -> Result<()> {
        let (revealed, has_timer, state) = {
            let mut reveal = lock(&self.reveal);
            let revealed = reveal.submit_key(key)?;
            (revealed, reveal.has_timer(), reveal.state().clone())
        };
        if !revealed {
            return Ok(());
        }

        self.updates.send_replace(state);
        if has_timer {
            self.start_countdown();
        }
        Ok(())
    }

    fn start_countdown(&self) {
        let reveal = self.reveal.clone();
        let updates = self.updates.clone();

        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + TICK, TICK);
            loop {
                ticks.tick().await;
                let state = {
                    let mut reveal = lock(&reveal);
                    reveal.tick();
                    reveal.state().clone()
                };
                let expired = state == RevealState::Expired;
                updates.send_replace(state);
                if expired {
                    tracing::debug!("encrypted message expired");
                    break;
                }
            }
        });

        let mut slot = match self.countdown.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        let mut slot = match self.countdown.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

impl Drop for SecretMessage {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(reveal: &Mutex<SecretReveal>) -> MutexGuard<'_, SecretReveal> {
    match reveal.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
