//! Voice clips: capture, duration counter and sending.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use murmur_shared::protocol::MessageRecord;

use crate::dispatch::Dispatcher;
use crate::error::{ClientError, Result};

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Audio stream error: {0}")]
    StreamError(String),
}

impl From<AudioError> for ClientError {
    fn from(e: AudioError) -> Self {
        ClientError::DeviceCapability(e.to_string())
    }
}

/// A microphone that can be opened for recording.
#[async_trait]
pub trait AudioDevice: Send + Sync {
    async fn open(&self) -> std::result::Result<Box<dyn AudioStream>, AudioError>;
}

/// An open capture stream. Both methods release the device.
pub trait AudioStream: Send {
    /// Stop capturing and return the encoded clip.
    fn finish(&mut self) -> Bytes;

    /// Stop capturing and throw the audio away.
    fn discard(&mut self);
}

/// `m:ss`.
pub fn duration_label(secs: u32) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

struct ActiveRecording {
    stream: Box<dyn AudioStream>,
    ticker: JoinHandle<()>,
}

/// Records one voice clip at a time for a conversation.
pub struct VoiceRecorder {
    dispatcher: Dispatcher,
    device: Arc<dyn AudioDevice>,
    active: Mutex<Option<ActiveRecording>>,
    seconds: Arc<watch::Sender<u32>>,
}

impl VoiceRecorder {
    pub fn new(dispatcher: Dispatcher, device: Arc<dyn AudioDevice>) -> Self {
        Self {
            dispatcher,
            device,
            active: Mutex::new(None),
            seconds: Arc::new(watch::channel(0).0),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active().is_some()
    }

    pub fn seconds(&self) -> u32 {
        *self.seconds.borrow()
    }

    pub fn label(&self) -> String {
        duration_label(self.seconds())
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.seconds.subscribe()
    }

    /// Open the microphone and start counting. Returns `Ok(false)` when the
    /// peer is blocked or a recording is already running.
    pub async fn start(&self) -> Result<bool> {
        if self.dispatcher.peer_blocked() || self.is_recording() {
            return Ok(false);
        }

        let mut stream = self.device.open().await.map_err(|e| {
            warn!(error = %e, "microphone unavailable");
            ClientError::from(e)
        })?;

        let mut active = self.active();
        if active.is_some() {
            stream.discard();
            return Ok(false);
        }

        self.seconds.send_replace(0);
        let seconds = self.seconds.clone();
        let ticker = tokio::spawn(async move {
            let tick = Duration::from_secs(1);
            let mut ticks = interval_at(Instant::now() + tick, tick);
            loop {
                ticks.tick().await;
                seconds.send_modify(|s| *s += 1);
            }
        });
        *active = Some(ActiveRecording { stream, ticker });
        debug!(chat = %self.dispatcher.chat_id(), "recording started");
        Ok(true)
    }

    /// Stop and send the clip. `Ok(None)` when nothing was recording.
    pub async fn stop(&self) -> Result<Option<MessageRecord>> {
        let Some(mut recording) = self.take() else {
            return Ok(None);
        };
        let clip = recording.stream.finish();
        info!(
            chat = %self.dispatcher.chat_id(),
            secs = self.seconds(),
            bytes = clip.len(),
            "recording finished"
        );
        self.seconds.send_replace(0);
        self.dispatcher.send_voice(clip).await
    }

    /// Stop and drop the clip.
    pub fn cancel(&self) {
        if let Some(mut recording) = self.take() {
            recording.stream.discard();
            self.seconds.send_replace(0);
            debug!(chat = %self.dispatcher.chat_id(), "recording cancelled");
        }
    }

    fn take(&self) -> Option<ActiveRecording> {
        let recording = self.active().take()?;
        recording.ticker.abort();
        Some(recording)
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRecording>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for VoiceRecorder {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A microphone that "records" a fixed clip. Used by tests and the demo
/// binary.
#[derive(Clone)]
pub struct CannedMicrophone {
    clip: Bytes,
    available: Arc<AtomicBool>,
    open_streams: Arc<AtomicUsize>,
}

impl CannedMicrophone {
    pub fn new(clip: impl Into<Bytes>) -> Self {
        Self {
            clip: clip.into(),
            available: Arc::new(AtomicBool::new(true)),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Streams opened and not yet released.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioDevice for CannedMicrophone {
    async fn open(&self) -> std::result::Result<Box<dyn AudioStream>, AudioError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AudioError::PermissionDenied);
        }
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CannedStream {
            clip: self.clip.clone(),
            open_streams: self.open_streams.clone(),
            released: false,
        }))
    }
}

struct CannedStream {
    clip: Bytes,
    open_streams: Arc<AtomicUsize>,
    released: bool,
}

impl CannedStream {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.open_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl AudioStream for CannedStream {
    fn finish(&mut self) -> Bytes {
        self.release();
        self.clip.clone()
    }

    fn discard(&mut self) {
        self.release();
    }
}

impl Drop for CannedStream {
    fn drop(&mut self) {
        self.release();
    }
}
