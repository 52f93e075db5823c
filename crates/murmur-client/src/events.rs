use serde::Serialize;
use tokio::sync::broadcast;

pub const EVENT_CAPACITY: usize = 64;

/// Notifications a conversation view pushes to whatever renders it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ViewEvent {
    #[serde(rename_all = "camelCase")]
    MessagesChanged {
        chat_id: String,
        count: usize,
        follow_bottom: bool,
    },
    #[serde(rename_all = "camelCase")]
    PeerStatus {
        chat_id: String,
        label: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SendFailed { chat_id: String, message: String },
}

#[derive(Debug, Clone)]
pub struct EventSink(broadcast::Sender<ViewEvent>);

impl EventSink {
    pub fn new() -> Self {
        Self(broadcast::channel(EVENT_CAPACITY).0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.0.subscribe()
    }

    pub fn emit(&self, event: ViewEvent) {
        if self.0.send(event).is_err() {
            tracing::trace!("no view listening");
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
