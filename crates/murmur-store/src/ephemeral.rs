//! The ephemeral key-value channel used for presence and typing.
//!
//! Values live at slash-separated paths such as `status/{uid}` or
//! `chats/{chatId}/typing/{uid}`. A client may register writes that the
//! server performs on its behalf when the client's connection drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::debug;

use crate::clock::ServerClock;
use crate::error::{Result, StoreError};

const SERVER_VALUE_KEY: &str = ".sv";

/// Placeholder replaced by the server's clock (epoch millis) when written.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: "timestamp" })
}

fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.len() == 1 && o.get(SERVER_VALUE_KEY) == Some(&json!("timestamp")))
}

/// Replace every server-timestamp placeholder in `value` with `now_millis`.
fn resolve(value: Value, now_millis: i64) -> Value {
    if is_server_timestamp(&value) {
        return json!(now_millis);
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve(v, now_millis)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| resolve(v, now_millis)).collect())
        }
        other => other,
    }
}

#[async_trait]
pub trait EphemeralChannel: Send + Sync {
    /// Overwrite the value at `path`. `Value::Null` clears it.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Have the server write `value` at `path` once this connection drops.
    /// Rules fire once; re-register after reconnecting.
    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<()>;

    /// Current and future values at `path`. `None` means absent.
    fn watch(&self, path: &str) -> watch::Receiver<Option<Value>>;

    /// Whether this client is connected to the server.
    fn connected(&self) -> watch::Receiver<bool>;
}

struct Hub {
    paths: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
    clock: ServerClock,
}

impl Hub {
    fn paths(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<Option<Value>>>> {
        match self.paths.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self, path: &str, value: Value) {
        let value = resolve(value, self.clock.now_millis());
        let value = (!value.is_null()).then_some(value);
        let mut paths = self.paths();
        let sender = paths
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(None).0);
        sender.send_replace(value);
    }

    fn subscribe(&self, path: &str) -> watch::Receiver<Option<Value>> {
        self.paths()
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }
}

/// The shared server side. Every [`MemoryChannel`] created from the same hub
/// sees the same values, like several clients of one backend.
#[derive(Clone)]
pub struct MemoryChannelHub {
    inner: Arc<Hub>,
}

impl MemoryChannelHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Hub {
                paths: Mutex::new(HashMap::new()),
                clock: ServerClock::new(),
            }),
        }
    }

    /// Open a new client connection.
    pub fn connect(&self) -> MemoryChannel {
        MemoryChannel {
            hub: self.inner.clone(),
            connected: watch::channel(true).0,
            on_disconnect: Mutex::new(Vec::new()),
        }
    }

    /// Current value at `path`.
    pub fn value(&self, path: &str) -> Option<Value> {
        self.inner
            .paths()
            .get(path)
            .and_then(|sender| sender.borrow().clone())
    }
}

impl Default for MemoryChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's connection to a [`MemoryChannelHub`].
pub struct MemoryChannel {
    hub: Arc<Hub>,
    connected: watch::Sender<bool>,
    on_disconnect: Mutex<Vec<(String, Value)>>,
}

impl MemoryChannel {
    fn rules(&self) -> MutexGuard<'_, Vec<(String, Value)>> {
        match self.on_disconnect.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if !*self.connected.borrow() {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    /// Simulate losing the connection. The server runs every registered
    /// disconnect rule.
    pub fn drop_connection(&self) {
        if !*self.connected.borrow() {
            return;
        }
        let rules = std::mem::take(&mut *self.rules());
        debug!(rules = rules.len(), "connection dropped, applying disconnect rules");
        for (path, value) in rules {
            self.hub.write(&path, value);
        }
        self.connected.send_replace(false);
    }

    pub fn reconnect(&self) {
        self.connected.send_replace(true);
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

#[async_trait]
impl EphemeralChannel for MemoryChannel {
    async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.ensure_connected()?;
        self.hub.write(path, value);
        Ok(())
    }

    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<()> {
        self.ensure_connected()?;
        self.rules().push((path.to_string(), value));
        Ok(())
    }

    fn watch(&self, path: &str) -> watch::Receiver<Option<Value>> {
        self.hub.subscribe(path)
    }

    fn connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_resolved_at_any_depth() {
        let value = json!({
            "state": "offline",
            "last_changed": server_timestamp(),
            "nested": [server_timestamp(), {"keep": ".sv"}],
        });
        let resolved = resolve(value, 42);
        assert_eq!(resolved["last_changed"], 42);
        assert_eq!(resolved["nested"][0], 42);
        assert_eq!(resolved["nested"][1]["keep"], ".sv");
    }

    #[tokio::test]
    async fn peers_see_each_others_writes() {
        let hub = MemoryChannelHub::new();
        let alice = hub.connect();
        let bob = hub.connect();

        let mut rx = bob.watch("chats/c1/typing/alice");
        assert_eq!(*rx.borrow(), None);

        alice.set("chats/c1/typing/alice", json!(true)).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Some(json!(true)));

        alice.set("chats/c1/typing/alice", Value::Null).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), None);
    }

    #[tokio::test]
    async fn disconnect_rules_fire_once() {
        let hub = MemoryChannelHub::new();
        let alice = hub.connect();
        alice
            .on_disconnect_set(
                "status/alice",
                json!({"state": "offline", "last_changed": server_timestamp()}),
            )
            .await
            .unwrap();
        alice
            .set("status/alice", json!({"state": "online", "last_changed": server_timestamp()}))
            .await
            .unwrap();
        assert_eq!(hub.value("status/alice").unwrap()["state"], "online");

        alice.drop_connection();
        let status = hub.value("status/alice").unwrap();
        assert_eq!(status["state"], "offline");
        assert!(status["last_changed"].is_i64());
        assert!(!*alice.connected().borrow());

        assert!(matches!(
            alice.set("status/alice", json!(1)).await,
            Err(StoreError::Unavailable)
        ));

        alice.reconnect();
        alice.set("status/alice", json!({"state": "online"})).await.unwrap();
        alice.drop_connection();
        // Rule was consumed by the first disconnect.
        assert_eq!(hub.value("status/alice").unwrap()["state"], "online");
    }

    #[tokio::test]
    async fn dropping_the_client_counts_as_disconnect() {
        let hub = MemoryChannelHub::new();
        {
            let client = hub.connect();
            client
                .on_disconnect_set("chats/c/typing/u", json!(false))
                .await
                .unwrap();
            client.set("chats/c/typing/u", json!(true)).await.unwrap();
        }
        assert_eq!(hub.value("chats/c/typing/u"), Some(json!(false)));
    }
}
