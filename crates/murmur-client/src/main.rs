//! # murmur
//!
//! Command-line demo of the messaging core. Two local users open a
//! conversation, exchange a plain and an encrypted message, and the recipient
//! reveals the secret.
//!
//! Documents go to SQLite (`MURMUR_DB_PATH` or the platform data directory)
//! unless `--memory` is given.

use std::sync::Arc;

use anyhow::Context;
use directories::ProjectDirs;
use tracing::info;

use murmur_client::assistant::{CannedAssistant, ChatAssistant};
use murmur_client::session::{Backends, LocalIdentity};
use murmur_client::{init_tracing, ChatDirectory, ChatView, ClientConfig, Session};
use murmur_shared::protocol::UserProfile;
use murmur_shared::types::UserId;
use murmur_store::{
    BlobStore, DiskBlobStore, DocumentStore, MemoryBlobStore, MemoryChannelHub, MemoryStore,
    SqliteStore,
};

fn user(uid: &str, name: &str) -> UserProfile {
    UserProfile {
        uid: UserId::from(uid),
        display_name: name.to_string(),
        email: format!("{uid}@murmur.local"),
        username: Some(uid.to_string()),
        ..Default::default()
    }
}

async fn open_backends(
    config: &ClientConfig,
    in_memory: bool,
) -> anyhow::Result<(Arc<dyn DocumentStore>, Arc<dyn BlobStore>)> {
    if in_memory {
        return Ok((
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBlobStore::new(config.max_upload_bytes)),
        ));
    }

    let store = match &config.db_path {
        Some(path) => SqliteStore::open_at(path),
        None => SqliteStore::open_default(),
    }
    .context("failed to open document store")?;

    let blob_dir = match &config.db_path {
        Some(path) => path.with_extension("blobs"),
        None => ProjectDirs::from("com", "murmur", "murmur")
            .context("no data directory on this platform")?
            .data_dir()
            .join("blobs"),
    };
    let blobs = DiskBlobStore::new(blob_dir, config.max_upload_bytes)
        .await
        .context("failed to open blob store")?;
    Ok((Arc::new(store), Arc::new(blobs)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ClientConfig::from_env();
    let in_memory = std::env::args().any(|arg| arg == "--memory");
    info!(?config, in_memory, "starting murmur v{}", env!("CARGO_PKG_VERSION"));

    let (store, blobs) = open_backends(&config, in_memory).await?;
    let hub = MemoryChannelHub::new();
    let backends = |profile: UserProfile| Backends {
        store: store.clone(),
        channel: Arc::new(hub.connect()),
        blobs: blobs.clone(),
        identity: Arc::new(LocalIdentity::signed_in(profile)),
    };

    let alice = Session::init(backends(user("alice", "Alice")), config.clone()).await?;
    let bob_profile = user("bob", "Bob");
    let bob = Session::init(backends(bob_profile.clone()), config.clone()).await?;

    let directory = ChatDirectory::open(alice.clone()).await?;
    let chat = directory.start_chat(&bob_profile).await?;
    let alice_view = ChatView::open(alice.clone(), &chat).await?;
    let bob_view = ChatView::open(bob.clone(), &chat).await?;

    let mut bob_events = bob_view.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = bob_events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                println!("bob <- {json}");
            }
        }
    });

    alice_view.input("hi").await;
    alice_view.send().await?;

    alice_view.input("secret").await;
    alice_view.set_encrypt(true).await;
    alice_view.set_self_destruct(60).await;
    let secret = alice_view
        .send()
        .await?
        .context("encrypted message was not sent")?;
    let key = alice_view
        .take_key()
        .await
        .context("no key for the encrypted message")?;
    println!("share this key with bob: {}", key.as_str());

    bob_view.reveal(&secret, key.as_str())?;
    if let Some(bubble) = bob_view.secret(&secret) {
        let reveal = bubble.snapshot();
        println!(
            "bob reads {:?}, gone in {}s",
            reveal.plaintext().unwrap_or_default(),
            reveal.remaining().unwrap_or_default()
        );
    }

    let assistant = ChatAssistant::new(Arc::new(CannedAssistant::new()));
    let context = bob_view.assistant_context().await?;
    match assistant.summarize(&context).await {
        Ok(summary) => println!("bob's summary:\n{summary}"),
        Err(e) => println!("assistant: {}", e.user_message()),
    }

    for row in directory.list_chats().await? {
        println!("{} | {} | unread {}", row.peer_name, row.preview, row.unread);
    }

    alice_view.close().await;
    bob_view.close().await;
    directory.close();
    alice.teardown().await;
    bob.teardown().await;
    Ok(())
}
