//! # murmur-store
//!
//! The collaborators the messaging core talks to, behind traits:
//!
//! - [`DocumentStore`]: durable documents (messages, chats, settings,
//!   stories, profiles) with atomic batched writes and a change feed.
//! - [`EphemeralChannel`]: low-latency key-value paths for presence and
//!   typing, with "set on disconnect" rules.
//! - [`BlobStore`]: media uploads that report progress.
//!
//! In-memory implementations back tests and the demo binary; [`SqliteStore`]
//! persists documents locally with `rusqlite`.

pub mod blobs;
pub mod chats;
pub mod clock;
pub mod database;
pub mod document;
pub mod ephemeral;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod settings;
pub mod stories;

mod error;

pub use blobs::{BlobStore, DiskBlobStore, MemoryBlobStore};
pub use database::SqliteStore;
pub use document::{ChatDraft, DocumentStore, StoreEvent, WriteBatch, WriteOp};
pub use ephemeral::{server_timestamp, EphemeralChannel, MemoryChannel, MemoryChannelHub};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
