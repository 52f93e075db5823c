//! Media uploads.
//!
//! Uploads are written in chunks and report a completion percentage after
//! each one. The progress receiver may go away at any time (the view that
//! started the upload was closed); the upload carries on regardless.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// Bytes written between two progress reports.
pub const UPLOAD_CHUNK: usize = 64 * 1024;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `path` and return a URL the other member can fetch.
    /// Progress is reported as a percentage in `0.0..=100.0`.
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
        progress: Option<mpsc::UnboundedSender<f64>>,
    ) -> Result<String>;
}

fn report(progress: &Option<mpsc::UnboundedSender<f64>>, done: usize, total: usize) {
    if let Some(tx) = progress {
        let pct = if total == 0 {
            100.0
        } else {
            done as f64 * 100.0 / total as f64
        };
        // Receiver dropped: nobody is watching any more.
        let _ = tx.send(pct);
    }
}

fn check_size(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(StoreError::BlobTooLarge { size, max });
    }
    Ok(())
}

/// Resolve a slash-separated blob path below `base`, rejecting anything that
/// would escape it.
fn ensure_within(base: &Path, path: &str) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::CurDir => {}
            _ => {
                return Err(StoreError::Blob(format!(
                    "path traversal detected: {path}"
                )))
            }
        }
    }
    if resolved == base {
        return Err(StoreError::Blob("empty blob path".to_string()));
    }
    Ok(resolved)
}

/// Blob store writing under a local directory. URLs are `file://` URLs.
#[derive(Debug, Clone)]
pub struct DiskBlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl DiskBlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self> {
        fs::create_dir_all(&base_path).await?;
        let base_path = base_path.canonicalize()?;

        info!(path = %base_path.display(), "blob store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let target = ensure_within(&self.base_path, path)?;
        if !target.exists() {
            return Err(StoreError::NotFound(format!("blob {path}")));
        }
        Ok(fs::read(&target).await?)
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
        progress: Option<mpsc::UnboundedSender<f64>>,
    ) -> Result<String> {
        check_size(data.len(), self.max_size)?;
        let target = ensure_within(&self.base_path, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&target).await?;
        let total = data.len();
        let mut written = 0;
        report(&progress, 0, total);
        for chunk in data.chunks(UPLOAD_CHUNK) {
            file.write_all(chunk).await?;
            written += chunk.len();
            report(&progress, written, total);
        }
        file.flush().await?;

        debug!(path, size = total, content_type, "blob stored");
        Ok(format!("file://{}", target.display()))
    }
}

struct StoredBlob {
    data: Bytes,
    content_type: String,
}

/// In-process blob store for tests and the demo binary.
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    max_size: usize,
    failing: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            max_size,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every upload fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, path: &str) -> Option<(Bytes, String)> {
        self.lock()
            .get(path)
            .map(|b| (b.data.clone(), b.content_type.clone()))
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredBlob>> {
        match self.blobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
        progress: Option<mpsc::UnboundedSender<f64>>,
    ) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        check_size(data.len(), self.max_size)?;

        let total = data.len();
        let mut sent = 0;
        report(&progress, 0, total);
        for chunk in data.chunks(UPLOAD_CHUNK) {
            sent += chunk.len();
            report(&progress, sent, total);
            tokio::task::yield_now().await;
        }

        self.lock().insert(
            path.to_string(),
            StoredBlob {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("memory://{path}"))
    }
}
