//! Ownership of background listeners.
//!
//! Every live listener a view starts is registered with a [`Subscriptions`]
//! set and aborted when the view goes away. Work that completes after
//! teardown checks a [`Liveness`] guard and drops its result.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

/// Shared "is the owner still mounted" flag.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn kill(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Subscriptions {
    handles: Mutex<Vec<JoinHandle<()>>>,
    liveness: Liveness,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Spawn a listener owned by this set. After teardown the future is
    /// dropped without being polled.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.liveness.is_alive() {
            return;
        }
        let handle = tokio::spawn(fut);
        let mut handles = self.handles();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles().iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every listener. Idempotent.
    pub fn teardown(&self) {
        self.liveness.kill();
        for handle in self.handles().drain(..) {
            handle.abort();
        }
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.teardown();
    }
}
