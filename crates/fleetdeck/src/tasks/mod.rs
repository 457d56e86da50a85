//! Background task dispatch.
//!
//! Long external operations (rebuilds, topology transitions, resets) run on
//! detached tokio tasks so the request path returns immediately. There is no
//! queue durability: a process restart drops in-flight work, which is
//! acceptable because the underlying engine commands are idempotent or
//! inspectable afterwards. Failures are logged and never propagated across
//! the dispatch boundary.
//!
//! Operations targeting the same instance are serialized through a per-name
//! lock table, so a `recreate` and a `reset` issued back-to-back no longer
//! race at the engine level.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Dispatches fire-and-forget background work.
#[derive(Clone, Default)]
pub struct Dispatcher {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `work` on a detached task. Returns immediately; the caller must
    /// wrap any deadline-sensitive state changes (flags) inside `work`
    /// itself, with clearing on all exit paths.
    pub fn spawn<F>(&self, label: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            debug!("background task '{}' started", label);
            work.await;
            debug!("background task '{}' finished", label);
        });
    }

    /// Like [`spawn`](Self::spawn), but holds the instance's lock for the
    /// duration of `work`, serializing concurrent mutations of one instance.
    pub fn spawn_for_instance<F>(&self, name: &str, label: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let lock = self.lock_for(name);
        let name = name.to_string();
        tokio::spawn(async move {
            let _guard = lock.lock().await;
            debug!("background task '{}' for '{}' started", label, name);
            work.await;
            debug!("background task '{}' for '{}' finished", label, name);
        });
    }

    /// Acquire an instance's lock without dispatching, for request-path
    /// operations (such as `create`) that must exclude concurrent mutations
    /// of the same name. Fails immediately when an operation is in flight.
    pub fn try_lock_instance(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self.lock_for(name);
        match lock.try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("instance '{}' is busy; refusing concurrent operation", name);
                None
            }
        }
    }
}
