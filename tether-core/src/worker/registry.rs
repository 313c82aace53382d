//! Worker contexts currently connected to this shared worker, and the cleanup
//! functions plugin code deferred until each of them goes away.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;
use tracing::{debug, info, warn};

type DeferredFn = Box<dyn FnOnce() + Send>;

/// Holds one deferred function until it has run.
struct DeferredSlot(Mutex<Option<DeferredFn>>);

impl DeferredSlot {
    /// Runs the function unless it already ran.
    fn run(&self) {
        let f = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(f) = f {
            f();
        }
    }
}

#[derive(Default)]
struct Deferred {
    next_key: u64,
    pending: HashMap<u64, Arc<DeferredSlot>>,
    closed: bool,
}

/// Registry-side state of one worker context.
pub(crate) struct TestWorkerState {
    pub(crate) id: String,
    pub(crate) file: PathBuf,
    exited: watch::Sender<bool>,
    deferred: Mutex<Deferred>,
}

impl TestWorkerState {
    fn new(id: String, file: PathBuf) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            id,
            file,
            exited,
            deferred: Mutex::new(Deferred::default()),
        }
    }

    fn deferred(&self) -> MutexGuard<'_, Deferred> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn exited(&self) -> watch::Receiver<bool> {
        self.exited.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Queues `f` until deregistration. Runs it right away when the context
    /// is already gone.
    pub(crate) fn defer(self: &Arc<Self>, f: DeferredFn) -> Release {
        let slot = Arc::new(DeferredSlot(Mutex::new(Some(f))));

        let mut deferred = self.deferred();
        if deferred.closed {
            drop(deferred);
            slot.run();
            return Release {
                key: None,
                slot,
                owner: Weak::new(),
            };
        }

        let key = deferred.next_key;
        deferred.next_key += 1;
        deferred.pending.insert(key, slot.clone());

        Release {
            key: Some(key),
            slot,
            owner: Arc::downgrade(self),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_releases(&self) -> usize {
        self.deferred().pending.len()
    }

    /// Marks the context as gone and runs every pending release function.
    fn shut_down(&self) {
        let pending = {
            let mut deferred = self.deferred();
            deferred.closed = true;
            std::mem::take(&mut deferred.pending)
        };

        debug!(test_worker = %self.id, count = pending.len(), "Running deferred release functions");
        for slot in pending.into_values() {
            slot.run();
        }

        self.exited.send_replace(true);
    }
}

/// Revocable handle to a deferred function.
///
/// Calling [`Release::release`] runs the function early and removes it from
/// the pending set. The function runs at most once no matter how often this
/// is called or whether deregistration got to it first.
#[derive(Clone)]
pub struct Release {
    key: Option<u64>,
    slot: Arc<DeferredSlot>,
    owner: Weak<TestWorkerState>,
}

impl Release {
    pub fn release(&self) {
        if let (Some(key), Some(owner)) = (self.key, self.owner.upgrade()) {
            owner.deferred().pending.remove(&key);
        }
        self.slot.run();
    }
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Release").field("key", &self.key).finish()
    }
}

/// Maps context ids to their state.
#[derive(Clone, Default)]
pub(crate) struct TestWorkerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<TestWorkerState>>>>,
}

impl TestWorkerRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TestWorkerState>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, id: String, file: PathBuf) -> Arc<TestWorkerState> {
        let state = Arc::new(TestWorkerState::new(id.clone(), file));
        let previous = self.lock().insert(id, state.clone());
        if let Some(previous) = previous {
            warn!(test_worker = %previous.id, "Test worker registered twice, ending the earlier registration");
            previous.shut_down();
        }
        info!(test_worker = %state.id, file = ?state.file, "Test worker registered");
        state
    }

    /// Removes the context and runs its release functions. Returns false for
    /// ids that are not registered.
    pub(crate) fn deregister(&self, id: &str) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(state) => {
                info!(test_worker = %id, "Test worker deregistered");
                state.shut_down();
                true
            }
            None => {
                debug!(test_worker = %id, "Ignoring deregistration of unknown test worker");
                false
            }
        }
    }

    pub(crate) fn deregister_all(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, state)| state).collect();
        for state in drained {
            state.shut_down();
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<TestWorkerState>> {
        self.lock().get(id).cloned()
    }

    /// Whether this exact registration is still live.
    pub(crate) fn is_current(&self, state: &Arc<TestWorkerState>) -> bool {
        self.lock()
            .get(&state.id)
            .is_some_and(|current| Arc::ptr_eq(current, state))
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
