//! Template registry: lifecycle state and the readiness protocol.
//!
//! A template is registered in `Initializing`, populated out-of-band, and
//! finalized to `Ready` (or discarded). Any number of waiters may observe
//! the transition through [`Template::wait_until_ready`]. The registry
//! serializes physical creation per hash: [`TemplateCollection::push`]
//! hands the inserting caller an owned lock guard that it holds across the
//! drop-and-create of the template database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::{Error, Result};

/// Lifecycle state of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateState {
    /// Registered; the template database is being created and populated.
    Initializing,
    /// Finalized; test databases may be cloned from it.
    Ready,
    /// Removed; absorbing: no transition leads out of this state.
    Discarded,
}

impl TemplateState {
    /// Whether waiters observing this state are done waiting.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Discarded)
    }
}

/// A registered template: its database identity plus the readiness signal.
pub struct Template {
    hash: String,
    database: Database,
    state: watch::Sender<TemplateState>,
    /// Serializes initialize/discard of this hash; held across the physical
    /// creation of the template database.
    init_lock: Arc<Mutex<()>>,
}

impl Template {
    fn new(hash: impl Into<String>, database: Database) -> Self {
        let (state, _) = watch::channel(TemplateState::Initializing);
        Self {
            hash: hash.into(),
            database,
            state,
            init_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The content hash identifying this template.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The template database identity.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Current state snapshot.
    pub fn state(&self) -> TemplateState {
        *self.state.borrow()
    }

    /// Transition `from` → `to` if the template is currently in `from`.
    /// Returns whether the transition happened. `Discarded` is absorbing,
    /// so no call can ever move a template out of it.
    pub fn transition(&self, from: TemplateState, to: TemplateState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|state| {
            if *state == from && *state != to {
                *state = to;
                moved = true;
                true
            } else {
                false
            }
        });
        moved
    }

    /// Mark the template discarded, waking all waiters. Returns whether
    /// this call performed the transition.
    pub fn discard(&self) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|state| {
            if *state == TemplateState::Discarded {
                false
            } else {
                *state = TemplateState::Discarded;
                moved = true;
                true
            }
        });
        moved
    }

    /// Wait until the template reaches a terminal state.
    ///
    /// Returns immediately with the current state when it is already
    /// terminal. Otherwise blocks until the transition, the `timeout`, or
    /// `cancel`; on timeout the state observed at that moment (normally
    /// still `Initializing`) is returned, on cancellation
    /// [`Error::Cancelled`].
    pub async fn wait_until_ready(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TemplateState> {
        let mut rx = self.state.subscribe();
        {
            let current = *rx.borrow_and_update();
            if current.is_terminal() {
                return Ok(current);
            }
        }
        tokio::select! {
            outcome = tokio::time::timeout(timeout, rx.wait_for(|state| state.is_terminal())) => {
                match outcome {
                    Ok(Ok(state)) => Ok(*state),
                    // Sender gone or timeout: report whatever is current.
                    Ok(Err(_)) | Err(_) => Ok(self.state()),
                }
            }
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    fn lock_for_init(&self) -> Option<OwnedMutexGuard<()>> {
        self.init_lock.clone().try_lock_owned().ok()
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("hash", &self.hash)
            .field("state", &self.state())
            .finish()
    }
}

/// In-memory registry mapping template hashes to templates.
#[derive(Default)]
pub struct TemplateCollection {
    templates: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateCollection {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically insert a new template in `Initializing` state.
    ///
    /// When the hash is new, returns `(added=true, Some(guard))`: the guard
    /// is the template's init lock, already held, and the caller keeps it
    /// across the physical creation so concurrent operations on the same
    /// hash observe a consistent state. When the hash is already present,
    /// returns `(false, None)` without blocking.
    pub fn push(&self, hash: &str, database: Database) -> (bool, Option<OwnedMutexGuard<()>>) {
        let mut map = self.templates.write();
        if map.contains_key(hash) {
            return (false, None);
        }
        let template = Arc::new(Template::new(hash, database));
        // The lock is freshly created and uncontended; this cannot fail.
        let guard = template.lock_for_init();
        map.insert(hash.to_string(), template);
        (true, guard)
    }

    /// Snapshot lookup.
    pub fn get(&self, hash: &str) -> Option<Arc<Template>> {
        self.templates.read().get(hash).cloned()
    }

    /// Remove and return the template for `hash`.
    pub fn pop(&self, hash: &str) -> Option<Arc<Template>> {
        self.templates.write().remove(hash)
    }

    /// Remove the template without touching its state. Only valid while
    /// the caller holds the template's init guard (failed initialization).
    pub fn remove_unsafe(&self, hash: &str) {
        self.templates.write().remove(hash);
    }

    /// Drain the registry. Every drained template is marked `Discarded`,
    /// unblocking its waiters, and returned so the caller can drop the
    /// physical databases.
    pub fn remove_all(&self) -> Vec<Arc<Template>> {
        let drained: Vec<Arc<Template>> = {
            let mut map = self.templates.write();
            map.drain().map(|(_, template)| template).collect()
        };
        for template in &drained {
            template.discard();
        }
        drained
    }

    /// Number of registered templates.
    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}

impl std::fmt::Debug for TemplateCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCollection")
            .field("len", &self.len())
            .finish()
    }
}
