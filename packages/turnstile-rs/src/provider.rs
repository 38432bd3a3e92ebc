//! Lazily constructed store with deferred feature-module registration.
//!
//! Feature modules may register before anything has asked for the store. Those
//! registrations are queued and replayed once the store exists:
//!
//! ```text
//! register_feature(A) ──► pending [A]            (no store yet)
//! register_feature(B) ──► pending [A, B]
//! get()
//!   ├─ phase 1: construct store (exactly once)
//!   └─ phase 2: flush pending ─► A.load(store), B.load(store)
//! register_feature(C) ──► C.load(store)          (store exists: runs now)
//! ```
//!
//! Modules are identified by name. A module that already loaded is not loaded
//! again. A module whose load failed can be registered again to retry.
//!
//! The queue is drained one module at a time. If the `get` future is dropped
//! mid-flush, the interrupted module goes back to the front of the queue and
//! the rest stay queued for the next `get`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::lock_unpoisoned;
use crate::store::Store;

/// A unit of deferred registration that extends a store.
///
/// Loads typically add middleware, swap in an extended reducer, or dispatch
/// initial actions.
#[async_trait]
pub trait FeatureModule<S, D>: Send + Sync + 'static {
    /// Unique name. Registration is idempotent per name.
    fn name(&self) -> &str;

    async fn load(&self, store: &Store<S, D>) -> Result<()>;
}

/// Outcome of [`StoreProvider::register_feature`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// No store yet; the module loads when the store is first requested.
    Queued,
    /// The module loaded against the existing store.
    Loaded,
    /// A module with this name already loaded.
    AlreadyLoaded,
    /// The load returned an error. Registering again retries.
    Failed(String),
}

type StoreFactory<S, D> = Box<dyn Fn() -> Store<S, D> + Send + Sync>;

/// Memoizes one store and replays feature modules registered before it existed.
pub struct StoreProvider<S, D = ()> {
    factory: StoreFactory<S, D>,
    store: OnceLock<Store<S, D>>,
    pending: Mutex<VecDeque<Arc<dyn FeatureModule<S, D>>>>,
    loaded: Mutex<HashSet<String>>,
}

impl<S, D> StoreProvider<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Create a provider. `factory` runs at most once, on the first `get`.
    pub fn new(factory: impl Fn() -> Store<S, D> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            store: OnceLock::new(),
            pending: Mutex::new(VecDeque::new()),
            loaded: Mutex::new(HashSet::new()),
        }
    }

    /// The store, constructing it and flushing queued modules if needed.
    pub async fn get(&self) -> Store<S, D> {
        let store = self.construct();
        self.flush(&store).await;
        store
    }

    /// The store if it was already constructed.
    pub fn try_get(&self) -> Option<Store<S, D>> {
        self.store.get().cloned()
    }

    pub fn is_constructed(&self) -> bool {
        self.store.get().is_some()
    }

    /// Register a feature module, loading it now if the store exists.
    pub async fn register_feature(&self, module: impl FeatureModule<S, D>) -> Registration {
        let module: Arc<dyn FeatureModule<S, D>> = Arc::new(module);

        if self.is_loaded(module.name()) {
            debug!(feature = module.name(), "feature already loaded");
            return Registration::AlreadyLoaded;
        }

        let store = {
            // The pending lock orders this check against the flush in `get`.
            let mut pending = lock_unpoisoned(&self.pending);
            match self.store.get() {
                Some(store) => store.clone(),
                None => {
                    if pending.iter().any(|queued| queued.name() == module.name()) {
                        debug!(feature = module.name(), "feature already queued");
                    } else {
                        debug!(feature = module.name(), "store not constructed, feature queued");
                        pending.push_back(module);
                    }
                    return Registration::Queued;
                }
            }
        };

        self.load(&store, module, false).await
    }

    /// Whether a module with this name has loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        lock_unpoisoned(&self.loaded).contains(name)
    }

    /// Number of modules waiting for the store.
    pub fn pending_count(&self) -> usize {
        lock_unpoisoned(&self.pending).len()
    }

    fn construct(&self) -> Store<S, D> {
        self.store
            .get_or_init(|| {
                let store = (self.factory)();
                info!("store constructed");
                store
            })
            .clone()
    }

    async fn flush(&self, store: &Store<S, D>) {
        loop {
            let Some(module) = lock_unpoisoned(&self.pending).pop_front() else {
                return;
            };
            debug!(feature = module.name(), "flushing queued feature");
            self.load(store, module, true).await;
        }
    }

    async fn load(
        &self,
        store: &Store<S, D>,
        module: Arc<dyn FeatureModule<S, D>>,
        from_queue: bool,
    ) -> Registration {
        let name = module.name().to_string();

        // Reserve the name so concurrent registrations don't load twice.
        if !lock_unpoisoned(&self.loaded).insert(name.clone()) {
            return Registration::AlreadyLoaded;
        }
        let mut reservation = Reservation {
            provider: self,
            module: module.clone(),
            name: name.clone(),
            requeue: from_queue,
            kept: false,
        };

        match module.load(store).await {
            Ok(()) => {
                reservation.kept = true;
                info!(feature = %name, "feature loaded");
                Registration::Loaded
            }
            Err(e) => {
                reservation.requeue = false;
                warn!(feature = %name, error = %e, "feature failed to load");
                Registration::Failed(format!("{e:#}"))
            }
        }
    }
}

/// Holds a module's name in the loaded set while its load runs.
///
/// Unless the load succeeded, dropping it releases the name. A queued module
/// whose load future was dropped is put back at the front of the queue.
struct Reservation<'a, S, D> {
    provider: &'a StoreProvider<S, D>,
    module: Arc<dyn FeatureModule<S, D>>,
    name: String,
    requeue: bool,
    kept: bool,
}

impl<S, D> Drop for Reservation<'_, S, D> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        lock_unpoisoned(&self.provider.loaded).remove(&self.name);
        if self.requeue {
            lock_unpoisoned(&self.provider.pending).push_front(self.module.clone());
            debug!(feature = %self.name, "feature load interrupted, requeued");
        }
    }
}

impl<S, D> fmt::Debug for StoreProvider<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreProvider")
            .field("constructed", &self.store.get().is_some())
            .field("pending", &lock_unpoisoned(&self.pending).len())
            .finish_non_exhaustive()
    }
}
