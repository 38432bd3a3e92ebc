//! The store: state, reducer, middleware chain and dispatch pipeline.
//!
//! # Dispatch Lifecycle
//!
//! ```text
//! store.dispatch(x)                       (root: new ChainId)
//!     │
//!     ├─► admission gate (FIFO)
//!     │       └─ Exclusive: wait for an empty ledger
//!     │
//!     ├─► push ACTION / ASYNC_ACTION on the ledger
//!     │
//!     ├─► middleware chain ─► commit (plain) or mark reached (thunk)
//!     │
//!     ├─► plain: resolve token, remove operation
//!     └─► thunk: spawn body, then resolve token, remove operation
//! ```
//!
//! Dispatches issued through a [`ThunkContext`] or [`MiddlewareContext`] join
//! the caller's chain and skip the admission gate. Under
//! [`Strategy::Exclusive`] this is what lets a running chain dispatch into
//! itself without waiting for its own operation to leave the ledger.
//!
//! # Commit Atomicity
//!
//! Each commit computes the next state from the current one and publishes it
//! under a single commit lock, so concurrent chains never lose an update.
//!
//! [`MiddlewareContext`]: crate::middleware::MiddlewareContext

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::config::{Strategy, StoreConfig};
use crate::error::StoreError;
use crate::ledger::{ChainId, ExecutionStack, LedgerView, Operation, OperationId};
use crate::lock_unpoisoned;
use crate::middleware::{Endpoint, Middleware, MiddlewareContext, Next};
use crate::thunk::{run_guarded, Thunk, ThunkContext};

/// Pure state-transition function.
pub trait Reducer<S>: Send + Sync + 'static {
    fn reduce(&self, state: &S, action: &Action) -> S;
}

impl<S, F> Reducer<S> for F
where
    F: Fn(&S, &Action) -> S + Send + Sync + 'static,
{
    fn reduce(&self, state: &S, action: &Action) -> S {
        self(state, action)
    }
}

/// Anything that can be handed to `dispatch`.
pub enum Dispatchable<S, D> {
    Action(Action),
    Thunk(Thunk<S, D>),
}

impl<S, D> Dispatchable<S, D> {
    /// The completion token of this dispatchable.
    pub fn token(&self) -> &Action {
        match self {
            Dispatchable::Action(action) => action,
            Dispatchable::Thunk(thunk) => thunk.token(),
        }
    }
}

impl<S, D> From<Action> for Dispatchable<S, D> {
    fn from(action: Action) -> Self {
        Dispatchable::Action(action)
    }
}

impl<S, D> From<Thunk<S, D>> for Dispatchable<S, D> {
    fn from(thunk: Thunk<S, D>) -> Self {
        Dispatchable::Thunk(thunk)
    }
}

impl<S, D> fmt::Debug for Dispatchable<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatchable::Action(action) => f.debug_tuple("Action").field(action).finish(),
            Dispatchable::Thunk(thunk) => f.debug_tuple("Thunk").field(thunk).finish(),
        }
    }
}

/// A dispatch capability: the store itself, or a context inside a chain.
///
/// Bound action creators hold one of these.
#[async_trait]
pub trait Dispatch<S, D>: Send + Sync {
    async fn submit(&self, dispatchable: Dispatchable<S, D>) -> Action;
}

#[async_trait]
impl<S, D> Dispatch<S, D> for Store<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    async fn submit(&self, dispatchable: Dispatchable<S, D>) -> Action {
        self.dispatch(dispatchable).await
    }
}

#[async_trait]
impl<S, D> Dispatch<S, D> for ThunkContext<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    async fn submit(&self, dispatchable: Dispatchable<S, D>) -> Action {
        self.dispatch(dispatchable).await
    }
}

#[async_trait]
impl<S, D> Dispatch<S, D> for MiddlewareContext<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    async fn submit(&self, dispatchable: Dispatchable<S, D>) -> Action {
        self.dispatch(dispatchable).await
    }
}

// =============================================================================
// Operation Guard (RAII)
// =============================================================================

/// Keeps a dispatch's ledger entry alive for exactly as long as the dispatch.
///
/// On drop the token is rejected if nobody settled it (the chain died, e.g. a
/// reducer panic or a dropped thunk task), then the entry is removed.
struct OperationGuard {
    ledger: ExecutionStack,
    id: OperationId,
    token: Action,
}

impl OperationGuard {
    fn push(ledger: ExecutionStack, token: &Action, chain: ChainId) -> Self {
        let op = Operation::for_action(token, chain);
        let id = op.id();
        debug!(
            action_type = %token.action_type(),
            chain = %chain,
            operation = %id,
            kind = %op.kind(),
            "operation pushed"
        );
        ledger.push(op);
        Self {
            ledger,
            id,
            token: token.clone(),
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if self.token.reject("dispatch aborted") {
            warn!(
                action_type = %self.token.action_type(),
                operation = %self.id,
                "dispatch aborted before settlement"
            );
        }
        if self.ledger.remove(self.id).is_some() {
            debug!(
                action_type = %self.token.action_type(),
                operation = %self.id,
                "operation removed"
            );
        }
    }
}

// =============================================================================
// Store
// =============================================================================

type MiddlewareChain<S, D> = Arc<Vec<Arc<dyn Middleware<S, D>>>>;

struct StoreInner<S, D> {
    state: watch::Sender<S>,
    commit: Mutex<()>,
    reducer: Mutex<Arc<dyn Reducer<S>>>,
    middleware: Mutex<MiddlewareChain<S, D>>,
    deps: Arc<D>,
    config: StoreConfig,
    ledger: ExecutionStack,
    admission: tokio::sync::Mutex<()>,
}

/// Handle to a running store. Cheap to clone; clones share everything.
pub struct Store<S, D = ()> {
    inner: Arc<StoreInner<S, D>>,
}

impl<S, D> Clone for Store<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, D> Store<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Dispatch an action or thunk as a new root chain.
    ///
    /// Returns once the dispatch was admitted and, for plain actions, committed.
    /// Await the returned token for settlement.
    pub async fn dispatch(&self, dispatchable: impl Into<Dispatchable<S, D>>) -> Action {
        let dispatchable = dispatchable.into();
        let chain = ChainId::new();
        let guard = self.admit(dispatchable.token(), chain).await;
        self.execute(dispatchable, chain, guard).await
    }

    /// Dispatch inside an existing chain, bypassing admission.
    pub(crate) async fn dispatch_in_chain(
        &self,
        dispatchable: Dispatchable<S, D>,
        chain: ChainId,
    ) -> Action {
        let guard = OperationGuard::push(self.inner.ledger.clone(), dispatchable.token(), chain);
        self.execute(dispatchable, chain, guard).await
    }

    async fn admit(&self, token: &Action, chain: ChainId) -> OperationGuard {
        let _gate = self.inner.admission.lock().await;

        if self.inner.config.strategy.is_exclusive() && !self.inner.ledger.is_empty() {
            debug!(
                action_type = %token.action_type(),
                chain = %chain,
                pending = self.inner.ledger.len(),
                "waiting for exclusive admission"
            );
            self.inner.ledger.wait_for_empty().await;
        }

        debug!(
            action_type = %token.action_type(),
            chain = %chain,
            strategy = %self.inner.config.strategy,
            "root admitted"
        );
        OperationGuard::push(self.inner.ledger.clone(), token, chain)
    }

    async fn execute(
        &self,
        dispatchable: Dispatchable<S, D>,
        chain: ChainId,
        guard: OperationGuard,
    ) -> Action {
        let (token, body) = match dispatchable {
            Dispatchable::Action(action) => (action, None),
            Dispatchable::Thunk(thunk) => {
                let (token, body) = thunk.into_parts();
                (token, Some(body))
            }
        };

        let chain_snapshot = self.middleware_chain();
        let ctx = MiddlewareContext::new(self.clone(), chain);
        let endpoint = Endpoint::default();

        let result = Next::new(&chain_snapshot, &ctx, &endpoint)
            .run(token.clone())
            .await;

        if let Err(e) = result {
            warn!(
                action_type = %token.action_type(),
                chain = %chain,
                error = %e,
                "middleware failed, rejecting action"
            );
            token.reject(format!("{e:#}"));
            return token;
        }

        match body {
            Some(body) if endpoint.reached() => {
                let thunk_ctx = ThunkContext::new(self.clone(), chain, token.clone());
                let settle = token.clone();
                tokio::spawn(async move {
                    let finished = run_guarded(body, thunk_ctx).await;
                    if settle.resolve() {
                        debug!(action_type = %settle.action_type(), finished, "thunk settled");
                    }
                    drop(guard);
                });
            }
            None if token.is_async() => {
                warn!(
                    action_type = %token.action_type(),
                    chain = %chain,
                    "thunk token dispatched without its body, nothing to run"
                );
                token.resolve();
            }
            _ => {
                token.resolve();
                debug!(action_type = %token.action_type(), chain = %chain, "action settled");
            }
        }

        token
    }

    /// Run the reducer and publish the result. Called by the chain's endpoint.
    pub(crate) fn commit(&self, action: &Action) {
        let _commit = lock_unpoisoned(&self.inner.commit);
        let reducer = lock_unpoisoned(&self.inner.reducer).clone();

        let next = {
            let current = self.inner.state.borrow();
            reducer.reduce(&current, action)
        };
        self.inner.state.send_replace(next);

        debug!(action_type = %action.action_type(), "state committed");
    }

    fn middleware_chain(&self) -> MiddlewareChain<S, D> {
        lock_unpoisoned(&self.inner.middleware).clone()
    }

    pub(crate) fn ledger_handle(&self) -> ExecutionStack {
        self.inner.ledger.clone()
    }

    /// Clone of the current state.
    pub fn state(&self) -> S {
        self.inner.state.borrow().clone()
    }

    /// Read the current state without cloning it.
    ///
    /// Commits wait while `f` runs, so keep it short.
    pub fn with_state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.inner.state.borrow())
    }

    /// Observe every committed state.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.inner.state.subscribe()
    }

    pub fn dependencies(&self) -> &D {
        &self.inner.deps
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.config.strategy
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Read-only view of the execution ledger.
    pub fn ledger(&self) -> LedgerView {
        LedgerView::new(self.inner.ledger.clone())
    }

    /// Copy of the operations currently in flight.
    pub fn pending_operations(&self) -> Vec<Operation> {
        self.inner.ledger.snapshot()
    }

    /// True when nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.inner.ledger.is_empty()
    }

    /// Wait for the ledger to drain, bounded by the configured idle timeout.
    pub async fn wait_until_idle(&self) -> Result<(), StoreError> {
        self.wait_until_idle_timeout(self.inner.config.idle_timeout)
            .await
    }

    /// Wait for the ledger to drain, giving up after `duration`.
    pub async fn wait_until_idle_timeout(&self, duration: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(duration, self.inner.ledger.wait_for_empty())
            .await
            .map(|_| ())
            .map_err(|_| StoreError::Timeout { duration })
    }

    /// Append a middleware to the end of the chain.
    ///
    /// Dispatches already in progress keep the chain they started with.
    pub fn add_middleware(&self, middleware: impl Middleware<S, D>) {
        let name = middleware.name();
        let mut chain = lock_unpoisoned(&self.inner.middleware);
        let mut next = Vec::clone(&chain);
        next.push(Arc::new(middleware));
        *chain = Arc::new(next);
        debug!(middleware = name, total = chain.len(), "middleware added");
    }

    /// Swap the reducer. Later commits use the new one.
    pub fn replace_reducer(&self, reducer: impl Reducer<S>) {
        *lock_unpoisoned(&self.inner.reducer) = Arc::new(reducer);
        debug!("reducer replaced");
    }
}

impl<S, D> fmt::Debug for Store<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("strategy", &self.inner.config.strategy)
            .field("ledger", &self.inner.ledger)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a [`Store`].
///
/// # Example
///
/// ```ignore
/// let store = StoreBuilder::with_deps(deps, AppState::default(), app_reducer)
///     .with_strategy(Strategy::Exclusive)
///     .with_middleware(LoggingMiddleware)
///     .build();
/// ```
pub struct StoreBuilder<S, D = ()> {
    initial: S,
    reducer: Arc<dyn Reducer<S>>,
    deps: Arc<D>,
    middleware: Vec<Arc<dyn Middleware<S, D>>>,
    config: StoreConfig,
}

impl<S> StoreBuilder<S, ()>
where
    S: Clone + Send + Sync + 'static,
{
    /// Builder for a store without dependencies.
    pub fn new(initial: S, reducer: impl Reducer<S>) -> Self {
        Self::with_deps((), initial, reducer)
    }
}

impl<S, D> StoreBuilder<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Builder for a store whose thunks and middleware share `deps`.
    pub fn with_deps(deps: D, initial: S, reducer: impl Reducer<S>) -> Self {
        Self::with_arc(Arc::new(deps), initial, reducer)
    }

    /// Like [`with_deps`](Self::with_deps), for dependencies already shared elsewhere.
    pub fn with_arc(deps: Arc<D>, initial: S, reducer: impl Reducer<S>) -> Self {
        Self {
            initial,
            reducer: Arc::new(reducer),
            deps,
            middleware: Vec::new(),
            config: StoreConfig::default(),
        }
    }

    /// Append a middleware. Middleware run in registration order.
    pub fn with_middleware(mut self, middleware: impl Middleware<S, D>) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Store<S, D> {
        let (state, _) = watch::channel(self.initial);

        info!(
            strategy = %self.config.strategy,
            middleware = self.middleware.len(),
            idle_timeout_ms = self.config.idle_timeout.as_millis() as u64,
            "store built"
        );

        Store {
            inner: Arc::new(StoreInner {
                state,
                commit: Mutex::new(()),
                reducer: Mutex::new(self.reducer),
                middleware: Mutex::new(Arc::new(self.middleware)),
                deps: self.deps,
                config: self.config,
                ledger: ExecutionStack::new(),
                admission: tokio::sync::Mutex::new(()),
            }),
        }
    }
}
