//! The operation ledger: an ordered, observable record of in-flight work.
//!
//! Every admitted dispatch pushes one [`Operation`] and removes it once its
//! token settles. The ledger is therefore empty exactly when the store is idle.
//!
//! # Emptiness Waiters
//!
//! [`ExecutionStack::wait_for_empty`] registers a one-shot waiter. Waiters are
//! released inside the same critical section that takes the length to zero, so
//! a short-lived `1 → 0 → 1` transition is never missed. All waiters registered
//! at that moment receive the same (empty) snapshot.
//!
//! For continuous observation, [`ExecutionStack::subscribe`] hands out a
//! `watch::Receiver` that always holds the latest snapshot.
//!
//! Insertion order only matters for `peek`/`pop` and debugging. Membership,
//! not position, decides emptiness.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::action::Action;
use crate::lock_unpoisoned;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifies one root dispatch chain.
///
/// A root dispatch gets a fresh id. Everything it triggers by re-entrant
/// dispatch (from a thunk or a middleware) carries the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChainId(Uuid);

impl ChainId {
    /// Create a new random chain id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ChainId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new random operation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Operation
// =============================================================================

/// What kind of work an operation tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// A plain action on its way to the reducer.
    Action,
    /// A thunk running asynchronous work.
    AsyncAction,
    /// Asynchronous work started by a middleware.
    Effect,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Action => write!(f, "ACTION"),
            OperationKind::AsyncAction => write!(f, "ASYNC_ACTION"),
            OperationKind::Effect => write!(f, "EFFECT"),
        }
    }
}

/// One in-flight dispatch (or middleware effect).
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    id: OperationId,
    kind: OperationKind,
    chain: ChainId,
    label: String,
    #[serde(skip)]
    token: Option<Action>,
    admitted_at: DateTime<Utc>,
}

impl Operation {
    /// Track a dispatched token. Thunk tokens become `AsyncAction`.
    pub fn for_action(token: &Action, chain: ChainId) -> Self {
        let kind = if token.is_async() {
            OperationKind::AsyncAction
        } else {
            OperationKind::Action
        };
        Self {
            id: OperationId::new(),
            kind,
            chain,
            label: token.action_type().to_string(),
            token: Some(token.clone()),
            admitted_at: Utc::now(),
        }
    }

    /// Track middleware-driven work that has no token of its own.
    pub fn effect(label: impl Into<String>, chain: ChainId) -> Self {
        Self {
            id: OperationId::new(),
            kind: OperationKind::Effect,
            chain,
            label: label.into(),
            token: None,
            admitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Action type, or the effect label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The tracked token (`None` for effects).
    pub fn token(&self) -> Option<&Action> {
        self.token.as_ref()
    }

    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }
}

// =============================================================================
// ExecutionStack
// =============================================================================

#[derive(Default)]
struct LedgerState {
    ops: Vec<Operation>,
    empty_waiters: Vec<oneshot::Sender<Vec<Operation>>>,
}

/// Ordered ledger of in-flight operations with an emptiness-wait primitive.
///
/// # Example
///
/// ```ignore
/// let ledger = ExecutionStack::new();
/// let op = Operation::for_action(&token, ChainId::new());
/// let id = op.id();
///
/// ledger.push(op);
/// let waiter = tokio::spawn({
///     let ledger = ledger.clone();
///     async move { ledger.wait_for_empty().await }
/// });
///
/// ledger.remove(id);
/// assert!(waiter.await?.is_empty());
/// ```
#[derive(Clone)]
pub struct ExecutionStack {
    inner: std::sync::Arc<LedgerInner>,
}

struct LedgerInner {
    state: Mutex<LedgerState>,
    snapshots: watch::Sender<Vec<Operation>>,
}

impl ExecutionStack {
    /// Create an empty ledger.
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(Vec::new());
        Self {
            inner: std::sync::Arc::new(LedgerInner {
                state: Mutex::new(LedgerState::default()),
                snapshots,
            }),
        }
    }

    /// Apply `f` to the ledger, then publish the new snapshot and release
    /// emptiness waiters if the ledger is now empty.
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Operation>) -> R) -> R {
        let mut state = lock_unpoisoned(&self.inner.state);
        let result = f(&mut state.ops);

        let snapshot = state.ops.clone();
        if snapshot.is_empty() {
            for waiter in state.empty_waiters.drain(..) {
                // Receiver gone means the waiter was cancelled.
                let _ = waiter.send(Vec::new());
            }
        }
        self.inner.snapshots.send_replace(snapshot);
        result
    }

    /// Append an operation.
    pub fn push(&self, op: Operation) {
        self.mutate(|ops| ops.push(op));
    }

    /// Remove and return the most recently pushed operation.
    ///
    /// Returns `None` on an empty ledger.
    pub fn pop(&self) -> Option<Operation> {
        self.mutate(|ops| ops.pop())
    }

    /// The most recently pushed operation, if any.
    pub fn peek(&self) -> Option<Operation> {
        lock_unpoisoned(&self.inner.state).ops.last().cloned()
    }

    /// Remove one operation by id.
    pub fn remove(&self, id: OperationId) -> Option<Operation> {
        self.mutate(|ops| {
            let index = ops.iter().position(|op| op.id == id)?;
            Some(ops.remove(index))
        })
    }

    /// Keep only the operations satisfying `predicate`.
    ///
    /// Mutates the ledger in place and returns the retained operations.
    pub fn filter(&self, mut predicate: impl FnMut(&Operation) -> bool) -> Vec<Operation> {
        self.mutate(|ops| {
            ops.retain(|op| predicate(op));
            ops.clone()
        })
    }

    /// Remove every operation.
    pub fn clear(&self) {
        self.mutate(|ops| ops.clear());
    }

    /// Copy of the current operations in insertion order.
    pub fn snapshot(&self) -> Vec<Operation> {
        lock_unpoisoned(&self.inner.state).ops.clone()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner.state).ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observe every committed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Operation>> {
        self.inner.snapshots.subscribe()
    }

    /// Wait until the ledger is empty and return the (empty) final snapshot.
    ///
    /// Resolves immediately if the ledger is already empty.
    pub async fn wait_for_empty(&self) -> Vec<Operation> {
        let receiver = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if state.ops.is_empty() {
                return Vec::new();
            }
            // Drop senders whose waiter was cancelled (e.g. timed out).
            state.empty_waiters.retain(|w| !w.is_closed());
            let (sender, receiver) = oneshot::channel();
            state.empty_waiters.push(sender);
            receiver
        };

        // The sender lives in the ledger, which `self` keeps alive.
        receiver.await.unwrap_or_default()
    }

    /// Number of tasks currently parked in `wait_for_empty`.
    pub fn waiter_count(&self) -> usize {
        let mut state = lock_unpoisoned(&self.inner.state);
        state.empty_waiters.retain(|w| !w.is_closed());
        state.empty_waiters.len()
    }
}

/// Read-only handle on a store's ledger.
#[derive(Clone, Debug)]
pub struct LedgerView {
    stack: ExecutionStack,
}

impl LedgerView {
    pub(crate) fn new(stack: ExecutionStack) -> Self {
        Self { stack }
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn peek(&self) -> Option<Operation> {
        self.stack.peek()
    }

    pub fn snapshot(&self) -> Vec<Operation> {
        self.stack.snapshot()
    }

    /// Operations belonging to one chain, in insertion order.
    pub fn for_chain(&self, chain: ChainId) -> Vec<Operation> {
        self.stack
            .snapshot()
            .into_iter()
            .filter(|op| op.chain() == chain)
            .collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Operation>> {
        self.stack.subscribe()
    }
}

impl Default for ExecutionStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStack")
            .field("len", &self.len())
            .finish()
    }
}
