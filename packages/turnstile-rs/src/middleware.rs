//! Interceptor chain wrapped around the reducer.
//!
//! Middleware run in registration order, each one receiving the action and a
//! [`Next`] continuation for the rest of the chain. The innermost stage is the
//! store's commit step.
//!
//! ```text
//! dispatch(action)
//!     │
//!     ▼
//! Middleware A ── next.run(action) ──► Middleware B ── next.run(action) ──► commit
//!     ▲                                    │                                 │
//!     └────────── Ok(action) ──────────────┴──────────── Ok(action) ─────────┘
//! ```
//!
//! A middleware may:
//! - **observe**: call `next.run(action)` and look at the result
//! - **transform**: call `next.run(action.with_payload(..))`
//! - **short-circuit**: return without calling `next` (nothing is committed)
//! - **fail**: return `Err`, which rejects the token. Before `next.run` nothing
//!   is committed. After it the commit has already been published and stays.
//! - **re-dispatch**: call `ctx.dispatch(..)`, which joins the current chain
//! - **track async work**: hold an [`EffectGuard`] from `ctx.track_effect(..)`
//!
//! `Next` is consumed by `run`, so each stage reaches the next at most once.
//!
//! # Example
//!
//! ```ignore
//! struct Audit;
//!
//! #[async_trait]
//! impl Middleware<Counter, Deps> for Audit {
//!     async fn handle(
//!         &self,
//!         ctx: &MiddlewareContext<Counter, Deps>,
//!         action: Action,
//!         next: Next<'_, Counter, Deps>,
//!     ) -> Result<Action> {
//!         let committed = next.run(action).await?;
//!         if committed.action_type() == "INC" && ctx.get_state().value > 10 {
//!             ctx.dispatch(Action::new("LIMIT_REACHED")).await;
//!         }
//!         Ok(committed)
//!     }
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::action::Action;
use crate::ledger::{ChainId, ExecutionStack, Operation, OperationId};
use crate::store::{Dispatchable, Store};

/// An interceptor in the dispatch chain.
#[async_trait]
pub trait Middleware<S, D>: Send + Sync + 'static {
    /// Handle an action, usually by calling `next.run(action)`.
    ///
    /// Returning `Err` rejects the dispatched token. An error raised before
    /// `next.run` leaves state untouched; one raised after it cannot undo the
    /// commit the rest of the chain already made.
    async fn handle(
        &self,
        ctx: &MiddlewareContext<S, D>,
        action: Action,
        next: Next<'_, S, D>,
    ) -> Result<Action>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

// =============================================================================
// Context
// =============================================================================

/// What a middleware can see and do while handling one dispatch.
pub struct MiddlewareContext<S, D> {
    store: Store<S, D>,
    chain: ChainId,
}

impl<S, D> Clone for MiddlewareContext<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            chain: self.chain,
        }
    }
}

impl<S, D> MiddlewareContext<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub(crate) fn new(store: Store<S, D>, chain: ChainId) -> Self {
        Self { store, chain }
    }

    /// The chain this dispatch belongs to.
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Clone of the current state.
    pub fn get_state(&self) -> S {
        self.store.state()
    }

    /// Shared dependencies.
    pub fn dependencies(&self) -> &D {
        self.store.dependencies()
    }

    /// Dispatch as part of the current chain (bypasses admission).
    pub async fn dispatch(&self, dispatchable: impl Into<Dispatchable<S, D>>) -> Action {
        self.store
            .dispatch_in_chain(dispatchable.into(), self.chain)
            .await
    }

    /// Keep the store busy until the returned guard completes or drops.
    ///
    /// Use this around work a middleware spawns (polling, timers, sagas) so
    /// that `wait_until_idle` and exclusive admission account for it.
    pub fn track_effect(&self, label: impl Into<String>) -> EffectGuard {
        EffectGuard::new(
            self.store.ledger_handle(),
            Operation::effect(label, self.chain),
        )
    }
}

impl<S, D> fmt::Debug for MiddlewareContext<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareContext")
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Effect Guard (RAII)
// =============================================================================

/// RAII guard for an `EFFECT` ledger entry.
///
/// Pushes the entry on creation and removes it on `complete()` or drop, so a
/// panicking effect still releases the ledger.
pub struct EffectGuard {
    ledger: ExecutionStack,
    id: OperationId,
    label: String,
}

impl EffectGuard {
    fn new(ledger: ExecutionStack, op: Operation) -> Self {
        let id = op.id();
        let label = op.label().to_string();
        debug!(effect = %label, chain = %op.chain(), "effect started");
        ledger.push(op);
        Self { ledger, id, label }
    }

    /// Mark the effect as finished.
    pub fn complete(self) {
        // Drop does the work.
    }
}

impl Drop for EffectGuard {
    fn drop(&mut self) {
        if self.ledger.remove(self.id).is_some() {
            debug!(effect = %self.label, "effect finished");
        }
    }
}

impl fmt::Debug for EffectGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectGuard")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

// =============================================================================
// Next
// =============================================================================

/// Terminal stage of the chain.
///
/// Plain actions are committed here. Thunk tokens only record that they got
/// through; the store launches the thunk body afterwards.
#[derive(Default)]
pub(crate) struct Endpoint {
    reached: AtomicBool,
}

impl Endpoint {
    pub(crate) fn reached(&self) -> bool {
        self.reached.load(Ordering::Acquire)
    }
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a, S, D> {
    remaining: &'a [Arc<dyn Middleware<S, D>>],
    ctx: &'a MiddlewareContext<S, D>,
    endpoint: &'a Endpoint,
}

impl<'a, S, D> Next<'a, S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub(crate) fn new(
        chain: &'a [Arc<dyn Middleware<S, D>>],
        ctx: &'a MiddlewareContext<S, D>,
        endpoint: &'a Endpoint,
    ) -> Self {
        Self {
            remaining: chain,
            ctx,
            endpoint,
        }
    }

    /// Pass the action to the next stage.
    pub async fn run(self, action: Action) -> Result<Action> {
        match self.remaining.split_first() {
            Some((head, tail)) => {
                let next = Next {
                    remaining: tail,
                    ctx: self.ctx,
                    endpoint: self.endpoint,
                };
                head.handle(self.ctx, action, next).await
            }
            None => {
                self.endpoint.reached.store(true, Ordering::Release);
                if !action.is_async() {
                    self.ctx.store.commit(&action);
                }
                Ok(action)
            }
        }
    }
}

// =============================================================================
// Stock Middleware
// =============================================================================

/// Logs every action that passes through the chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl<S, D> Middleware<S, D> for LoggingMiddleware
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    async fn handle(
        &self,
        ctx: &MiddlewareContext<S, D>,
        action: Action,
        next: Next<'_, S, D>,
    ) -> Result<Action> {
        let action_type = action.action_type().to_string();
        debug!(
            action_type = %action_type,
            chain = %ctx.chain(),
            is_async = action.is_async(),
            "action dispatched"
        );

        match next.run(action).await {
            Ok(action) => {
                debug!(action_type = %action_type, chain = %ctx.chain(), "action passed chain");
                Ok(action)
            }
            Err(e) => {
                warn!(action_type = %action_type, chain = %ctx.chain(), error = %e, "action failed in chain");
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// Timing statistics for one action type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionStats {
    pub count: u64,
    pub failures: u64,
    pub total: Duration,
    pub max: Duration,
}

impl ActionStats {
    /// Mean time spent downstream of the monitor.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.count);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Measures how long the downstream chain takes per action type.
///
/// Clones share the same statistics, so keep one clone for reading and
/// register another with the store.
#[derive(Debug, Default, Clone)]
pub struct PerformanceMonitor {
    stats: Arc<DashMap<String, ActionStats>>,
    slow_threshold: Option<Duration>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warn about actions slower than `threshold`.
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = Some(threshold);
        self
    }

    /// Stats for one action type.
    pub fn stats(&self, action_type: &str) -> Option<ActionStats> {
        self.stats.get(action_type).map(|entry| *entry)
    }

    /// Stats for all action types, sorted by type.
    pub fn snapshot(&self) -> Vec<(String, ActionStats)> {
        let mut all: Vec<_> = self
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn reset(&self) {
        self.stats.clear();
    }

    fn record(&self, action_type: &str, elapsed: Duration, failed: bool) {
        let mut entry = self.stats.entry(action_type.to_string()).or_default();
        entry.count += 1;
        entry.total += elapsed;
        entry.max = entry.max.max(elapsed);
        if failed {
            entry.failures += 1;
        }
    }
}

#[async_trait]
impl<S, D> Middleware<S, D> for PerformanceMonitor
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    async fn handle(
        &self,
        _ctx: &MiddlewareContext<S, D>,
        action: Action,
        next: Next<'_, S, D>,
    ) -> Result<Action> {
        let action_type = action.action_type().to_string();
        let started = Instant::now();

        let result = next.run(action).await;

        let elapsed = started.elapsed();
        self.record(&action_type, elapsed, result.is_err());
        if let Some(threshold) = self.slow_threshold {
            if elapsed > threshold {
                warn!(action_type = %action_type, elapsed_ms = elapsed.as_millis() as u64, "slow action");
            }
        }
        result
    }

    fn name(&self) -> &'static str {
        "performance_monitor"
    }
}
