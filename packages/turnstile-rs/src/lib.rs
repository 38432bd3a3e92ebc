//! # Turnstile
//!
//! A dispatch and execution-tracking engine for reactive state containers:
//! tokens settle once, chains are admitted by strategy, commits are atomic.
//!
//! ## Core Concepts
//!
//! - [`Action`] = a completion token (descriptor + settle-once completion)
//! - [`Thunk`] = a function-valued action that runs asynchronous work
//! - [`Reducer`] = pure `(state, action) -> state`, supplied by the application
//! - [`Middleware`] = interceptors composed around the reducer
//! - [`ExecutionStack`] = the ledger of in-flight operations
//!
//! The key signal: **the store is idle when the ledger is empty.**
//!
//! ## Architecture
//!
//! ```text
//! caller ─► creator.create(args)
//!              │
//!              ▼ store.dispatch()
//!        Admission (Strategy) ───── Exclusive: wait for empty ledger
//!              │
//!              ▼ push Operation
//!        ExecutionStack ◄──────────────────────────────┐
//!              │                                       │
//!              ▼                                       │
//!        Middleware A ─► Middleware B ─► commit        │
//!              │                           │           │
//!              │ ctx.dispatch() (same chain, no gate)  │
//!              │                           ▼           │
//!              │                   state (watch) ─► subscribers
//!              ▼                                       │
//!        settle token ─► remove Operation ─────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Tokens settle at most once** - later `resolve`/`reject` calls are no-ops
//! 2. **Commits are serialized** - state is the reducer folded over commit order
//! 3. **Ledger length = unsettled dispatches** - plus tracked middleware effects
//! 4. **Exclusive admits one root chain at a time** - re-entrant dispatches join the running chain
//! 5. **Thunk failures stay at the thunk boundary** - logged, never propagated
//!
//! ## Guarantees
//!
//! - **No lost updates**: concurrent chains never overwrite each other's commits
//! - **No cancellation**: a thunk that never finishes keeps the store busy forever
//! - **Reducer panics propagate**: the ledger entry is still removed and its token rejected
//!
//! ## Example
//!
//! ```ignore
//! use turnstile::{create_action, create_thunk, Action, StoreBuilder, Strategy, ThunkContext};
//!
//! #[derive(Clone, Default)]
//! struct Counter {
//!     value: i64,
//! }
//!
//! fn reducer(state: &Counter, action: &Action) -> Counter {
//!     match action.action_type() {
//!         "INC" => Counter { value: state.value + 1 },
//!         _ => state.clone(),
//!     }
//! }
//!
//! let inc = create_action("INC");
//! let inc_later = create_thunk("INC_LATER", |delay_ms: u64, ctx: ThunkContext<Counter, ()>| async move {
//!     tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
//!     ctx.dispatch(Action::new("INC")).await;
//!     Ok(())
//! });
//!
//! let store = StoreBuilder::new(Counter::default(), reducer)
//!     .with_strategy(Strategy::Exclusive)
//!     .build();
//!
//! store.dispatch(inc.action()).await;
//! store.dispatch(inc_later.create(10)).await;
//! store.wait_until_idle().await?;
//!
//! assert_eq!(store.state().value, 2);
//! ```

use std::sync::{Mutex, MutexGuard};

// Core modules
mod action;
mod config;
mod error;
mod factory;
mod ledger;
mod middleware;
mod provider;
mod store;
mod thunk;

// Testing utilities (feature-gated)
#[cfg(feature = "testing")]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export token types
pub use action::{Action, ActionKind, Settlement};

// Re-export configuration
pub use config::{Strategy, StoreConfig, DEFAULT_IDLE_TIMEOUT};

// Re-export error types
pub use error::StoreError;

// Re-export factory types
pub use factory::{
    bind_action_creators, create_action, create_action_with, create_thunk, ActionCreator,
    Bindable, BoundCreators, Creator, ThunkCreator,
};

// Re-export ledger types
pub use ledger::{ChainId, ExecutionStack, LedgerView, Operation, OperationId, OperationKind};

// Re-export middleware types
pub use middleware::{
    ActionStats, EffectGuard, LoggingMiddleware, Middleware, MiddlewareContext, Next,
    PerformanceMonitor,
};

// Re-export provider types
pub use provider::{FeatureModule, Registration, StoreProvider};

// Re-export store types (primary entry point)
pub use store::{Dispatch, Dispatchable, Reducer, Store, StoreBuilder};

// Re-export thunk types
pub use thunk::{Thunk, ThunkContext};

// Re-export commonly used external types
pub use async_trait::async_trait;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its data consistent before
/// anything that can panic runs, so the poisoned value is safe to reuse.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("recovering poisoned lock");
        poisoned.into_inner()
    })
}
