//! Testing utilities for stores, middleware and thunks.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! turnstile = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use turnstile::testing::{assert_actions, ActionLatch, RecordingMiddleware};
//!
//! let latch = ActionLatch::new(3);
//! let recorder = RecordingMiddleware::new().with_latch(latch.clone());
//! let store = StoreBuilder::new(0, reducer)
//!     .with_middleware(recorder.clone())
//!     .build();
//!
//! store.dispatch(load_all.create(())).await;
//! latch.await_zero().await;
//!
//! assert_actions!(recorder, ["LOAD_ALL", "LOADED", "LOADED"]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::action::Action;
use crate::lock_unpoisoned;
use crate::middleware::{Middleware, MiddlewareContext, Next};

/// Asserts the exact sequence of action types a [`RecordingMiddleware`] saw.
///
/// # Example
///
/// ```ignore
/// assert_actions!(recorder, ["FETCH", "FETCH_OK"]);
/// ```
///
/// # Panics
///
/// Panics if the recorded sequence differs from the expected one.
#[macro_export]
macro_rules! assert_actions {
    ($recorder:expr, [$($action_type:expr),* $(,)?]) => {{
        let actual: Vec<String> = $recorder.action_types();
        let expected: Vec<String> = vec![$(String::from($action_type)),*];
        assert_eq!(
            actual, expected,
            "Unexpected action sequence\n  expected: {:?}\n  actual: {:?}",
            expected, actual
        );
    }};
}

pub use assert_actions;

/// Countdown latch for waiting on an exact number of actions.
///
/// Tests should wait for meaning, not time. Clones share the same count.
///
/// ```ignore
/// let latch = ActionLatch::new(2);
/// // ... something calls latch.dec() twice ...
/// tokio::time::timeout(Duration::from_secs(5), latch.await_zero())
///     .await
///     .expect("latch timed out");
/// ```
#[derive(Debug, Clone)]
pub struct ActionLatch {
    inner: Arc<LatchInner>,
}

#[derive(Debug)]
struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

impl ActionLatch {
    /// Create a latch expecting `expected` decrements.
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                remaining: AtomicUsize::new(expected),
                notify: Notify::new(),
            }),
        }
    }

    /// Decrement the remaining count. Extra decrements past zero are ignored.
    pub fn dec(&self) {
        let prev = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero. Returns immediately if it already has.
    pub async fn await_zero(&self) {
        loop {
            // Register before checking
            let notified = self.inner.notify.notified();

            if self.remaining() == 0 {
                return;
            }

            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

/// Middleware that records every action type in arrival order.
///
/// Clones share the same log, so keep one clone for assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingMiddleware {
    log: Arc<Mutex<Vec<String>>>,
    latch: Option<ActionLatch>,
}

impl RecordingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count down `latch` once per action, after the rest of the chain ran.
    pub fn with_latch(mut self, latch: ActionLatch) -> Self {
        self.latch = Some(latch);
        self
    }

    /// Recorded action types, oldest first.
    pub fn action_types(&self) -> Vec<String> {
        lock_unpoisoned(&self.log).clone()
    }

    /// How many times `action_type` was seen.
    pub fn count(&self, action_type: &str) -> usize {
        lock_unpoisoned(&self.log)
            .iter()
            .filter(|seen| seen.as_str() == action_type)
            .count()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.log).clear();
    }
}

#[async_trait]
impl<S, D> Middleware<S, D> for RecordingMiddleware
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
        lock_unpoisoned(&self.log).push(action.action_type().to_string());
        let result = next.run(action).await;
        if let Some(latch) = &self.latch {
            latch.dec();
        }
        result
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
