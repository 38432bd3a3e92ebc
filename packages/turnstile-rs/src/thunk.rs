//! Thunks: function-valued actions that run asynchronous work.
//!
//! A thunk receives a [`ThunkContext`] giving it `dispatch`, `get_state`,
//! the store's dependencies and its own completion token.
//!
//! # Failure Boundary
//!
//! Errors and panics raised by a thunk body are caught at the thunk boundary,
//! logged with `error!` and swallowed. They never reach the caller and never
//! stop the pipeline. The token is then resolved as usual. A thunk that wants
//! its caller to see a failure calls [`ThunkContext::reject`] itself.
//!
//! A thunk that never finishes keeps its `ASYNC_ACTION` entry on the ledger
//! forever, which blocks every exclusive admission and every idle waiter.
//! There is no cancellation at this layer.
//!
//! # Example
//!
//! ```ignore
//! let load = Thunk::new("LOAD_PROFILE", |ctx: ThunkContext<AppState, Deps>| async move {
//!     let profile = ctx.dependencies().api.profile().await?;
//!     ctx.dispatch(Action::new("PROFILE_LOADED").with_payload(serde_json::to_value(profile)?))
//!         .await;
//!     Ok(())
//! });
//!
//! let token = store.dispatch(load).await;
//! token.wait_for_completion().await;
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error};

use crate::action::Action;
use crate::ledger::ChainId;
use crate::store::{Dispatchable, Store};

pub(crate) type ThunkBody<S, D> = Arc<dyn Fn(ThunkContext<S, D>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A function-valued action together with its completion token.
pub struct Thunk<S, D> {
    token: Action,
    body: ThunkBody<S, D>,
}

impl<S, D> Thunk<S, D> {
    /// Wrap an async function as a thunk of the given type.
    pub fn new<F, Fut>(action_type: impl Into<String>, body: F) -> Self
    where
        F: Fn(ThunkContext<S, D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            token: Action::thunk(action_type),
            body: Arc::new(move |ctx| body(ctx).boxed()),
        }
    }

    /// The token that tracks this thunk.
    pub fn token(&self) -> &Action {
        &self.token
    }

    pub fn action_type(&self) -> &str {
        self.token.action_type()
    }

    pub(crate) fn into_parts(self) -> (Action, ThunkBody<S, D>) {
        (self.token, self.body)
    }
}

impl<S, D> fmt::Debug for Thunk<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thunk")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Run a thunk body, catching errors and panics at the boundary.
///
/// Returns `true` if the body completed without error.
pub(crate) async fn run_guarded<S, D>(body: ThunkBody<S, D>, ctx: ThunkContext<S, D>) -> bool {
    let action_type = ctx.token.action_type().to_string();
    let chain = ctx.chain;

    // The body may panic before it ever returns a future.
    let future = match catch_unwind(AssertUnwindSafe(|| body(ctx))) {
        Ok(future) => future,
        Err(panic) => {
            error!(
                action_type = %action_type,
                chain = %chain,
                panic = %panic_message(panic.as_ref()),
                "thunk panicked"
            );
            return false;
        }
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(action_type = %action_type, chain = %chain, "thunk finished");
            true
        }
        Ok(Err(e)) => {
            error!(action_type = %action_type, chain = %chain, error = %e, "thunk failed");
            false
        }
        Err(panic) => {
            error!(
                action_type = %action_type,
                chain = %chain,
                panic = %panic_message(panic.as_ref()),
                "thunk panicked"
            );
            false
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Thunk Context
// =============================================================================

/// Capabilities handed to a running thunk.
///
/// Dispatches made through the context join the thunk's chain and bypass
/// admission. Dispatching through a captured `Store` instead would queue behind
/// the thunk itself under the exclusive strategy.
pub struct ThunkContext<S, D> {
    store: Store<S, D>,
    chain: ChainId,
    token: Action,
}

impl<S, D> Clone for ThunkContext<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            chain: self.chain,
            token: self.token.clone(),
        }
    }
}

impl<S, D> ThunkContext<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub(crate) fn new(store: Store<S, D>, chain: ChainId, token: Action) -> Self {
        Self {
            store,
            chain,
            token,
        }
    }

    /// Dispatch as part of this thunk's chain.
    pub async fn dispatch(&self, dispatchable: impl Into<Dispatchable<S, D>>) -> Action {
        self.store
            .dispatch_in_chain(dispatchable.into(), self.chain)
            .await
    }

    /// Clone of the current state.
    pub fn get_state(&self) -> S {
        self.store.state()
    }

    /// Read the current state without cloning it.
    pub fn with_state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        self.store.with_state(f)
    }

    pub fn dependencies(&self) -> &D {
        self.store.dependencies()
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// This thunk's completion token.
    pub fn token(&self) -> &Action {
        &self.token
    }

    /// Settle this thunk's token early.
    pub fn resolve(&self) -> bool {
        self.token.resolve()
    }

    /// Reject this thunk's token. The caller observes the reason.
    pub fn reject(&self, reason: impl fmt::Display) -> bool {
        self.token.reject(reason)
    }
}

impl<S, D> fmt::Debug for ThunkContext<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThunkContext")
            .field("chain", &self.chain)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}
