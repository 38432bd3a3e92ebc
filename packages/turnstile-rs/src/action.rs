//! Completion tokens: an immutable action descriptor paired with a
//! manually-settled completion.
//!
//! An [`Action`] is what callers dispatch and what the store hands back. The
//! descriptor (`type`, `payload`, `error`, `meta`, `source`) never changes once
//! built. The completion is shared by every clone of the token and settles
//! **at most once**: the first `resolve`/`reject` wins and every later call is a
//! silent no-op.
//!
//! ```text
//! Pending ──resolve()──► Resolved
//!    │
//!    └────reject(r)────► Rejected(r)
//! ```
//!
//! Middleware that transforms an action (`with_payload`, `with_meta`, ...)
//! produces a new descriptor that keeps the original completion, so the caller
//! holding the original token still observes settlement.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::StoreError;
use crate::lock_unpoisoned;

/// Whether a token wraps a plain action or a thunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Built from a type string; reaches the reducer.
    Plain,
    /// Built from a function; runs asynchronous work instead of reducing.
    Thunk,
}

/// Settlement state of a completion token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Work is still outstanding.
    Pending,
    /// Work finished successfully.
    Resolved,
    /// Work was rejected with a reason.
    Rejected(String),
}

impl Settlement {
    /// Returns true while the token has not settled.
    pub fn is_pending(&self) -> bool {
        matches!(self, Settlement::Pending)
    }

    /// Returns true once the token has settled either way.
    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// Returns true if the token resolved.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Settlement::Resolved)
    }

    /// Returns true if the token was rejected.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Settlement::Rejected(_))
    }

    /// Convert a settled state into a `Result`.
    ///
    /// `Pending` maps to `Ok(())`: callers only reach this after waiting.
    pub fn into_result(self, action_type: impl Into<String>) -> Result<(), StoreError> {
        match self {
            Settlement::Rejected(reason) => Err(StoreError::Rejected {
                action_type: action_type.into(),
                reason,
            }),
            Settlement::Pending | Settlement::Resolved => Ok(()),
        }
    }
}

// =============================================================================
// Completion
// =============================================================================

/// The settle-once half of a token.
struct Completion {
    state: Mutex<Settlement>,
    notify: Notify,
}

impl Completion {
    fn new() -> Self {
        Self {
            state: Mutex::new(Settlement::Pending),
            notify: Notify::new(),
        }
    }

    fn current(&self) -> Settlement {
        lock_unpoisoned(&self.state).clone()
    }

    /// Move to `to` if still pending. Returns whether this call settled it.
    fn settle(&self, to: Settlement) -> bool {
        let mut guard = lock_unpoisoned(&self.state);
        if guard.is_settled() {
            return false;
        }
        *guard = to;
        drop(guard);
        self.notify.notify_waiters();
        true
    }

    async fn wait(&self) -> Settlement {
        loop {
            // Register before checking so a settle between the two is not lost.
            let notified = self.notify.notified();
            let current = self.current();
            if current.is_settled() {
                return current;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Action
// =============================================================================

#[derive(Debug, Clone, Serialize)]
struct Descriptor {
    #[serde(rename = "type")]
    action_type: String,
    kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<Value>,
}

/// A dispatched unit of work: descriptor plus completion token.
///
/// Cloning is cheap and every clone shares the same completion.
///
/// # Example
///
/// ```ignore
/// let token = Action::new("INC").with_payload(serde_json::json!(1));
/// assert!(!token.is_async());
///
/// token.resolve();
/// token.reject("too late"); // ignored, already settled
/// assert!(token.settlement().is_resolved());
/// ```
#[derive(Clone)]
pub struct Action {
    descriptor: Arc<Descriptor>,
    completion: Arc<Completion>,
}

impl Action {
    /// Create a plain, synchronous action of the given type.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self::with_kind(action_type.into(), ActionKind::Plain)
    }

    /// Create the token that tracks a thunk of the given type.
    pub(crate) fn thunk(action_type: impl Into<String>) -> Self {
        Self::with_kind(action_type.into(), ActionKind::Thunk)
    }

    fn with_kind(action_type: String, kind: ActionKind) -> Self {
        Self {
            descriptor: Arc::new(Descriptor {
                action_type,
                kind,
                payload: None,
                error: false,
                meta: None,
                source: None,
            }),
            completion: Arc::new(Completion::new()),
        }
    }

    fn map_descriptor(self, f: impl FnOnce(&mut Descriptor)) -> Self {
        let mut descriptor = (*self.descriptor).clone();
        f(&mut descriptor);
        Self {
            descriptor: Arc::new(descriptor),
            completion: self.completion,
        }
    }

    /// Attach a payload. The completion is shared with `self`.
    pub fn with_payload(self, payload: Value) -> Self {
        self.map_descriptor(|d| d.payload = Some(payload))
    }

    /// Attach metadata. The completion is shared with `self`.
    pub fn with_meta(self, meta: Value) -> Self {
        self.map_descriptor(|d| d.meta = Some(meta))
    }

    /// Flag this action as describing an error.
    pub fn with_error(self, error: bool) -> Self {
        self.map_descriptor(|d| d.error = error)
    }

    /// Record where this action came from.
    pub fn with_source(self, source: Value) -> Self {
        self.map_descriptor(|d| d.source = Some(source))
    }

    /// The action's type string.
    pub fn action_type(&self) -> &str {
        &self.descriptor.action_type
    }

    /// Plain action or thunk.
    pub fn kind(&self) -> ActionKind {
        self.descriptor.kind
    }

    /// True iff this token was created for a thunk.
    pub fn is_async(&self) -> bool {
        self.descriptor.kind == ActionKind::Thunk
    }

    /// Raw payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.descriptor.payload.as_ref()
    }

    /// Deserialize the payload into `T`.
    ///
    /// Returns `None` when there is no payload or it has a different shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        let payload = self.descriptor.payload.as_ref()?;
        match serde_json::from_value(payload.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(
                    action_type = %self.descriptor.action_type,
                    error = %e,
                    "payload does not match requested type"
                );
                None
            }
        }
    }

    /// Whether the action describes an error.
    pub fn is_error(&self) -> bool {
        self.descriptor.error
    }

    /// Metadata, if any.
    pub fn meta(&self) -> Option<&Value> {
        self.descriptor.meta.as_ref()
    }

    /// Source, if any.
    pub fn source(&self) -> Option<&Value> {
        self.descriptor.source.as_ref()
    }

    /// Settle successfully. No-op if already settled.
    ///
    /// Returns true if this call performed the settlement.
    pub fn resolve(&self) -> bool {
        self.completion.settle(Settlement::Resolved)
    }

    /// Settle as rejected. No-op if already settled.
    ///
    /// Returns true if this call performed the settlement.
    pub fn reject(&self, reason: impl fmt::Display) -> bool {
        self.completion.settle(Settlement::Rejected(reason.to_string()))
    }

    /// True once the token has settled.
    pub fn has_executed(&self) -> bool {
        self.completion.current().is_settled()
    }

    /// Current settlement state.
    pub fn settlement(&self) -> Settlement {
        self.completion.current()
    }

    /// Wait until the token settles. Returns immediately if it already has.
    pub async fn wait_for_completion(&self) -> Settlement {
        self.completion.wait().await
    }

    /// Wait for settlement and convert it into a `Result`.
    pub async fn outcome(&self) -> Result<(), StoreError> {
        self.wait_for_completion()
            .await
            .into_result(self.action_type())
    }

    /// True if both tokens share one completion (one unit of work).
    pub fn same_completion(&self, other: &Action) -> bool {
        Arc::ptr_eq(&self.completion, &other.completion)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("type", &self.descriptor.action_type)
            .field("kind", &self.descriptor.kind)
            .field("payload", &self.descriptor.payload)
            .field("settlement", &self.completion.current())
            .finish_non_exhaustive()
    }
}

impl Serialize for Action {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        self.descriptor.serialize(serializer)
    }
}
