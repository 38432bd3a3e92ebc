//! Action creators and binding them to a dispatcher.
//!
//! ```text
//! create_action("ADD_TODO", |text: String| Some(Todo::new(text)))
//!     │
//!     ▼ .create(text)
//! Action { type: "ADD_TODO", payload: {...} }
//!
//! bind_action_creators(Bindable::map([("add", add_todo)]), store)
//!     │
//!     ▼ .call("add", text)
//! store.dispatch(add_todo.create(text))  ─►  Action (token)
//! ```
//!
//! Creators match tokens by type string, never by identity.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::action::Action;
use crate::error::StoreError;
use crate::store::{Dispatch, Dispatchable};
use crate::thunk::{Thunk, ThunkContext};

type PayloadFn<A> = Arc<dyn Fn(A) -> Option<Value> + Send + Sync>;

/// Builds plain actions of one type.
pub struct ActionCreator<A = ()> {
    action_type: Arc<str>,
    payload: Option<PayloadFn<A>>,
}

impl<A> Clone for ActionCreator<A> {
    fn clone(&self) -> Self {
        Self {
            action_type: self.action_type.clone(),
            payload: self.payload.clone(),
        }
    }
}

impl<A> ActionCreator<A> {
    /// Build a token from `args`.
    pub fn create(&self, args: A) -> Action {
        let action = Action::new(&*self.action_type);
        let Some(payload_fn) = &self.payload else {
            return action;
        };

        match payload_fn(args) {
            Some(Value::Null) | None => {
                warn!(action_type = %self.action_type, "payload creator returned nothing");
                action
            }
            Some(payload) => attach_payload(action, payload),
        }
    }

    /// Whether `action` was built by a creator of this type.
    pub fn matches(&self, action: &Action) -> bool {
        action.action_type() == &*self.action_type
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }
}

impl ActionCreator<()> {
    /// Build a token for a creator that takes no arguments.
    pub fn action(&self) -> Action {
        self.create(())
    }
}

impl<A> fmt::Debug for ActionCreator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionCreator")
            .field("action_type", &self.action_type)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Lift `meta` and `error` out of an object payload.
fn attach_payload(action: Action, payload: Value) -> Action {
    let mut action = action;
    if let Value::Object(fields) = &payload {
        if let Some(meta) = fields.get("meta") {
            action = action.with_meta(meta.clone());
        }
        if fields.get("error").and_then(Value::as_bool) == Some(true) {
            action = action.with_error(true);
        }
    }
    action.with_payload(payload)
}

/// Creator for payload-less actions of `action_type`.
pub fn create_action(action_type: impl Into<String>) -> ActionCreator<()> {
    ActionCreator {
        action_type: Arc::from(action_type.into()),
        payload: None,
    }
}

/// Creator whose payload is computed from the call arguments.
///
/// A payload creator returning `None`, or a payload that fails to serialize,
/// is logged and yields a token without payload. Dispatch is never blocked.
pub fn create_action_with<A, P, F>(action_type: impl Into<String>, payload_creator: F) -> ActionCreator<A>
where
    F: Fn(A) -> Option<P> + Send + Sync + 'static,
    P: Serialize,
{
    let action_type: Arc<str> = Arc::from(action_type.into());
    let label = action_type.clone();

    ActionCreator {
        action_type,
        payload: Some(Arc::new(move |args| {
            let payload = payload_creator(args)?;
            match serde_json::to_value(payload) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(action_type = %label, error = %e, "payload failed to serialize");
                    None
                }
            }
        })),
    }
}

// =============================================================================
// Thunk Creators
// =============================================================================

type ThunkFn<A, S, D> = Arc<dyn Fn(A, ThunkContext<S, D>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Builds thunks of one type from call arguments.
pub struct ThunkCreator<A, S, D> {
    action_type: Arc<str>,
    body: ThunkFn<A, S, D>,
}

impl<A, S, D> Clone for ThunkCreator<A, S, D> {
    fn clone(&self) -> Self {
        Self {
            action_type: self.action_type.clone(),
            body: self.body.clone(),
        }
    }
}

impl<A, S, D> ThunkCreator<A, S, D>
where
    A: Clone + Send + Sync + 'static,
    S: 'static,
    D: 'static,
{
    pub fn create(&self, args: A) -> Thunk<S, D> {
        let body = self.body.clone();
        Thunk::new(self.action_type.to_string(), move |ctx| {
            body(args.clone(), ctx)
        })
    }
}

impl<A, S, D> ThunkCreator<A, S, D> {
    pub fn matches(&self, action: &Action) -> bool {
        action.action_type() == &*self.action_type
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }
}

impl<A, S, D> fmt::Debug for ThunkCreator<A, S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThunkCreator")
            .field("action_type", &self.action_type)
            .finish_non_exhaustive()
    }
}

/// Creator for thunks whose body receives the call arguments and a context.
///
/// # Example
///
/// ```ignore
/// let fetch_user = create_thunk("FETCH_USER", |id: u64, ctx: ThunkContext<AppState, Deps>| async move {
///     let user = ctx.dependencies().users.get(id).await?;
///     ctx.dispatch(user_loaded.create(user)).await;
///     Ok(())
/// });
///
/// store.dispatch(fetch_user.create(42)).await;
/// ```
pub fn create_thunk<A, S, D, F, Fut>(action_type: impl Into<String>, body: F) -> ThunkCreator<A, S, D>
where
    F: Fn(A, ThunkContext<S, D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    ThunkCreator {
        action_type: Arc::from(action_type.into()),
        body: Arc::new(move |args, ctx| body(args, ctx).boxed()),
    }
}

// =============================================================================
// Binding
// =============================================================================

/// A creator whose arguments arrive as JSON.
///
/// Implemented for [`ActionCreator`] and [`ThunkCreator`] so that creators of
/// different argument types can be bound together.
pub trait Creator<S, D>: Send + Sync + 'static {
    fn action_type(&self) -> &str;

    /// Build the dispatchable from JSON arguments.
    fn build(&self, args: Value) -> Result<Dispatchable<S, D>, serde_json::Error>;

    fn matches(&self, action: &Action) -> bool {
        action.action_type() == self.action_type()
    }
}

impl<A, S, D> Creator<S, D> for ActionCreator<A>
where
    A: DeserializeOwned + 'static,
{
    fn action_type(&self) -> &str {
        ActionCreator::action_type(self)
    }

    fn build(&self, args: Value) -> Result<Dispatchable<S, D>, serde_json::Error> {
        let args = serde_json::from_value(args)?;
        Ok(Dispatchable::Action(self.create(args)))
    }
}

impl<A, S, D> Creator<S, D> for ThunkCreator<A, S, D>
where
    A: DeserializeOwned + Clone + Send + Sync + 'static,
    S: 'static,
    D: 'static,
{
    fn action_type(&self) -> &str {
        ThunkCreator::action_type(self)
    }

    fn build(&self, args: Value) -> Result<Dispatchable<S, D>, serde_json::Error> {
        let args = serde_json::from_value(args)?;
        Ok(Dispatchable::Thunk(self.create(args)))
    }
}

/// Input to [`bind_action_creators`].
pub enum Bindable<S, D> {
    /// A single creator.
    Creator(Arc<dyn Creator<S, D>>),
    /// Named entries. Only `Creator` entries are bound.
    Map(Vec<(String, Bindable<S, D>)>),
    /// Anything that is not a creator.
    Value(Value),
}

impl<S, D> Bindable<S, D> {
    pub fn creator(creator: impl Creator<S, D>) -> Self {
        Bindable::Creator(Arc::new(creator))
    }

    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Bindable<S, D>)>,
    {
        Bindable::Map(
            entries
                .into_iter()
                .map(|(name, entry)| (name.into(), entry))
                .collect(),
        )
    }

    fn describe(&self) -> &'static str {
        match self {
            Bindable::Creator(_) => "creator",
            Bindable::Map(_) => "map",
            Bindable::Value(_) => "value",
        }
    }
}

impl<A, S, D> From<ActionCreator<A>> for Bindable<S, D>
where
    A: DeserializeOwned + 'static,
{
    fn from(creator: ActionCreator<A>) -> Self {
        Bindable::creator(creator)
    }
}

impl<A, S, D> From<ThunkCreator<A, S, D>> for Bindable<S, D>
where
    A: DeserializeOwned + Clone + Send + Sync + 'static,
    S: 'static,
    D: 'static,
{
    fn from(creator: ThunkCreator<A, S, D>) -> Self {
        Bindable::creator(creator)
    }
}

impl<S, D> From<Value> for Bindable<S, D> {
    fn from(value: Value) -> Self {
        Bindable::Value(value)
    }
}

/// Creators bound to a dispatcher: calling one dispatches what it builds.
pub struct BoundCreators<S, D> {
    dispatcher: Arc<dyn Dispatch<S, D>>,
    single: Option<Arc<dyn Creator<S, D>>>,
    named: Vec<(String, Arc<dyn Creator<S, D>>)>,
}

impl<S, D> BoundCreators<S, D>
where
    S: 'static,
    D: 'static,
{
    /// Build and dispatch through the creator bound as `name`.
    pub async fn call(&self, name: &str, args: impl Serialize) -> Result<Action, StoreError> {
        let creator = self
            .named
            .iter()
            .find(|(bound, _)| bound == name)
            .map(|(_, creator)| creator.clone())
            .ok_or_else(|| StoreError::UnknownCreator {
                name: name.to_string(),
            })?;
        self.invoke(name, creator.as_ref(), args).await
    }

    /// Build and dispatch through the single bound creator.
    pub async fn call_single(&self, args: impl Serialize) -> Result<Action, StoreError> {
        let creator = self.single.clone().ok_or_else(|| StoreError::UnknownCreator {
            name: "<single>".to_string(),
        })?;
        let name = creator.action_type().to_string();
        self.invoke(&name, creator.as_ref(), args).await
    }

    async fn invoke(
        &self,
        name: &str,
        creator: &dyn Creator<S, D>,
        args: impl Serialize,
    ) -> Result<Action, StoreError> {
        let dispatchable = serde_json::to_value(args)
            .and_then(|args| creator.build(args))
            .map_err(|e| StoreError::InvalidArguments {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(self.dispatcher.submit(dispatchable).await)
    }

    /// Bound names in binding order.
    pub fn names(&self) -> Vec<&str> {
        self.named.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.named.iter().any(|(bound, _)| bound == name)
    }

    /// Whether a single creator (not a map) was bound.
    pub fn is_single(&self) -> bool {
        self.single.is_some()
    }

    /// True when nothing callable was bound.
    pub fn is_empty(&self) -> bool {
        self.single.is_none() && self.named.is_empty()
    }
}

impl<S, D> fmt::Debug for BoundCreators<S, D>
where
    S: 'static,
    D: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundCreators")
            .field("single", &self.single.as_ref().map(|c| c.action_type().to_string()))
            .field("named", &self.names())
            .finish()
    }
}

/// Bind a creator, or a map of creators, to `dispatcher`.
///
/// Map entries that are not creators are skipped. Input that is neither a
/// creator nor a map is logged and yields an empty set.
pub fn bind_action_creators<S, D>(
    creators: Bindable<S, D>,
    dispatcher: impl Dispatch<S, D> + 'static,
) -> BoundCreators<S, D> {
    let mut bound = BoundCreators {
        dispatcher: Arc::new(dispatcher),
        single: None,
        named: Vec::new(),
    };

    match creators {
        Bindable::Creator(creator) => bound.single = Some(creator),
        Bindable::Map(entries) => {
            for (name, entry) in entries {
                match entry {
                    Bindable::Creator(creator) => bound.named.push((name, creator)),
                    other => {
                        debug!(name = %name, kind = other.describe(), "skipping non-callable entry");
                    }
                }
            }
        }
        Bindable::Value(value) => {
            warn!(value = %value, "bind_action_creators expected a creator or a map of creators");
        }
    }

    bound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreBuilder};
    use serde::Deserialize;

    fn counter(state: &i64, action: &Action) -> i64 {
        match action.action_type() {
            "INC" => state + 1,
            "ADD" => state + action.payload_as::<i64>().unwrap_or(0),
            _ => *state,
        }
    }

    fn store() -> Store<i64> {
        StoreBuilder::new(0i64, counter).build()
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    #[test]
    fn test_create_action_without_payload() {
        let inc = create_action("INC");
        let action = inc.action();

        assert_eq!(action.action_type(), "INC");
        assert!(action.payload().is_none());
        assert!(!action.is_async());
        assert!(inc.matches(&action));
        assert!(!inc.matches(&Action::new("DEC")));
    }

    #[test]
    fn test_matching_is_by_type_not_identity() {
        let first = create_action("INC");
        let second = create_action("INC");
        assert!(second.matches(&first.action()));
    }

    #[test]
    fn test_payload_creator() {
        let add_note = create_action_with("ADD_NOTE", |text: &str| {
            Some(Note {
                text: text.to_string(),
            })
        });

        let action = add_note.create("hello");
        let note: Note = action.payload_as().unwrap();
        assert_eq!(note.text, "hello");
        assert!(action.meta().is_none());
        assert!(!action.is_error());
    }

    #[test]
    fn test_payload_creator_returning_none_still_builds() {
        let maybe = create_action_with("MAYBE", |n: i64| if n > 0 { Some(n) } else { None });

        assert_eq!(maybe.create(3).payload_as::<i64>(), Some(3));

        let empty = maybe.create(-1);
        assert_eq!(empty.action_type(), "MAYBE");
        assert!(empty.payload().is_none());
    }

    #[test]
    fn test_meta_and_error_lifted_from_payload() {
        let failed = create_action_with("SAVE_FAILED", |reason: &str| {
            Some(serde_json::json!({
                "reason": reason,
                "error": true,
                "meta": { "retry": 3 }
            }))
        });

        let action = failed.create("disk full");
        assert!(action.is_error());
        assert_eq!(action.meta(), Some(&serde_json::json!({ "retry": 3 })));
        assert_eq!(action.payload().unwrap()["reason"], "disk full");
    }

    #[tokio::test]
    async fn test_thunk_creator() {
        let store = store();
        let add_later = create_thunk("ADD_LATER", |n: i64, ctx: ThunkContext<i64, ()>| async move {
            ctx.dispatch(Action::new("ADD").with_payload(serde_json::json!(n)))
                .await;
            Ok(())
        });

        let thunk = add_later.create(7);
        assert!(add_later.matches(thunk.token()));

        store.dispatch(thunk).await.wait_for_completion().await;
        assert_eq!(store.state(), 7);
    }

    #[tokio::test]
    async fn test_bound_map_dispatches_matching_token() {
        let store = store();
        let inc = create_action("INC");

        let bound = bind_action_creators(Bindable::map([("inc", inc.clone().into())]), store.clone());

        let token = bound.call("inc", ()).await.unwrap();
        assert!(inc.matches(&token));
        assert!(token.settlement().is_resolved());
        assert_eq!(store.state(), 1);
    }

    #[tokio::test]
    async fn test_bound_map_mixes_creator_types() {
        let store = store();
        let add = create_action_with("ADD", |n: i64| Some(n));
        let add_twice = create_thunk("ADD_TWICE", |n: i64, ctx: ThunkContext<i64, ()>| async move {
            for _ in 0..2 {
                ctx.dispatch(Action::new("ADD").with_payload(serde_json::json!(n)))
                    .await;
            }
            Ok(())
        });

        let bound = bind_action_creators(
            Bindable::map([("add", add.into()), ("add_twice", add_twice.into())]),
            store.clone(),
        );
        assert_eq!(bound.names(), vec!["add", "add_twice"]);

        bound.call("add", 5).await.unwrap();
        let token = bound.call("add_twice", 10).await.unwrap();
        token.wait_for_completion().await;

        assert_eq!(store.state(), 25);
    }

    #[tokio::test]
    async fn test_single_creator_binding() {
        let store = store();
        let bound = bind_action_creators(create_action("INC").into(), store.clone());

        assert!(bound.is_single());
        assert!(format!("{:?}", bound).contains("INC"));
        bound.call_single(()).await.unwrap();
        assert_eq!(store.state(), 1);

        let err = bound.call("inc", ()).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownCreator { .. }));
    }

    #[tokio::test]
    async fn test_non_callable_entries_are_skipped() {
        let store = store();
        let bound = bind_action_creators(
            Bindable::map([
                ("inc", create_action("INC").into()),
                ("version", Bindable::Value(serde_json::json!("1.0"))),
                ("nested", Bindable::map::<String, _>(Vec::new())),
            ]),
            store,
        );

        assert_eq!(bound.names(), vec!["inc"]);
        assert!(!bound.contains("version"));
    }

    #[test]
    fn test_non_map_input_yields_empty_set() {
        let bound = bind_action_creators(Bindable::<i64, ()>::Value(serde_json::json!(42)), store());
        assert!(bound.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_name_and_bad_arguments() {
        let store = store();
        let add = create_action_with("ADD", |n: i64| Some(n));
        let bound = bind_action_creators(Bindable::map([("add", add.into())]), store.clone());

        let err = bound.call("missing", ()).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownCreator { ref name } if name == "missing"));

        let err = bound.call("add", "not a number").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArguments { .. }));
        assert_eq!(store.state(), 0);
    }
}
