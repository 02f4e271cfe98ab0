//! Expansion of asynchronous actions into loading/success/error follow-ups.
//!
//! An action whose type ends in the configured suffix (default `_ASYNC`)
//! never reaches the reducer. Instead the expander:
//!
//! 1. queues `<BASE>_LOADING` with `{requestId}`,
//! 2. cancels the original action,
//! 3. records the request as pending,
//! 4. runs the resolver registered for the action type on a spawned task,
//! 5. dispatches `<BASE>_SUCCESS` with `{requestId, result, originalPayload}`
//!    or `<BASE>_ERROR` with `{requestId, error, originalPayload}`,
//! 6. drops the pending entry, whatever happened before.
//!
//! Resolver failures become `_ERROR` actions; they are never returned to
//! the dispatcher.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::watch;

use crate::action::{Action, ActionOrigin};
use crate::error::BoxError;
use crate::middleware::{Flow, Middleware, MiddlewareHandle, StageFuture};
use crate::store::{Store, lock};

/// Boxed future returned by [`Resolver::resolve`].
pub type ResolveFuture = Pin<Box<dyn Future<Output = Result<Value, BoxError>> + Send + 'static>>;

/// Host-supplied handler that settles one kind of asynchronous action.
///
/// The engine performs no I/O itself: everything that talks to the outside
/// world lives behind this trait.
pub trait Resolver: Send + Sync + 'static {
    /// Produce the eventual result for `action`.
    fn resolve(&self, action: &Action) -> ResolveFuture;
}

struct FnResolver<F>(F);

impl<F, Fut> Resolver for FnResolver<F>
where
    F: Fn(Action) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    fn resolve(&self, action: &Action) -> ResolveFuture {
        Box::pin((self.0)(action.clone()))
    }
}

/// An asynchronous request that has not settled yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAsyncRequest {
    /// Identifier shared by the request's LOADING and SUCCESS/ERROR actions.
    pub request_id: String,
    /// The `_ASYNC` action that started the request.
    pub originating_action: Action,
}

struct ExpanderInner {
    suffix: String,
    resolvers: Mutex<HashMap<String, Arc<dyn Resolver>>>,
    counters: Mutex<HashMap<String, u64>>,
    pending: Mutex<HashMap<String, PendingAsyncRequest>>,
    pending_count: watch::Sender<usize>,
}

impl ExpanderInner {
    /// Next request id for `base`: `<base>-<n>`, `n` counting from 1 per base type.
    fn next_request_id(&self, base: &str) -> String {
        let mut counters = lock(&self.counters);
        let counter = counters.entry(base.to_string()).or_insert(0);
        *counter += 1;
        format!("{base}-{counter}")
    }

    fn track(&self, request: PendingAsyncRequest) {
        let mut pending = lock(&self.pending);
        pending.insert(request.request_id.clone(), request);
        self.pending_count.send_replace(pending.len());
    }

    fn settle(&self, request_id: &str) {
        let mut pending = lock(&self.pending);
        pending.remove(request_id);
        self.pending_count.send_replace(pending.len());
    }

    fn resolver(&self, action_type: &str) -> Option<Arc<dyn Resolver>> {
        lock(&self.resolvers).get(action_type).cloned()
    }
}

/// Removes a request from the pending map when dropped, so cleanup also
/// happens if the resolver panics.
struct SettleOnDrop {
    inner: Arc<ExpanderInner>,
    request_id: String,
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        self.inner.settle(&self.request_id);
    }
}

/// The pipeline stage itself.
struct ExpanderStage {
    inner: Arc<ExpanderInner>,
}

impl Middleware for ExpanderStage {
    fn process<'a>(&'a self, store: &'a Store, action: Action) -> StageFuture<'a> {
        let flow = match action.action_type.strip_suffix(self.inner.suffix.as_str()) {
            Some(base) if !base.is_empty() => {
                let base = base.to_string();
                self.expand(store, base, action);
                Flow::Cancel
            }
            _ => Flow::Continue(action),
        };
        Box::pin(std::future::ready(Ok(flow)))
    }
}

impl ExpanderStage {
    fn expand(&self, store: &Store, base: String, action: Action) {
        let request_id = self.inner.next_request_id(&base);
        tracing::debug!(
            action_type = %action.action_type,
            request_id = %request_id,
            "expanding async action"
        );

        store.enqueue_action(
            Action::new(format!("{base}_LOADING"), json!({ "requestId": request_id }))
                .with_origin(ActionOrigin::FollowUp),
        );

        self.inner.track(PendingAsyncRequest {
            request_id: request_id.clone(),
            originating_action: action.clone(),
        });

        let resolver = self.inner.resolver(&action.action_type);
        let guard = SettleOnDrop {
            inner: Arc::clone(&self.inner),
            request_id,
        };
        let store = store.clone();
        tokio::spawn(async move {
            let outcome = match resolver {
                Some(resolver) => resolver.resolve(&action).await,
                None => Err(format!("no resolver registered for `{}`", action.action_type).into()),
            };

            let follow_up = match outcome {
                Ok(result) => Action::new(
                    format!("{base}_SUCCESS"),
                    json!({
                        "requestId": guard.request_id,
                        "result": result,
                        "originalPayload": action.payload,
                    }),
                ),
                Err(e) => {
                    tracing::warn!(
                        action_type = %action.action_type,
                        request_id = %guard.request_id,
                        error = %e,
                        "async action failed"
                    );
                    Action::new(
                        format!("{base}_ERROR"),
                        json!({
                            "requestId": guard.request_id,
                            "error": e.to_string(),
                            "originalPayload": action.payload,
                        }),
                    )
                }
            }
            .with_origin(ActionOrigin::FollowUp);

            if let Err(e) = store.dispatch_action(follow_up).await {
                tracing::error!(
                    request_id = %guard.request_id,
                    error = %e,
                    "failed to dispatch async follow-up"
                );
            }
            drop(guard);
        });
    }
}

/// Installs and controls the async-action stage of a store.
///
/// `Clone` is cheap; all clones share resolvers and the pending map.
#[derive(Clone)]
pub struct AsyncActionExpander {
    inner: Arc<ExpanderInner>,
    handle: MiddlewareHandle,
}

impl std::fmt::Debug for AsyncActionExpander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncActionExpander")
            .field("suffix", &self.inner.suffix)
            .field("pending", &*self.inner.pending_count.borrow())
            .finish()
    }
}

impl AsyncActionExpander {
    /// Register the expander as a regular pipeline stage on `store`.
    ///
    /// The stage takes its position among other regular stages in
    /// registration order. The async suffix comes from the store's
    /// [`StoreConfig`](crate::StoreConfig).
    pub fn install(store: &Store) -> Self {
        let (pending_count, _) = watch::channel(0);
        let inner = Arc::new(ExpanderInner {
            suffix: store.config().async_suffix.clone(),
            resolvers: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_count,
        });
        let handle = store.add_middleware(ExpanderStage {
            inner: Arc::clone(&inner),
        });
        Self { inner, handle }
    }

    /// Register a closure resolving actions of type `action_type`.
    ///
    /// `action_type` is the full dispatched type, suffix included
    /// (e.g. `"FETCH_USER_ASYNC"`). A later registration for the same
    /// type replaces the earlier one.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use statefold::{AsyncActionExpander, BoxError, Store};
    ///
    /// let store = Store::new();
    /// let expander = AsyncActionExpander::install(&store);
    /// expander.register("FETCH_USER_ASYNC", |action| async move {
    ///     Ok::<_, BoxError>(json!({"id": action.payload["id"], "name": "ada"}))
    /// });
    /// ```
    pub fn register<F, Fut>(&self, action_type: impl Into<String>, resolver: F)
    where
        F: Fn(Action) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.register_resolver(action_type, FnResolver(resolver));
    }

    /// Register a [`Resolver`] implementation for `action_type`.
    pub fn register_resolver(&self, action_type: impl Into<String>, resolver: impl Resolver) {
        lock(&self.inner.resolvers).insert(action_type.into(), Arc::new(resolver));
    }

    /// Requests that have been started but not settled.
    pub fn pending(&self) -> Vec<PendingAsyncRequest> {
        lock(&self.inner.pending).values().cloned().collect()
    }

    /// Wait until no request is pending.
    ///
    /// A request settles only after its `_SUCCESS` or `_ERROR` action was
    /// applied, so the state reflects every resolved request once this
    /// returns. Returns immediately if nothing is in flight.
    pub async fn settled(&self) {
        let mut rx = self.inner.pending_count.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Remove the stage from `store`. Requests already in flight still settle.
    pub fn uninstall(&self, store: &Store) {
        store.remove_middleware(self.handle);
    }
}
