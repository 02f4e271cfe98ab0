//! Ordered middleware pipeline with short-circuit cancellation.
//!
//! Stages run strictly in registration order. Each stage receives the
//! action returned by the previous one and may replace it, cancel it, or
//! fail. Tail stages always run after every regular stage; recorders
//! install themselves there so they only observe actions that survived
//! everything else.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::action::Action;
use crate::error::BoxError;
use crate::state::StateMap;
use crate::store::Store;

/// Boxed future returned by [`Middleware::process`].
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<Flow, BoxError>> + Send + 'a>>;

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Hand this action to the next stage (or the reducer).
    Continue(Action),
    /// Halt the pipeline: no reduction, no mutation, no notification.
    Cancel,
}

/// A pipeline stage.
///
/// # Contract
///
/// - [`process`](Middleware::process) takes the action by value and must
///   return a new action, `Flow::Cancel`, or an error. Returning an error
///   aborts the dispatch with no state mutation.
/// - Stages may call [`Store::enqueue`] or [`Store::dispatch`] to issue
///   follow-up actions; those are queued and run after the current action.
///   Awaiting `dispatch` from inside a stage returns immediately because a
///   drain loop is already active.
/// - [`on_commit`](Middleware::on_commit) runs after the reducer applied a
///   surviving action, with the resulting state. It must not block.
pub trait Middleware: Send + Sync + 'static {
    /// Transform, cancel, or reject an action.
    fn process<'a>(&'a self, store: &'a Store, action: Action) -> StageFuture<'a>;

    /// Observe an action after its mutations were applied.
    fn on_commit(&self, _action: &Action, _state: &StateMap) {}
}

/// Opaque handle identifying a registered stage, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiddlewareHandle(u64);

/// Synchronous stage built from a closure. See [`stage_fn`].
pub struct FnStage<F>(F);

impl<F> Middleware for FnStage<F>
where
    F: Fn(Action) -> Result<Flow, BoxError> + Send + Sync + 'static,
{
    fn process<'a>(&'a self, _store: &'a Store, action: Action) -> StageFuture<'a> {
        let result = (self.0)(action);
        Box::pin(std::future::ready(result))
    }
}

/// Wrap a synchronous closure as a pipeline stage.
///
/// # Examples
///
/// ```
/// use statefold::{Flow, stage_fn};
///
/// // Drop every action whose type starts with "DEBUG_".
/// let stage = stage_fn(|action| {
///     if action.action_type.starts_with("DEBUG_") {
///         Ok(Flow::Cancel)
///     } else {
///         Ok(Flow::Continue(action))
///     }
/// });
/// # let _ = stage;
/// ```
pub fn stage_fn<F>(f: F) -> FnStage<F>
where
    F: Fn(Action) -> Result<Flow, BoxError> + Send + Sync + 'static,
{
    FnStage(f)
}

/// Asynchronous stage built from a closure returning a future. See [`async_stage`].
pub struct AsyncFnStage<F>(F);

impl<F, Fut> Middleware for AsyncFnStage<F>
where
    F: Fn(Action) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Flow, BoxError>> + Send + 'static,
{
    fn process<'a>(&'a self, _store: &'a Store, action: Action) -> StageFuture<'a> {
        Box::pin((self.0)(action))
    }
}

/// Wrap a closure returning a future as a pipeline stage.
///
/// The pipeline awaits the future before invoking the next stage, so
/// ordering holds even when stages suspend.
pub fn async_stage<F, Fut>(f: F) -> AsyncFnStage<F>
where
    F: Fn(Action) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Flow, BoxError>> + Send + 'static,
{
    AsyncFnStage(f)
}

/// Registered stages, split into the regular segment and the tail.
#[derive(Default)]
pub(crate) struct MiddlewarePipeline {
    next_id: u64,
    stages: Vec<(MiddlewareHandle, Arc<dyn Middleware>)>,
    tail: Vec<(MiddlewareHandle, Arc<dyn Middleware>)>,
}

impl MiddlewarePipeline {
    /// Append a regular stage.
    pub(crate) fn register(&mut self, stage: Arc<dyn Middleware>) -> MiddlewareHandle {
        let handle = self.next_handle();
        self.stages.push((handle, stage));
        handle
    }

    /// Append a stage to the tail segment.
    pub(crate) fn register_tail(&mut self, stage: Arc<dyn Middleware>) -> MiddlewareHandle {
        let handle = self.next_handle();
        self.tail.push((handle, stage));
        handle
    }

    /// Remove a stage. Returns `false` if the handle is unknown.
    pub(crate) fn unregister(&mut self, handle: MiddlewareHandle) -> bool {
        let before = self.stages.len() + self.tail.len();
        self.stages.retain(|(h, _)| *h != handle);
        self.tail.retain(|(h, _)| *h != handle);
        before != self.stages.len() + self.tail.len()
    }

    /// All stages in execution order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.stages
            .iter()
            .chain(self.tail.iter())
            .map(|(_, stage)| Arc::clone(stage))
            .collect()
    }

    /// Tail stages only, in execution order.
    pub(crate) fn tail_snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.tail.iter().map(|(_, stage)| Arc::clone(stage)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.stages.len() + self.tail.len()
    }

    fn next_handle(&mut self) -> MiddlewareHandle {
        let handle = MiddlewareHandle(self.next_id);
        self.next_id += 1;
        handle
    }
}

/// Fold `action` through `stages`, awaiting each in turn.
///
/// Returns `Ok(None)` if a stage cancelled the action.
pub(crate) async fn run(
    stages: &[Arc<dyn Middleware>],
    store: &Store,
    mut action: Action,
) -> Result<Option<Action>, BoxError> {
    for stage in stages {
        match stage.process(store, action).await? {
            Flow::Continue(next) => action = next,
            Flow::Cancel => return Ok(None),
        }
    }
    Ok(Some(action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn tag(label: &'static str) -> Arc<dyn Middleware> {
        Arc::new(stage_fn(move |action: Action| {
            let mut tags = action.payload.as_array().cloned().unwrap_or_default();
            tags.push(json!(label));
            Ok(Flow::Continue(action.with_payload(Value::Array(tags))))
        }))
    }

    #[tokio::test]
    async fn stages_run_in_registration_order() {
        let store = Store::new();
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.register(tag("a"));
        pipeline.register(tag("b"));

        let out = run(&pipeline.snapshot(), &store, Action::new("T", json!([])))
            .await
            .unwrap()
            .expect("not cancelled");
        assert_eq!(out.payload, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn tail_stages_run_after_later_regular_stages() {
        let store = Store::new();
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.register_tail(tag("tail"));
        pipeline.register(tag("regular"));

        let out = run(&pipeline.snapshot(), &store, Action::new("T", json!([])))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.payload, json!(["regular", "tail"]));

        let out = run(&pipeline.tail_snapshot(), &store, Action::new("T", json!([])))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.payload, json!(["tail"]));
    }

    #[tokio::test]
    async fn cancel_stops_the_fold() {
        let store = Store::new();
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.register(Arc::new(stage_fn(|_| Ok(Flow::Cancel))));
        pipeline.register(Arc::new(stage_fn(|_| Err("must not run".into()))));

        let out = run(&pipeline.snapshot(), &store, Action::new("T", Value::Null))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn async_stages_are_awaited_in_order() {
        let store = Store::new();
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.register(Arc::new(async_stage(|action: Action| async move {
            tokio::task::yield_now().await;
            Ok::<_, BoxError>(Flow::Continue(action.with_payload(json!(["slow"]))))
        })));
        pipeline.register(tag("fast"));

        let out = run(&pipeline.snapshot(), &store, Action::new("T", json!([])))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.payload, json!(["slow", "fast"]));
    }

    #[tokio::test]
    async fn stage_error_propagates() {
        let store = Store::new();
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.register(Arc::new(stage_fn(|_| Err("rejected".into()))));

        let err = run(&pipeline.snapshot(), &store, Action::new("T", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "rejected");
    }

    #[test]
    fn unregister_removes_only_that_stage() {
        let mut pipeline = MiddlewarePipeline::default();
        let a = pipeline.register(tag("a"));
        let b = pipeline.register_tail(tag("b"));

        assert!(pipeline.unregister(a));
        assert!(!pipeline.unregister(a));
        assert_eq!(pipeline.len(), 1);
        assert!(pipeline.unregister(b));
        assert_eq!(pipeline.len(), 0);
    }
}
