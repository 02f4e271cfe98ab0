//! The dispatcher: the single writer of the state map.
//!
//! Actions go through one FIFO queue. The first caller to find the queue
//! idle becomes the drainer and runs queued actions until the queue is
//! empty. A caller arriving while another task drains waits for its own
//! action to complete. Calls made from inside the drain (middleware
//! stages) are appended and return at once.
//!
//! Each state change is committed as one uninterrupted phase under a commit
//! gate: mutation, commit hooks, then subscriber notification. Writes issued
//! by a subscriber during a phase are deferred until that phase ends, so a
//! dispatch's notifications always complete before the next change begins.
//! Direct writes (`set_state`, `remove`, `clear`) commit immediately and are
//! not ordered behind actions still waiting in the queue.

use std::cell::Cell;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::Instrument;

use crate::action::{Action, ActionOrigin, ChangeEvent};
use crate::config::StoreConfig;
use crate::error::DispatchError;
use crate::middleware::{self, Middleware, MiddlewareHandle, MiddlewarePipeline};
use crate::reducer;
use crate::state::{Mutation, StateMap, StateStore};
use crate::subscription::{self, SubscriptionId, SubscriptionRegistry};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Subscriber panics are caught before they can poison anything, so a
/// poisoned lock only means a panic inside this crate; the protected data
/// is still consistent because every critical section is a single call.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The drain loop a task is currently running.
struct DrainScope {
    store: usize,
    /// Whether the job being processed is a replay.
    replay: Cell<bool>,
}

tokio::task_local! {
    static DRAIN: DrainScope;
}

/// A commit phase running on this thread.
#[derive(Clone, Copy)]
struct CommitPhase {
    store: usize,
    replay: bool,
}

thread_local! {
    static COMMITTING: Cell<Option<CommitPhase>> = const { Cell::new(None) };
}

/// Marks this thread as inside a commit phase until dropped.
struct PhaseGuard {
    previous: Option<CommitPhase>,
}

impl PhaseGuard {
    fn enter(phase: CommitPhase) -> Self {
        let previous = COMMITTING.with(|current| current.replace(Some(phase)));
        Self { previous }
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        COMMITTING.with(|current| current.set(self.previous));
    }
}

/// Unit of work for the drain loop.
enum Job {
    /// Run an action through the whole pipeline and the reducer.
    Dispatch(Action),
    /// Re-apply a recorded action. The action already went through the
    /// regular stages when it was recorded, so only tail stages run.
    Replay(Action),
}

type Completion = oneshot::Sender<Result<(), DispatchError>>;

struct Queued {
    job: Job,
    /// Commit the action as [`ActionOrigin::Replay`] whatever its origin.
    replay: bool,
    done: Option<Completion>,
}

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<Queued>,
    draining: bool,
}

/// Ownership of the drain loop, held by whichever task is draining.
///
/// Dropped before the queue ran dry means the draining future was
/// cancelled. With `hand_off` set, the remaining jobs move to a spawned
/// task; otherwise the loop is released and the next submitter drains.
struct DrainToken {
    store: Store,
    hand_off: bool,
    finished: bool,
}

impl DrainToken {
    fn new(store: Store, hand_off: bool) -> Self {
        Self {
            store,
            hand_off,
            finished: false,
        }
    }
}

impl Drop for DrainToken {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut queue = lock(&self.store.inner.queue);
        let remaining = queue.jobs.len();
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) if self.hand_off && remaining > 0 => runtime,
            _ => {
                queue.draining = false;
                if remaining > 0 {
                    tracing::warn!(remaining, "drain released; queued actions run on the next dispatch");
                }
                return;
            }
        };
        drop(queue);

        tracing::debug!(remaining, "drain interrupted; continuing on a spawned task");
        let store = self.store.clone();
        let token = DrainToken::new(self.store.clone(), false);
        runtime.spawn(async move {
            store.drain(token).await;
        });
    }
}

struct Inner {
    config: StoreConfig,
    state: Mutex<StateStore>,
    pipeline: Mutex<MiddlewarePipeline>,
    subscribers: Mutex<SubscriptionRegistry>,
    queue: Mutex<JobQueue>,
    /// Held for the whole of a commit phase.
    gate: Mutex<()>,
    /// Writes issued from inside the running commit phase.
    deferred: Mutex<VecDeque<Vec<Mutation>>>,
    commit_seq: AtomicU64,
}

/// Reactive key-value store with a single writer.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped, and every clone
/// refers to the same state, pipeline, and subscribers.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use statefold::Store;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), statefold::DispatchError> {
/// let store = Store::new();
/// store.set_state("count", json!(0));
/// store.dispatch("SET_STATE", json!({"count": 5})).await?;
/// assert_eq!(store.get_state("count"), Some(json!(5)));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

// Manual `Debug` because stages and callbacks are not `Debug`.
impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("keys", &lock(&self.inner.state).len())
            .field("middleware", &lock(&self.inner.pipeline).len())
            .field("subscribers", &lock(&self.inner.subscribers).len())
            .finish()
    }
}

/// Non-owning reference to a [`Store`], held by subscribers that need to
/// read back the state without keeping the store alive.
#[derive(Clone)]
pub(crate) struct WeakStore {
    inner: Weak<Inner>,
}

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create an empty store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create an empty store with a custom configuration.
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(StateStore::new()),
                pipeline: Mutex::new(MiddlewarePipeline::default()),
                subscribers: Mutex::new(SubscriptionRegistry::default()),
                queue: Mutex::new(JobQueue::default()),
                gate: Mutex::new(()),
                deferred: Mutex::new(VecDeque::new()),
                commit_seq: AtomicU64::new(0),
            }),
        }
    }

    /// The configuration this store was built with.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of commit phases that produced change events so far.
    ///
    /// Stable for the whole of one notification phase.
    pub(crate) fn commit_seq(&self) -> u64 {
        self.inner.commit_seq.load(Ordering::SeqCst)
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    // --- dispatch ---

    /// Dispatch an action built from `action_type` and `payload`.
    ///
    /// Runs the middleware pipeline, the default reducer, the state
    /// mutation, and subscriber notification. If another task is draining
    /// the queue, this waits until that loop has processed the action.
    /// Called from inside a middleware stage, the action is queued behind
    /// the current one and this returns `Ok(())` at once.
    ///
    /// Dropping the returned future does not withdraw an action that is
    /// already queued; it only abandons an action that is mid-pipeline on
    /// this task.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Middleware`] if a stage rejected this
    /// action, or [`DispatchError::Interrupted`] if the task draining the
    /// queue was cancelled while this action was in the pipeline.
    pub async fn dispatch(
        &self,
        action_type: impl Into<String>,
        payload: Value,
    ) -> Result<(), DispatchError> {
        self.dispatch_action(Action::new(action_type, payload)).await
    }

    /// Dispatch a prebuilt action. See [`dispatch`](Store::dispatch).
    pub async fn dispatch_action(&self, action: Action) -> Result<(), DispatchError> {
        self.submit(Job::Dispatch(action)).await
    }

    /// Re-apply a recorded action.
    ///
    /// Skips the regular middleware stages, which already ran when the
    /// action was recorded, and commits it as [`ActionOrigin::Replay`].
    /// Actions that subscribers issue while it is being committed are
    /// committed as replays too.
    pub(crate) async fn replay_action(&self, action: Action) -> Result<(), DispatchError> {
        self.submit(Job::Replay(action)).await
    }

    /// Queue an action without waiting for it.
    ///
    /// This is the form to use from synchronous subscriber callbacks. The
    /// action runs after the current notification phase completes. If no
    /// drain loop is active, one is spawned on the current tokio runtime;
    /// without a runtime the action waits for the next `dispatch`.
    pub fn enqueue(&self, action_type: impl Into<String>, payload: Value) {
        self.enqueue_action(Action::new(action_type, payload));
    }

    /// Queue a prebuilt action. See [`enqueue`](Store::enqueue).
    pub fn enqueue_action(&self, action: Action) {
        let Some(token) = self.admit(Job::Dispatch(action), None, false) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = self.clone();
                runtime.spawn(async move {
                    store.drain(token).await;
                });
            }
            // Releasing the token leaves the action for the next dispatch.
            Err(_) => drop(token),
        }
    }

    // --- middleware ---

    /// Append a middleware stage. Registration order is execution order.
    pub fn add_middleware(&self, stage: impl Middleware) -> MiddlewareHandle {
        lock(&self.inner.pipeline).register(Arc::new(stage))
    }

    /// Append a stage that always runs after every regular stage, even
    /// those registered later. Used by recorders.
    pub(crate) fn add_tail_middleware(&self, stage: Arc<dyn Middleware>) -> MiddlewareHandle {
        lock(&self.inner.pipeline).register_tail(stage)
    }

    /// Remove a stage. Returns `false` if the handle is unknown.
    pub fn remove_middleware(&self, handle: MiddlewareHandle) -> bool {
        lock(&self.inner.pipeline).unregister(handle)
    }

    // --- subscriptions ---

    /// Register a callback invoked once per [`ChangeEvent`].
    ///
    /// Callbacks run synchronously inside the commit phase that produced
    /// the change, in subscription order. They may read the store, write
    /// to it, and call [`enqueue`](Store::enqueue); such writes and actions
    /// take effect after the current notification phase. Callbacks must not
    /// block.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.subscribers).subscribe(Arc::new(callback))
    }

    /// Remove a subscription. No-op if `id` is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if !lock(&self.inner.subscribers).unsubscribe(id) {
            tracing::debug!(subscription = id.0, "unsubscribe: unknown id");
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Stream every subsequent [`ChangeEvent`].
    ///
    /// Backed by a regular subscription that is removed when the stream is
    /// dropped. Intended for async view bindings.
    pub fn changes(&self) -> ChangeStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            // The receiver is gone only while the stream is being dropped.
            let _ = tx.send(event.clone());
        });
        ChangeStream {
            store: self.clone(),
            id,
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    // --- state access ---

    /// Returns the value under `key`, or `None` if absent.
    pub fn get_state(&self, key: &str) -> Option<Value> {
        lock(&self.inner.state).get(key)
    }

    /// Returns an independent copy of the whole state.
    pub fn get_all_state(&self) -> StateMap {
        lock(&self.inner.state).get_all()
    }

    /// Overwrite one key and notify subscribers, bypassing the pipeline.
    ///
    /// The write is visible as soon as this returns, even while another
    /// task has actions in flight. Called from a subscriber, it is applied
    /// right after the current notification phase instead.
    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.apply_mutations(vec![Mutation::Set(key.into(), value)]);
    }

    /// Remove one key and notify subscribers with `Null`. No-op if absent.
    pub fn remove(&self, key: &str) {
        self.apply_mutations(vec![Mutation::Remove(key.to_string())]);
    }

    /// Remove every key, notifying subscribers once per removed key.
    pub fn clear(&self) {
        self.apply_mutations(vec![Mutation::Clear]);
    }

    /// Apply mutations through the writer path without running the pipeline.
    pub(crate) fn apply_mutations(&self, mutations: Vec<Mutation>) {
        self.commit(mutations, None, false);
    }

    // --- drain loop ---

    fn inside_drain(&self) -> bool {
        DRAIN
            .try_with(|scope| scope.store == self.id())
            .unwrap_or(false)
    }

    /// Whether actions submitted now descend from a replayed action.
    fn replay_context(&self) -> bool {
        let id = self.id();
        let committing = COMMITTING
            .with(Cell::get)
            .is_some_and(|phase| phase.store == id && phase.replay);
        committing
            || DRAIN
                .try_with(|scope| scope.store == id && scope.replay.get())
                .unwrap_or(false)
    }

    async fn submit(&self, job: Job) -> Result<(), DispatchError> {
        if self.inside_drain() {
            // The loop running this call picks the job up once the current
            // action completes.
            let token = self.admit(job, None, false);
            debug_assert!(token.is_none());
            return Ok(());
        }

        let (done, completion) = oneshot::channel();
        if let Some(token) = self.admit(job, Some(done), true) {
            self.drain(token).await;
        }
        completion.await.unwrap_or(Err(DispatchError::Interrupted))
    }

    /// Append a job. Returns the drain token if nobody is draining yet.
    fn admit(&self, job: Job, done: Option<Completion>, hand_off: bool) -> Option<DrainToken> {
        let replay = matches!(job, Job::Replay(_)) || self.replay_context();
        let mut queue = lock(&self.inner.queue);
        queue.jobs.push_back(Queued { job, replay, done });
        if queue.draining {
            None
        } else {
            queue.draining = true;
            Some(DrainToken::new(self.clone(), hand_off))
        }
    }

    /// Process jobs until the queue is empty.
    async fn drain(&self, mut token: DrainToken) {
        let scope = DrainScope {
            store: self.id(),
            replay: Cell::new(false),
        };
        DRAIN
            .scope(scope, self.drain_jobs())
            .instrument(tracing::debug_span!("drain"))
            .await;
        token.finished = true;
    }

    async fn drain_jobs(&self) {
        loop {
            let next = {
                let mut queue = lock(&self.inner.queue);
                let next = queue.jobs.pop_front();
                if next.is_none() {
                    queue.draining = false;
                }
                next
            };
            let Some(Queued { job, replay, done }) = next else {
                break;
            };

            let _ = DRAIN.try_with(|scope| scope.replay.set(replay));
            let result = self.run_job(job, replay).await;
            match done {
                Some(done) => {
                    if let Err(Err(e)) = done.send(result) {
                        tracing::debug!(error = %e, "dispatch failed after its caller went away");
                    }
                }
                None => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "queued dispatch failed; dropping");
                    }
                }
            }
        }
    }

    async fn run_job(&self, job: Job, replay: bool) -> Result<(), DispatchError> {
        match job {
            Job::Dispatch(action) => {
                let stages = lock(&self.inner.pipeline).snapshot();
                self.process(action, stages, replay).await
            }
            Job::Replay(action) => {
                let stages = lock(&self.inner.pipeline).tail_snapshot();
                self.process(action, stages, true).await
            }
        }
    }

    /// Pipeline, reducer, mutation, notification for one action.
    async fn process(
        &self,
        action: Action,
        stages: Vec<Arc<dyn Middleware>>,
        replay: bool,
    ) -> Result<(), DispatchError> {
        let action_type = action.action_type.clone();

        let action = match middleware::run(&stages, self, action).await {
            Ok(Some(action)) => action,
            Ok(None) => {
                tracing::debug!(action_type = %action_type, "action cancelled by middleware");
                return Ok(());
            }
            Err(source) => {
                tracing::warn!(
                    action_type = %action_type,
                    error = %source,
                    "middleware rejected action"
                );
                return Err(DispatchError::Middleware {
                    action_type,
                    source,
                });
            }
        };
        let action = if replay {
            action.with_origin(ActionOrigin::Replay)
        } else {
            action
        };

        let mutations = reducer::reduce(&action);
        self.commit(mutations, Some((&action, stages.as_slice())), replay);
        tracing::debug!(action_type = %action.action_type, replay, "action dispatched");
        Ok(())
    }

    /// Run one commit phase, then any writes its subscribers deferred.
    ///
    /// Called re-entrantly from a subscriber of this store, the mutations
    /// are deferred to the end of the running phase.
    fn commit(
        &self,
        mutations: Vec<Mutation>,
        committed: Option<(&Action, &[Arc<dyn Middleware>])>,
        replay: bool,
    ) {
        let id = self.id();
        if COMMITTING
            .with(Cell::get)
            .is_some_and(|phase| phase.store == id)
        {
            lock(&self.inner.deferred).push_back(mutations);
            return;
        }

        let _gate = lock(&self.inner.gate);
        let _phase = PhaseGuard::enter(CommitPhase { store: id, replay });
        self.commit_phase(mutations, committed);
        loop {
            let Some(mutations) = lock(&self.inner.deferred).pop_front() else {
                break;
            };
            self.commit_phase(mutations, None);
        }
    }

    /// Apply mutations, run commit hooks, then notify subscribers.
    ///
    /// No lock but the gate is held while hooks or subscribers run, so they
    /// may read the store freely.
    fn commit_phase(
        &self,
        mutations: Vec<Mutation>,
        committed: Option<(&Action, &[Arc<dyn Middleware>])>,
    ) {
        let wants_state = committed.is_some_and(|(_, stages)| !stages.is_empty());
        let (events, state_after) = {
            let mut state = lock(&self.inner.state);
            let events: Vec<ChangeEvent> = mutations
                .into_iter()
                .flat_map(|mutation| state.apply(mutation))
                .collect();
            let state_after = wants_state.then(|| state.get_all());
            (events, state_after)
        };

        if let (Some((action, stages)), Some(state)) = (committed, state_after.as_ref()) {
            for stage in stages {
                stage.on_commit(action, state);
            }
        }

        if events.is_empty() {
            return;
        }
        self.inner.commit_seq.fetch_add(1, Ordering::SeqCst);
        let subscribers = lock(&self.inner.subscribers).snapshot();
        subscription::notify(&subscribers, &events);
    }
}

/// Stream of [`ChangeEvent`]s returned by [`Store::changes`].
///
/// Unsubscribes when dropped.
pub struct ChangeStream {
    store: Store,
    id: SubscriptionId,
    inner: UnboundedReceiverStream<ChangeEvent>,
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.store.unsubscribe(self.id);
    }
}
