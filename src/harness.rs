//! Snapshot/restore and record/replay helpers for tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::{Action, now_millis};
use crate::error::HarnessError;
use crate::middleware::{Flow, Middleware, MiddlewareHandle, StageFuture};
use crate::state::{Mutation, StateMap};
use crate::store::{Store, lock};

/// An action captured while recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    pub action: Action,
    /// Capture time in milliseconds since the Unix epoch.
    pub recorded_at: u64,
}

/// Returned by [`TestHarness::start_recording`]; pass it to
/// [`TestHarness::stop_recording`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingHandle(MiddlewareHandle);

/// Tail stage appending committed, non-replay actions to a shared log.
struct RecordingTap {
    log: Arc<Mutex<Vec<RecordedAction>>>,
}

impl Middleware for RecordingTap {
    fn process<'a>(&'a self, _store: &'a Store, action: Action) -> StageFuture<'a> {
        Box::pin(std::future::ready(Ok(Flow::Continue(action))))
    }

    fn on_commit(&self, action: &Action, _state: &StateMap) {
        if action.is_replay() {
            return;
        }
        lock(&self.log).push(RecordedAction {
            action: action.clone(),
            recorded_at: now_millis(),
        });
    }
}

/// Test utilities bound to one [`Store`].
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use statefold::{Store, TestHarness};
///
/// let store = Store::new();
/// let harness = TestHarness::new(&store);
///
/// store.set_state("count", json!(1));
/// let before = harness.snapshot();
/// store.set_state("count", json!(2));
///
/// harness.restore_snapshot(before).unwrap();
/// assert_eq!(store.get_state("count"), Some(json!(1)));
/// ```
#[derive(Clone)]
pub struct TestHarness {
    store: Store,
    snapshots: Arc<Mutex<Vec<StateMap>>>,
    recorded: Arc<Mutex<Vec<RecordedAction>>>,
    active: Arc<Mutex<Option<MiddlewareHandle>>>,
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("snapshots", &lock(&self.snapshots).len())
            .field("recorded", &lock(&self.recorded).len())
            .field("recording", &lock(&self.active).is_some())
            .finish()
    }
}

impl TestHarness {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
            snapshots: Arc::new(Mutex::new(Vec::new())),
            recorded: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// The store under test.
    pub fn store(&self) -> &Store {
        &self.store
    }

    // --- snapshots ---

    /// Capture an independent copy of the current state.
    ///
    /// # Returns
    ///
    /// The snapshot's index. Indices start at 0 and increase by one per call.
    pub fn snapshot(&self) -> usize {
        let state = self.store.get_all_state();
        let mut snapshots = lock(&self.snapshots);
        snapshots.push(state);
        snapshots.len() - 1
    }

    /// Replace the whole state with snapshot `index`.
    ///
    /// Subscribers see the clear (one `Null` per removed key) followed by
    /// one event per restored key. The pipeline does not run.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::OutOfRange`] if no snapshot has that index;
    /// the state is left untouched.
    pub fn restore_snapshot(&self, index: usize) -> Result<(), HarnessError> {
        let state = self.snapshot_state(index).ok_or_else(|| HarnessError::OutOfRange {
            index,
            len: self.snapshot_count(),
        })?;

        let mutations = std::iter::once(Mutation::Clear)
            .chain(state.into_iter().map(|(k, v)| Mutation::Set(k, v)))
            .collect();
        self.store.apply_mutations(mutations);
        Ok(())
    }

    /// Copy of snapshot `index`, or `None` if it does not exist.
    pub fn snapshot_state(&self, index: usize) -> Option<StateMap> {
        lock(&self.snapshots).get(index).cloned()
    }

    pub fn snapshot_count(&self) -> usize {
        lock(&self.snapshots).len()
    }

    // --- recording ---

    /// Start recording committed actions, discarding any previous recording.
    ///
    /// The recorder runs after every other stage, so cancelled actions are
    /// not recorded. Replayed actions are never recorded.
    pub fn start_recording(&self) -> RecordingHandle {
        let mut active = lock(&self.active);
        if let Some(previous) = active.take() {
            self.store.remove_middleware(previous);
        }
        lock(&self.recorded).clear();

        let handle = self.store.add_tail_middleware(Arc::new(RecordingTap {
            log: Arc::clone(&self.recorded),
        }));
        *active = Some(handle);
        tracing::debug!("harness: recording started");
        RecordingHandle(handle)
    }

    /// Stop the recording started with `handle`. The recorded actions are kept.
    ///
    /// A stale handle from an earlier recording is ignored.
    pub fn stop_recording(&self, handle: RecordingHandle) {
        let mut active = lock(&self.active);
        if *active != Some(handle.0) {
            tracing::debug!("harness: stop_recording with stale handle");
            return;
        }
        active.take();
        self.store.remove_middleware(handle.0);
        tracing::debug!(recorded = lock(&self.recorded).len(), "harness: recording stopped");
    }

    /// Returns `true` while a recording is active.
    pub fn is_recording(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Actions captured by the current or last recording, oldest first.
    pub fn recorded(&self) -> Vec<RecordedAction> {
        lock(&self.recorded).clone()
    }

    /// Re-apply the recorded actions in order.
    ///
    /// Actions were recorded after every regular middleware stage ran, so
    /// they go straight to the reducer and the subscribers. Successive
    /// actions are spaced by
    /// [`StoreConfig::replay_interval`](crate::StoreConfig::replay_interval)
    /// divided by `speed`; `2.0` replays twice as fast. Replayed actions
    /// are committed as [`ActionOrigin::Replay`](crate::ActionOrigin) and
    /// are not recorded again.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::InvalidSpeed`] if `speed` is not a positive finite
    ///   number. Nothing is dispatched.
    /// - [`HarnessError::Dispatch`] if a replay was interrupted. Replay
    ///   stops there.
    pub async fn replay(&self, speed: f64) -> Result<(), HarnessError> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(HarnessError::InvalidSpeed(speed));
        }
        let delay =
            Duration::try_from_secs_f64(self.store.config().replay_interval.as_secs_f64() / speed)
                .map_err(|_| HarnessError::InvalidSpeed(speed))?;

        let actions = self.recorded();
        tracing::debug!(actions = actions.len(), speed, "harness: replay");
        for (i, recorded) in actions.into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.store.replay_action(recorded.action).await?;
        }
        Ok(())
    }
}
