//! Action log with reset, commit, and jump-to-index replay.
//!
//! [`TimeTravelRecorder`] sits in the tail of the pipeline, so it only
//! sees actions that survived every other stage. After the reducer runs it
//! appends `{action, state}` to its log. Jumping clears the state and
//! replays the logged prefix. Logged actions were recorded after every
//! regular stage had run, so a replay goes straight to the reducer. The
//! store commits replays as [`ActionOrigin::Replay`](crate::ActionOrigin),
//! which the recorder ignores; the log never grows from its own replays.
//!
//! An external debugging tool can drive the recorder through
//! [`DevtoolsConnection`]. Its commands arrive on a channel consumed by a
//! background task, controlled via [`TimeTravelHandle`].

use std::io;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::action::Action;
use crate::error::TimeTravelError;
use crate::middleware::{Flow, Middleware, MiddlewareHandle, StageFuture};
use crate::state::StateMap;
use crate::store::{Store, lock};

/// One recorded action and the full state right after it was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub action: Action,
    pub state: StateMap,
}

/// Connection to an external debugging tool.
///
/// The recorder calls [`init`](DevtoolsConnection::init) once on attach
/// and again after `RESET`/`COMMIT`, and [`send`](DevtoolsConnection::send)
/// for every recorded action. Commands from the tool are read from the
/// receiver returned by [`subscribe`](DevtoolsConnection::subscribe).
pub trait DevtoolsConnection: Send + Sync + 'static {
    /// Report the baseline state.
    fn init(&self, state: &StateMap);

    /// Report a recorded action and the state it produced.
    fn send(&self, action: &Action, state: &StateMap);

    /// Open the command channel. Called once per attach.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DevtoolsMessage>;
}

/// Message from the debugging tool.
///
/// Deserializes from `{"type": "DISPATCH", "payload": {...}}`. Other
/// message types are accepted and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DevtoolsMessage {
    Dispatch(DevtoolsCommand),
    #[serde(other)]
    Unknown,
}

/// Time-travel command carried by a `DISPATCH` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DevtoolsCommand {
    /// Clear the state and the log.
    Reset,
    /// Keep the state, clear the log.
    Commit,
    /// Rebuild the state as of log entry `action_id`.
    JumpToAction {
        #[serde(rename = "actionId")]
        action_id: usize,
    },
    /// Same as [`JumpToAction`](DevtoolsCommand::JumpToAction).
    JumpToState {
        #[serde(rename = "actionId")]
        action_id: usize,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Default)]
struct History {
    entries: Vec<ActionLogEntry>,
    cursor: Option<usize>,
}

struct RecorderInner {
    history: Mutex<History>,
    devtools: Option<Arc<dyn DevtoolsConnection>>,
}

/// Tail stage: passes actions through, records them on commit.
struct RecorderStage {
    inner: Arc<RecorderInner>,
}

impl Middleware for RecorderStage {
    fn process<'a>(&'a self, _store: &'a Store, action: Action) -> StageFuture<'a> {
        Box::pin(std::future::ready(Ok(Flow::Continue(action))))
    }

    fn on_commit(&self, action: &Action, state: &StateMap) {
        if action.is_replay() {
            return;
        }
        {
            let mut history = lock(&self.inner.history);
            history.entries.push(ActionLogEntry {
                action: action.clone(),
                state: state.clone(),
            });
            history.cursor = Some(history.entries.len() - 1);
        }
        if let Some(devtools) = &self.inner.devtools {
            devtools.send(action, state);
        }
    }
}

/// Records dispatched actions and replays prefixes of the log.
///
/// `Clone` is cheap; clones share the same log.
#[derive(Clone)]
pub struct TimeTravelRecorder {
    store: Store,
    inner: Arc<RecorderInner>,
    handle: MiddlewareHandle,
}

impl std::fmt::Debug for TimeTravelRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let history = lock(&self.inner.history);
        f.debug_struct("TimeTravelRecorder")
            .field("entries", &history.entries.len())
            .field("cursor", &history.cursor)
            .field("devtools", &self.inner.devtools.is_some())
            .finish()
    }
}

impl TimeTravelRecorder {
    /// Install a recorder on `store` without a debugging tool.
    pub fn install(store: &Store) -> Self {
        Self::attach(store, None)
    }

    /// Install a recorder driven by `devtools`.
    ///
    /// Sends the current state to the tool, then spawns a task that
    /// applies the tool's commands. Must be called from within a tokio
    /// runtime.
    ///
    /// # Returns
    ///
    /// The recorder and a handle for stopping the command listener.
    pub fn with_devtools(
        store: &Store,
        devtools: Arc<dyn DevtoolsConnection>,
    ) -> (Self, TimeTravelHandle) {
        devtools.init(&store.get_all_state());
        let commands = devtools.subscribe();
        let recorder = Self::attach(store, Some(devtools));
        let handle = TimeTravelHandle::spawn(recorder.clone(), commands);
        (recorder, handle)
    }

    fn attach(store: &Store, devtools: Option<Arc<dyn DevtoolsConnection>>) -> Self {
        let inner = Arc::new(RecorderInner {
            history: Mutex::new(History::default()),
            devtools,
        });
        let handle = store.add_tail_middleware(Arc::new(RecorderStage {
            inner: Arc::clone(&inner),
        }));
        Self {
            store: store.clone(),
            inner,
            handle,
        }
    }

    /// Copy of the log, oldest first.
    pub fn log(&self) -> Vec<ActionLogEntry> {
        lock(&self.inner.history).entries.clone()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        lock(&self.inner.history).entries.len()
    }

    /// Returns `true` if nothing has been recorded since the last reset or commit.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the entry the state currently reflects, if any.
    pub fn cursor(&self) -> Option<usize> {
        lock(&self.inner.history).cursor
    }

    /// Clear the store and the log.
    pub fn reset(&self) {
        self.store.clear();
        *lock(&self.inner.history) = History::default();
        self.reinit_devtools();
        tracing::debug!("time travel: reset");
    }

    /// Clear the log, keeping the current state as the new baseline.
    pub fn commit(&self) {
        *lock(&self.inner.history) = History::default();
        self.reinit_devtools();
        tracing::debug!("time travel: commit");
    }

    /// Rebuild the state as it was right after log entry `index`.
    ///
    /// Clears the store, then replays entries `0..=index` in order. Each
    /// logged action is applied as recorded, without running the regular
    /// middleware again. Subscribers are notified as usual. The log is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// - [`TimeTravelError::OutOfRange`] if `index` is not in the log. The
    ///   state is not modified.
    /// - [`TimeTravelError::Dispatch`] if a replay was interrupted. The
    ///   state then reflects the entries before it.
    pub async fn jump_to(&self, index: usize) -> Result<(), TimeTravelError> {
        let actions: Vec<Action> = {
            let history = lock(&self.inner.history);
            let len = history.entries.len();
            if index >= len {
                return Err(TimeTravelError::OutOfRange { index, len });
            }
            history.entries[..=index]
                .iter()
                .map(|entry| entry.action.clone())
                .collect()
        };

        tracing::debug!(index, replayed = actions.len(), "time travel: jump");
        self.store.clear();
        for action in actions {
            self.store.replay_action(action).await?;
        }
        lock(&self.inner.history).cursor = Some(index);
        Ok(())
    }

    /// Apply one message from the debugging tool.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`jump_to`](TimeTravelRecorder::jump_to).
    pub async fn handle_message(&self, message: DevtoolsMessage) -> Result<(), TimeTravelError> {
        let command = match message {
            DevtoolsMessage::Dispatch(command) => command,
            DevtoolsMessage::Unknown => {
                tracing::debug!("time travel: ignoring non-dispatch devtools message");
                return Ok(());
            }
        };
        match command {
            DevtoolsCommand::Reset => self.reset(),
            DevtoolsCommand::Commit => self.commit(),
            DevtoolsCommand::JumpToAction { action_id }
            | DevtoolsCommand::JumpToState { action_id } => self.jump_to(action_id).await?,
            DevtoolsCommand::Unknown => {
                tracing::debug!("time travel: ignoring unknown devtools command");
            }
        }
        Ok(())
    }

    /// Remove the recorder's stage from the store. The log is kept.
    pub fn uninstall(&self) {
        self.store.remove_middleware(self.handle);
    }

    fn reinit_devtools(&self) {
        if let Some(devtools) = &self.inner.devtools {
            devtools.init(&self.store.get_all_state());
        }
    }
}

/// Handle for the background task applying debugging-tool commands.
///
/// Dropping the handle does **not** stop the task; it ends when the tool
/// closes its channel or [`shutdown`](TimeTravelHandle::shutdown) is called.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct TimeTravelHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for TimeTravelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeTravelHandle")
            .field("shutdown_requested", &*self.shutdown_tx.borrow())
            .finish()
    }
}

impl TimeTravelHandle {
    fn spawn(
        recorder: TimeTravelRecorder,
        mut commands: mpsc::UnboundedReceiver<DevtoolsMessage>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Messages already delivered win over a shutdown request.
                    biased;
                    message = commands.recv() => match message {
                        Some(message) => {
                            if let Err(e) = recorder.handle_message(message).await {
                                tracing::warn!(error = %e, "devtools command failed");
                            }
                        }
                        None => {
                            tracing::debug!("devtools connection closed");
                            break;
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        Self {
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Stop the listener after it has applied every message already
    /// received, and wait for it to exit.
    ///
    /// Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the listener task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        // The receiver is gone if the task already exited.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| io::Error::other(format!("devtools listener panicked: {e}"))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::action_key;
    use crate::middleware::stage_fn;
    use serde_json::{Value, json};

    fn state_of(pairs: &[(&str, Value)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn dispatch_abc(store: &Store) {
        store.dispatch("SET_STATE", json!({"a": 1})).await.unwrap();
        store.dispatch("SET_STATE", json!({"b": 2})).await.unwrap();
        store.dispatch("SET_STATE", json!({"c": 3})).await.unwrap();
    }

    #[tokio::test]
    async fn records_action_and_resulting_state() {
        let store = Store::new();
        let recorder = TimeTravelRecorder::install(&store);

        store.dispatch("SET_STATE", json!({"a": 1})).await.unwrap();
        store.dispatch("PING", json!(true)).await.unwrap();

        let log = recorder.log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action.action_type, "SET_STATE");
        assert_eq!(log[0].state, state_of(&[("a", json!(1))]));
        assert_eq!(
            log[1].state,
            state_of(&[("__actions_PING", json!(true)), ("a", json!(1))])
        );
        assert_eq!(recorder.cursor(), Some(1));
    }

    #[tokio::test]
    async fn cancelled_actions_are_not_recorded() {
        let store = Store::new();
        let recorder = TimeTravelRecorder::install(&store);
        // Registered after the recorder, but still runs before it.
        store.add_middleware(stage_fn(|action| {
            if action.action_type == "NOISE" {
                Ok(Flow::Cancel)
            } else {
                Ok(Flow::Continue(action))
            }
        }));

        store.dispatch("NOISE", Value::Null).await.unwrap();
        store.dispatch("SIGNAL", Value::Null).await.unwrap();

        let types: Vec<String> = recorder
            .log()
            .into_iter()
            .map(|e| e.action.action_type)
            .collect();
        assert_eq!(types, vec!["SIGNAL"]);
    }

    #[tokio::test]
    async fn direct_writes_are_not_recorded() {
        let store = Store::new();
        let recorder = TimeTravelRecorder::install(&store);
        store.set_state("k", json!(1));
        assert!(recorder.is_empty());
    }

    #[tokio::test]
    async fn jump_rebuilds_prefix_without_growing_log() {
        let store = Store::new();
        let recorder = TimeTravelRecorder::install(&store);
        dispatch_abc(&store).await;

        recorder.jump_to(1).await.unwrap();

        assert_eq!(
            store.get_all_state(),
            state_of(&[("a", json!(1)), ("b", json!(2))])
        );
        assert_eq!(recorder.len(), 3);
        assert_eq!(recorder.cursor(), Some(1));

        // Jumping forward again restores the latest state.
        recorder.jump_to(2).await.unwrap();
        assert_eq!(store.get_all_state(), recorder.log()[2].state);
        assert_eq!(recorder.len(), 3);
    }

    #[tokio::test]
    async fn jump_applies_logged_action_without_transforming_it_again() {
        let store = Store::new();
        let recorder = TimeTravelRecorder::install(&store);
        store.add_middleware(stage_fn(|action| {
            let doubled = action.payload.as_i64().map(|n| json!(n * 2));
            Ok(Flow::Continue(match doubled {
                Some(payload) => action.with_payload(payload),
                None => action,
            }))
        }));

        store.dispatch("DOUBLE", json!(10)).await.unwrap();
        let recorded = store.get_all_state();
        assert_eq!(recorded, state_of(&[("__actions_DOUBLE", json!(20))]));

        recorder.jump_to(0).await.unwrap();

        assert_eq!(store.get_all_state(), recorded);
        assert_eq!(store.get_all_state(), recorder.log()[0].state);
    }

    #[tokio::test]
    async fn jump_does_not_grow_log_when_middleware_rebuilds_actions() {
        let store = Store::new();
        let recorder = TimeTravelRecorder::install(&store);
        store.add_middleware(stage_fn(|action| {
            Ok(Flow::Continue(Action::new(
                action.action_type.to_uppercase(),
                action.payload.clone(),
            )))
        }));
        // Reacts to every replayed entry with a fresh action of its own.
        {
            let inner = store.clone();
            store.subscribe(move |event| {
                if event.key == action_key("A") {
                    inner.enqueue("echo", json!(true));
                }
            });
        }

        store.dispatch("a", json!(1)).await.unwrap();
        store.dispatch("b", json!(2)).await.unwrap();
        let types: Vec<String> = recorder
            .log()
            .into_iter()
            .map(|e| e.action.action_type)
            .collect();
        assert_eq!(types, vec!["A", "ECHO", "B"]);

        recorder.jump_to(2).await.unwrap();
        recorder.jump_to(1).await.unwrap();

        assert_eq!(recorder.len(), 3);
        assert_eq!(store.get_state(&action_key("B")), None);
        assert_eq!(store.get_state(&action_key("ECHO")), Some(json!(true)));
    }

    #[tokio::test]
    async fn out_of_range_jump_is_rejected() {
        let store = Store::new();
        let recorder = TimeTravelRecorder::install(&store);
        dispatch_abc(&store).await;
        let before = store.get_all_state();

        let err = recorder.jump_to(3).await.unwrap_err();

        assert!(matches!(err, TimeTravelError::OutOfRange { index: 3, len: 3 }));
        assert_eq!(store.get_all_state(), before);
        assert_eq!(recorder.cursor(), Some(2));
    }

    #[tokio::test]
    async fn reset_clears_state_and_log() {
        let store = Store::new();
        let recorder = TimeTravelRecorder::install(&store);
        dispatch_abc(&store).await;

        recorder.reset();

        assert!(store.get_all_state().is_empty());
        assert!(recorder.is_empty());
        assert_eq!(recorder.cursor(), None);
    }

    #[tokio::test]
    async fn commit_keeps_state_and_clears_log() {
        let store = Store::new();
        let recorder = TimeTravelRecorder::install(&store);
        dispatch_abc(&store).await;

        recorder.commit();

        assert_eq!(store.get_all_state().len(), 3);
        assert!(recorder.is_empty());

        store.dispatch("AFTER", json!(1)).await.unwrap();
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.cursor(), Some(0));
        assert_eq!(store.get_state(&action_key("AFTER")), Some(json!(1)));
    }

    #[test]
    fn devtools_messages_deserialize() {
        let jump: DevtoolsMessage = serde_json::from_value(json!({
            "type": "DISPATCH",
            "payload": {"type": "JUMP_TO_ACTION", "actionId": 4}
        }))
        .unwrap();
        assert_eq!(
            jump,
            DevtoolsMessage::Dispatch(DevtoolsCommand::JumpToAction { action_id: 4 })
        );

        let reset: DevtoolsMessage = serde_json::from_value(json!({
            "type": "DISPATCH",
            "payload": {"type": "RESET"}
        }))
        .unwrap();
        assert_eq!(reset, DevtoolsMessage::Dispatch(DevtoolsCommand::Reset));

        let other: DevtoolsMessage = serde_json::from_value(json!({"type": "START"})).unwrap();
        assert_eq!(other, DevtoolsMessage::Unknown);

        let unknown_command: DevtoolsMessage = serde_json::from_value(json!({
            "type": "DISPATCH",
            "payload": {"type": "TOGGLE_ACTION"}
        }))
        .unwrap();
        assert_eq!(
            unknown_command,
            DevtoolsMessage::Dispatch(DevtoolsCommand::Unknown)
        );
    }

    #[derive(Default)]
    struct FakeDevtools {
        inits: Mutex<Vec<StateMap>>,
        sent: Mutex<Vec<String>>,
        commands: Mutex<Option<mpsc::UnboundedSender<DevtoolsMessage>>>,
    }

    impl FakeDevtools {
        fn command(&self, command: DevtoolsCommand) {
            self.commands
                .lock()
                .unwrap()
                .as_ref()
                .expect("subscribed")
                .send(DevtoolsMessage::Dispatch(command))
                .unwrap();
        }
    }

    impl DevtoolsConnection for FakeDevtools {
        fn init(&self, state: &StateMap) {
            self.inits.lock().unwrap().push(state.clone());
        }

        fn send(&self, action: &Action, _state: &StateMap) {
            self.sent.lock().unwrap().push(action.action_type.clone());
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<DevtoolsMessage> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.commands.lock().unwrap() = Some(tx);
            rx
        }
    }

    #[tokio::test]
    async fn devtools_drive_jump_and_see_only_fresh_actions() {
        let store = Store::new();
        store.set_state("seed", json!(0));
        let tools = Arc::new(FakeDevtools::default());
        let (recorder, handle) = TimeTravelRecorder::with_devtools(&store, tools.clone());

        store.dispatch("SET_STATE", json!({"a": 1})).await.unwrap();
        store.dispatch("SET_STATE", json!({"b": 2})).await.unwrap();
        tools.command(DevtoolsCommand::JumpToState { action_id: 0 });
        handle.shutdown().await.unwrap();

        assert_eq!(store.get_all_state(), state_of(&[("a", json!(1))]));
        assert_eq!(recorder.cursor(), Some(0));
        assert_eq!(recorder.len(), 2);
        // Replayed actions are not echoed back to the tool.
        assert_eq!(*tools.sent.lock().unwrap(), vec!["SET_STATE", "SET_STATE"]);
        assert_eq!(
            *tools.inits.lock().unwrap(),
            vec![state_of(&[("seed", json!(0))])]
        );
    }

    #[tokio::test]
    async fn devtools_reset_reinitializes_tool() {
        let store = Store::new();
        let tools = Arc::new(FakeDevtools::default());
        let (recorder, handle) = TimeTravelRecorder::with_devtools(&store, tools.clone());

        store.dispatch("SET_STATE", json!({"a": 1})).await.unwrap();
        tools.command(DevtoolsCommand::Reset);
        handle.shutdown().await.unwrap();
        // Second shutdown is a no-op.
        handle.shutdown().await.unwrap();

        assert!(recorder.is_empty());
        assert!(store.get_all_state().is_empty());
        assert_eq!(tools.inits.lock().unwrap().len(), 2);
    }
}
