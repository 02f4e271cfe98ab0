//! Action and change-event envelopes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action type merged key-by-key into the state by the default reducer.
pub const SET_STATE: &str = "SET_STATE";

/// Action type whose string payload names a key to remove.
pub const REMOVE_STATE: &str = "REMOVE_STATE";

/// Action type that empties the state.
pub const CLEAR_STATE: &str = "CLEAR_STATE";

/// Prefix of the reserved keys holding the last payload of other action types.
pub const ACTION_KEY_PREFIX: &str = "__actions_";

/// Returns the reserved state key under which the default reducer stores
/// the last payload of `action_type`.
///
/// # Examples
///
/// ```
/// assert_eq!(statefold::action_key("DOUBLE"), "__actions_DOUBLE");
/// ```
pub fn action_key(action_type: &str) -> String {
    format!("{ACTION_KEY_PREFIX}{action_type}")
}

/// Milliseconds since the Unix epoch, saturating to zero for clocks set
/// before 1970.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Who issued an action.
///
/// Recording stages skip [`Replay`](ActionOrigin::Replay) actions so that
/// re-dispatching a log never grows it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOrigin {
    /// Dispatched by host code.
    #[default]
    Caller,
    /// Synthesized by the engine itself (loading/success/error).
    FollowUp,
    /// Re-applied from a recorded log by time travel or the test harness.
    /// The store sets this when it commits a replay.
    Replay,
}

/// A typed, timestamped request to change state.
///
/// Built fresh by the store for every dispatch. Middleware stages take
/// the action by value and hand back a (possibly different) action, so an
/// action is never mutated behind another stage's back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// The action type, e.g. `"SET_STATE"` or `"FETCH_USER_ASYNC"`.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Arbitrary structured payload; `Null` when absent.
    #[serde(default)]
    pub payload: Value,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Who issued the action.
    #[serde(default)]
    pub origin: ActionOrigin,
}

impl Action {
    /// Build a caller-originated action stamped with the current time.
    pub fn new(action_type: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
            timestamp: now_millis(),
            origin: ActionOrigin::Caller,
        }
    }

    /// Return a copy of this action with a different payload.
    ///
    /// Keeps the type, timestamp, and origin. This is the usual way for a
    /// middleware stage to transform an action.
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Set the origin of the action.
    pub fn with_origin(mut self, origin: ActionOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Returns `true` if the action was re-dispatched from a recorded log.
    pub fn is_replay(&self) -> bool {
        self.origin == ActionOrigin::Replay
    }
}

/// Notification that one state key changed.
///
/// A removed key is reported with a `Null` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The mutated key.
    pub key: String,
    /// The key's new value, or `Null` if it was removed.
    pub value: Value,
    /// Time of the mutation in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl ChangeEvent {
    pub(crate) fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: now_millis(),
        }
    }
}
