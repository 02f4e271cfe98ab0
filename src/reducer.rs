//! The default reducer: maps a surviving action to state mutations.

use serde_json::Value;

use crate::action::{Action, CLEAR_STATE, REMOVE_STATE, SET_STATE, action_key};
use crate::state::Mutation;

/// Translate an action into the mutations the store will apply.
///
/// - `SET_STATE` with an object payload sets every key of the object, in
///   key order. Any other payload is ignored.
/// - `REMOVE_STATE` with a string payload removes that key.
/// - `CLEAR_STATE` removes every key.
/// - Any other type stores its payload under [`action_key`], so the last
///   payload per action type stays inspectable.
///
/// This is a pure function: the result depends only on the action.
pub fn reduce(action: &Action) -> Vec<Mutation> {
    match action.action_type.as_str() {
        SET_STATE => match &action.payload {
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| Mutation::Set(key.clone(), value.clone()))
                .collect(),
            other => {
                tracing::warn!(
                    payload = %other,
                    "SET_STATE payload is not an object; ignoring"
                );
                Vec::new()
            }
        },
        REMOVE_STATE => match &action.payload {
            Value::String(key) => vec![Mutation::Remove(key.clone())],
            other => {
                tracing::warn!(
                    payload = %other,
                    "REMOVE_STATE payload is not a key string; ignoring"
                );
                Vec::new()
            }
        },
        CLEAR_STATE => vec![Mutation::Clear],
        other => vec![Mutation::Set(action_key(other), action.payload.clone())],
    }
}
