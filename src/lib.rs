//! Single-writer reactive key-value state container.
//!
//! A [`Store`] owns a map of JSON values. Writes go through a middleware
//! pipeline and a default reducer, and every changed key is announced to
//! subscribers. On top of that sit asynchronous action expansion
//! ([`AsyncActionExpander`]), durable persistence ([`PersistenceBridge`]),
//! time-travel debugging ([`TimeTravelRecorder`]), and test helpers
//! ([`TestHarness`]).

mod action;
pub use action::{
    ACTION_KEY_PREFIX, Action, ActionOrigin, CLEAR_STATE, ChangeEvent, REMOVE_STATE, SET_STATE,
    action_key,
};
mod async_action;
pub use async_action::{AsyncActionExpander, PendingAsyncRequest, ResolveFuture, Resolver};
mod config;
mod error;
mod harness;
mod middleware;
mod persistence;
mod reducer;
mod state;
mod store;
mod subscription;
mod time_travel;

pub use config::StoreConfig;
pub use error::{BoxError, DispatchError, HarnessError, TimeTravelError};
pub use harness::{RecordedAction, RecordingHandle, TestHarness};
pub use middleware::{
    AsyncFnStage, Flow, FnStage, Middleware, MiddlewareHandle, StageFuture, async_stage, stage_fn,
};
pub use persistence::{DurableStore, FileBlobStore, MemoryBlobStore, PersistenceBridge};
pub use reducer::reduce;
pub use state::{Mutation, StateMap, StateStore};
pub use store::{ChangeStream, Store};
pub use subscription::{Callback, SubscriptionId};
pub use time_travel::{
    ActionLogEntry, DevtoolsCommand, DevtoolsConnection, DevtoolsMessage, TimeTravelHandle,
    TimeTravelRecorder,
};
