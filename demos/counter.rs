//! Self-contained example: a counter driven by middleware, an async
//! "save" action, file persistence, and a time-travel jump.
//!
//! Run with: `RUST_LOG=statefold=debug cargo run --example counter`

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use statefold::{
    Action, AsyncActionExpander, BoxError, FileBlobStore, Flow, PersistenceBridge, Store,
    TimeTravelRecorder, async_stage,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let tmp = tempfile::tempdir()?;
    let store = Store::new();

    // Restores nothing on first run, then mirrors every change to disk.
    let _bridge = PersistenceBridge::attach(&store, Arc::new(FileBlobStore::new(tmp.path())));
    let expander = AsyncActionExpander::install(&store);
    let recorder = TimeTravelRecorder::install(&store);

    // Turn INCREMENT/DECREMENT into SET_STATE writes of the new count.
    let reader = store.clone();
    store.add_middleware(async_stage(move |action: Action| {
        let current = reader
            .get_state("count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        async move {
            let next = match action.action_type.as_str() {
                "INCREMENT" => current + 1,
                "DECREMENT" => current - 1,
                _ => return Ok::<_, BoxError>(Flow::Continue(action)),
            };
            Ok(Flow::Continue(Action::new("SET_STATE", json!({ "count": next }))))
        }
    }));

    expander.register("SAVE_ASYNC", |action| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, BoxError>(json!({ "saved": action.payload }))
    });

    store.subscribe(|event| {
        println!("changed: {} = {}", event.key, event.value);
    });

    for _ in 0..3 {
        store.dispatch("INCREMENT", json!(null)).await?;
    }
    store.dispatch("DECREMENT", json!(null)).await?;
    store
        .dispatch("SAVE_ASYNC", json!({ "count": store.get_state("count") }))
        .await?;
    expander.settled().await;

    println!("count = {}", store.get_state("count").unwrap_or_default());
    println!("recorded {} actions", recorder.len());

    // Back to the state right after the first increment.
    recorder.jump_to(0).await?;
    println!("after jump: count = {}", store.get_state("count").unwrap_or_default());

    assert_eq!(store.get_state("count"), Some(json!(1)));
    assert!(tmp.path().join("statefold_state.json").exists());
    println!("all assertions passed");

    Ok(())
}
