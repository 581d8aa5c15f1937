//! Replay equivalence: snapshots change how much is replayed, never the state.

mod common;

use std::sync::Arc;

use common::{Calculator, press};
use eventfold_kernel::{
    FileSnapshotStore, Kernel, KernelError, LoadOptions, Query, STATE_CHECKPOINT,
    SnapshotOptions, snapshot_path,
};
use serde_json::json;

const KEYS: [&str; 6] = ["1", "+", "2", ".", "3", "="];

async fn press_all(kernel: &Kernel, stream: &str) {
    for key in KEYS {
        kernel.command(press(stream, key)).await.expect("press key");
    }
}

#[tokio::test]
async fn keys_reduce_to_a_result() {
    common::init_tracing();
    let kernel = Kernel::builder()
        .aggregate::<Calculator>()
        .build()
        .expect("build");
    press_all(&kernel, "calc-1").await;

    let snapshot = kernel
        .load("Calculator", "calc-1", LoadOptions::default())
        .await
        .expect("load");
    assert_eq!(snapshot.state, json!({ "left": "3.3", "result": 3.3 }));
    assert_eq!(snapshot.apply_count, 6);
    assert_eq!(snapshot.event_count, 6);
    assert_eq!(snapshot.version(), 5);
}

#[tokio::test]
async fn store_snapshots_skip_replay() {
    common::init_tracing();
    let kernel = Kernel::builder()
        .aggregate_with::<Calculator>(SnapshotOptions::store(2))
        .build()
        .expect("build");
    press_all(&kernel, "calc-1").await;

    let cached = kernel
        .load_aggregate::<Calculator>("calc-1", LoadOptions::default())
        .await
        .expect("load");
    let full = kernel
        .load_aggregate::<Calculator>("calc-1", LoadOptions::full_replay())
        .await
        .expect("load");

    assert_eq!(cached.state, full.state);
    assert_eq!(cached.state.result, Some(3.3));
    assert_eq!(cached.apply_count, 0);
    assert_eq!(full.apply_count, 6);
    assert_eq!(cached.version(), full.version());
}

#[tokio::test]
async fn checkpoints_skip_replay() {
    common::init_tracing();
    let kernel = Kernel::builder()
        .aggregate_with::<Calculator>(SnapshotOptions::checkpoint(2))
        .build()
        .expect("build");
    press_all(&kernel, "calc-1").await;

    let checkpoints = kernel
        .query(&Query::stream("calc-1").with_names([STATE_CHECKPOINT]))
        .await
        .expect("query");
    assert_eq!(checkpoints.len(), 2);

    let cached = kernel
        .load_aggregate::<Calculator>("calc-1", LoadOptions::default())
        .await
        .expect("load");
    let full = kernel
        .load_aggregate::<Calculator>("calc-1", LoadOptions::full_replay())
        .await
        .expect("load");

    assert_eq!(cached.state, full.state);
    assert_eq!(cached.apply_count, 0);
    assert_eq!(full.apply_count, 6);
    // Checkpoints are events too.
    assert_eq!(cached.event_count, 8);
    assert_eq!(full.event_count, 8);
}

#[tokio::test]
async fn file_snapshots_survive_a_new_kernel() {
    common::init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let first = Kernel::builder()
        .snapshot_store(Arc::new(FileSnapshotStore::new(dir.path())))
        .aggregate_with::<Calculator>(SnapshotOptions::store(2))
        .build()
        .expect("build");
    press_all(&first, "calc-1").await;
    assert!(snapshot_path(dir.path(), "Calculator", "calc-1").exists());

    // Same log, fresh process-local state.
    let second = Kernel::builder()
        .store(Arc::clone(first.store()))
        .snapshot_store(Arc::new(FileSnapshotStore::new(dir.path())))
        .aggregate_with::<Calculator>(SnapshotOptions::store(2))
        .build()
        .expect("build");
    let snapshot = second
        .load_aggregate::<Calculator>("calc-1", LoadOptions::default())
        .await
        .expect("load");
    assert_eq!(snapshot.state.result, Some(3.3));
    assert_eq!(snapshot.apply_count, 0);
}

#[tokio::test]
async fn invalid_keys_are_rejected_without_commits() {
    common::init_tracing();
    let kernel = Kernel::builder()
        .aggregate::<Calculator>()
        .build()
        .expect("build");

    let err = kernel.command(press("calc-1", "x")).await.unwrap_err();
    assert!(matches!(err, KernelError::Handler { .. }), "got: {err}");

    let err = kernel.command(press("calc-1", "=")).await.unwrap_err();
    assert!(matches!(err, KernelError::Invariant { .. }), "got: {err}");

    let events = kernel.query(&Query::stream("calc-1")).await.expect("query");
    assert!(events.is_empty());
}
