//! Snapshots of reduced state and the stores that cache them.
//!
//! Snapshots are pure caches: deleting one never changes computed state,
//! only replay cost. [`FileSnapshotStore`] lays them out as
//! `<base_dir>/snapshots/<artifact>/<id>/snapshot.json` and writes through a
//! temp file and rename so readers never see a partial write.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreResult;
use crate::message::CommittedEvent;

/// Reduced state of one stream or actor plus replay counters.
///
/// `artifact` names the artifact whose reducer produced `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize", deserialize = "S: DeserializeOwned"))]
pub struct Snapshot<S> {
    pub artifact: String,
    pub state: S,
    /// Last event folded into `state`.
    pub event: Option<CommittedEvent>,
    /// Ordinary events folded since the last snapshot or checkpoint.
    pub apply_count: u64,
    /// Checkpoint events folded since the last snapshot-store read.
    pub state_count: u64,
    /// Every event matched by the address since `init`, including the
    /// ones a cached snapshot or checkpoint stands in for.
    pub event_count: u64,
}

impl<S> Snapshot<S> {
    /// A snapshot of `state` with zeroed counters.
    pub fn new(artifact: impl Into<String>, state: S) -> Self {
        Self {
            artifact: artifact.into(),
            state,
            event: None,
            apply_count: 0,
            state_count: 0,
            event_count: 0,
        }
    }

    /// Version of the last folded event, or `-1` if nothing was folded.
    pub fn version(&self) -> i64 {
        self.event.as_ref().map_or(-1, |e| e.version)
    }
}

impl<S: Serialize> Snapshot<S> {
    /// Erase the state type.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the state fails to serialize.
    pub fn into_value(self) -> serde_json::Result<Snapshot<Value>> {
        Ok(Snapshot {
            artifact: self.artifact,
            state: serde_json::to_value(&self.state)?,
            event: self.event,
            apply_count: self.apply_count,
            state_count: self.state_count,
            event_count: self.event_count,
        })
    }
}

impl Snapshot<Value> {
    /// Recover the typed state.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the state does not match `S`.
    pub fn decode<S: DeserializeOwned>(self) -> serde_json::Result<Snapshot<S>> {
        Ok(Snapshot {
            artifact: self.artifact,
            state: serde_json::from_value(self.state)?,
            event: self.event,
            apply_count: self.apply_count,
            state_count: self.state_count,
            event_count: self.event_count,
        })
    }
}

/// Where an artifact writes snapshots after a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Never write; every load replays from `init`.
    #[default]
    Off,
    /// Upsert into the kernel's [`SnapshotStore`].
    Store,
    /// Append a state checkpoint event inside the commit being made.
    Checkpoint,
}

/// Custom write predicate over the snapshot a commit produced.
pub type SnapshotPredicate = fn(&Snapshot<Value>) -> bool;

/// Per-artifact snapshot policy.
///
/// # Examples
///
/// ```
/// use eventfold_kernel::{SnapshotMode, SnapshotOptions};
///
/// let opts = SnapshotOptions::store(2);
/// assert_eq!(opts.mode, SnapshotMode::Store);
/// assert_eq!(SnapshotOptions::default().mode, SnapshotMode::Off);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SnapshotOptions {
    pub mode: SnapshotMode,
    /// Write once `apply_count` exceeds this, unless `predicate` is set.
    ///
    /// Default: 10.
    pub threshold: u64,
    pub predicate: Option<SnapshotPredicate>,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            mode: SnapshotMode::Off,
            threshold: 10,
            predicate: None,
        }
    }
}

impl SnapshotOptions {
    /// Snapshot-store writes past `threshold`.
    pub fn store(threshold: u64) -> Self {
        Self {
            mode: SnapshotMode::Store,
            threshold,
            predicate: None,
        }
    }

    /// In-stream checkpoints past `threshold`.
    pub fn checkpoint(threshold: u64) -> Self {
        Self {
            mode: SnapshotMode::Checkpoint,
            threshold,
            predicate: None,
        }
    }

    /// Replace the threshold test with `predicate`.
    pub fn with_predicate(mut self, predicate: SnapshotPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Evaluate the write policy. Always `false` in [`SnapshotMode::Off`].
    pub fn should_write(&self, snapshot: &Snapshot<Value>) -> bool {
        match (self.mode, self.predicate) {
            (SnapshotMode::Off, _) => false,
            (_, Some(predicate)) => predicate(snapshot),
            (_, None) => snapshot.apply_count > self.threshold,
        }
    }
}

/// Cache of snapshots keyed by `(artifact, id)`.
///
/// `id` is the stream for aggregates and the actor key for process managers.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    async fn read(&self, artifact: &str, id: &str) -> StoreResult<Option<Snapshot<Value>>>;

    /// Insert or replace the snapshot for `(snapshot.artifact, id)`.
    async fn upsert(&self, id: &str, snapshot: &Snapshot<Value>) -> StoreResult<()>;
}

/// Process-local snapshot cache.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<(String, String), Snapshot<Value>>>,
}

impl InMemorySnapshotStore {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn read(&self, artifact: &str, id: &str) -> StoreResult<Option<Snapshot<Value>>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(&(artifact.to_owned(), id.to_owned()))
            .cloned())
    }

    async fn upsert(&self, id: &str, snapshot: &Snapshot<Value>) -> StoreResult<()> {
        self.snapshots
            .write()
            .await
            .insert((snapshot.artifact.clone(), id.to_owned()), snapshot.clone());
        Ok(())
    }
}

/// JSON-file snapshot cache rooted at a base directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    base_dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store rooted at `base_dir`.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Parent of the `snapshots/` tree. Created lazily on the
    ///   first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Compute the filesystem path for a snapshot file.
///
/// # Returns
///
/// `<base_dir>/snapshots/<artifact>/<id>/snapshot.json`
pub fn snapshot_path(base_dir: &Path, artifact: &str, id: &str) -> PathBuf {
    base_dir
        .join("snapshots")
        .join(artifact)
        .join(id)
        .join("snapshot.json")
}

#[async_trait::async_trait]
impl SnapshotStore for FileSnapshotStore {
    /// A missing or corrupt file is a cache miss; corruption is logged.
    async fn read(&self, artifact: &str, id: &str) -> StoreResult<Option<Snapshot<Value>>> {
        let path = snapshot_path(&self.base_dir, artifact, id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Snapshot<Value>>(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }

    async fn upsert(&self, id: &str, snapshot: &Snapshot<Value>) -> StoreResult<()> {
        let path = snapshot_path(&self.base_dir, &snapshot.artifact, id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter_snapshot(value: u64, apply_count: u64) -> Snapshot<Value> {
        Snapshot {
            apply_count,
            event_count: apply_count,
            ..Snapshot::new("Counter", json!({ "value": value }))
        }
    }

    #[test]
    fn snapshot_path_returns_expected_path() {
        let path = snapshot_path(Path::new("/data/app"), "Counter", "c-1");
        assert_eq!(
            path,
            PathBuf::from("/data/app/snapshots/Counter/c-1/snapshot.json")
        );
    }

    #[test]
    fn default_policy_uses_threshold() {
        let opts = SnapshotOptions::store(2);
        assert!(!opts.should_write(&counter_snapshot(1, 2)));
        assert!(opts.should_write(&counter_snapshot(1, 3)));
        assert!(!SnapshotOptions::default().should_write(&counter_snapshot(1, 99)));
    }

    #[test]
    fn predicate_replaces_threshold() {
        let opts = SnapshotOptions::checkpoint(100).with_predicate(|s| s.state["value"] == 7);
        assert!(opts.should_write(&counter_snapshot(7, 0)));
        assert!(!opts.should_write(&counter_snapshot(8, 500)));
    }

    #[test]
    fn version_of_empty_snapshot_is_minus_one() {
        assert_eq!(Snapshot::new("Counter", ()).version(), -1);
    }

    #[tokio::test]
    async fn memory_store_keys_by_artifact_and_id() {
        let store = InMemorySnapshotStore::new();
        store
            .upsert("c-1", &counter_snapshot(4, 3))
            .await
            .expect("upsert");

        let hit = store.read("Counter", "c-1").await.expect("read");
        assert_eq!(hit.expect("cached").state, json!({ "value": 4 }));
        assert!(store.read("Other", "c-1").await.expect("read").is_none());
        assert!(store.read("Counter", "c-2").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn file_store_save_then_load() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());

        store
            .upsert("c-1", &counter_snapshot(42, 7))
            .await
            .expect("upsert should succeed");

        let loaded = store
            .read("Counter", "c-1")
            .await
            .expect("read should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded.state, json!({ "value": 42 }));
        assert_eq!(loaded.apply_count, 7);
    }

    #[tokio::test]
    async fn file_store_missing_is_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());
        assert!(
            store
                .read("Counter", "nope")
                .await
                .expect("read should succeed")
                .is_none()
        );
    }

    #[tokio::test]
    async fn file_store_corrupt_json_is_cache_miss() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = snapshot_path(dir.path(), "Counter", "c-bad");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        std::fs::write(&path, b"this is not valid json!!!").expect("write corrupt file");

        let store = FileSnapshotStore::new(dir.path());
        let result = store
            .read("Counter", "c-bad")
            .await
            .expect("corrupt file is not an error");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn file_store_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());
        store
            .upsert("c-atomic", &counter_snapshot(10, 3))
            .await
            .expect("upsert");

        let final_path = snapshot_path(dir.path(), "Counter", "c-atomic");
        assert!(final_path.exists());
        assert!(!final_path.with_extension("json.tmp").exists());
    }
}
