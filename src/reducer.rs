//! Folding committed events into artifact state.
//!
//! State is addressed either by stream (aggregates) or by derived actor key
//! (process managers). Loading optionally starts from a cached snapshot or
//! the newest in-stream checkpoint and replays only what follows; with
//! snapshots disabled every event is replayed from `Default::default()` and
//! the result must be identical.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::KernelResult;
use crate::message::{CommittedEvent, Messages, STATE_CHECKPOINT};
use crate::snapshot::{Snapshot, SnapshotMode, SnapshotStore};
use crate::store::{Query, Store};

/// Reduce function used as a function pointer per artifact type.
pub type ReduceFn<S> = fn(S, &CommittedEvent) -> S;

/// How an artifact's events are selected from the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Every event of one stream.
    Stream(String),
    /// Every event caused by a command issued under one actor id.
    Actor(String),
}

impl Address {
    /// The stream or actor key. Also the snapshot id.
    pub fn id(&self) -> &str {
        match self {
            Address::Stream(id) | Address::Actor(id) => id,
        }
    }

    pub fn query(&self) -> Query {
        match self {
            Address::Stream(stream) => Query::stream(stream.as_str()),
            Address::Actor(key) => Query::actor(key.as_str()),
        }
    }
}

/// Options for a single load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Start from cached snapshots and checkpoints. Default: `true`.
    pub use_snapshots: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            use_snapshots: true,
        }
    }
}

impl LoadOptions {
    /// Replay from the first event, ignoring every cache.
    pub fn full_replay() -> Self {
        Self {
            use_snapshots: false,
        }
    }
}

/// Payload of a [`STATE_CHECKPOINT`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    pub state: S,
    /// Events matched by the address before the checkpoint itself.
    pub event_count: u64,
}

/// Fold `event` through `apply` if its name belongs to `M`.
///
/// Names outside the set are skipped. A payload that no longer matches its
/// variant is skipped with a warning rather than failing the load.
pub fn fold<M: Messages, S>(state: S, event: &CommittedEvent, apply: fn(S, &M) -> S) -> S {
    if !M::accepts(&event.name) {
        return state;
    }
    match event.decode::<M>() {
        Ok(message) => apply(state, &message),
        Err(e) => {
            tracing::warn!(
                id = event.id,
                stream = %event.stream,
                name = %event.name,
                error = %e,
                "skipping undecodable event during replay"
            );
            state
        }
    }
}

/// Advance `snapshot` past one event matched by its address.
///
/// Checkpoints count towards `event_count` but only replace state when
/// `use_checkpoints` is set and they were written to the address's own
/// stream.
pub(crate) fn fold_into<S>(
    snapshot: &mut Snapshot<S>,
    event: &CommittedEvent,
    id: &str,
    reduce: ReduceFn<S>,
    use_checkpoints: bool,
) where
    S: Default + DeserializeOwned,
{
    snapshot.event_count += 1;
    if event.name == STATE_CHECKPOINT {
        if use_checkpoints && event.stream == id {
            match serde_json::from_value::<Checkpoint<S>>(event.data.clone()) {
                Ok(checkpoint) => {
                    snapshot.state = checkpoint.state;
                    snapshot.state_count += 1;
                    snapshot.apply_count = 0;
                }
                Err(e) => tracing::warn!(
                    id = event.id,
                    stream = %event.stream,
                    error = %e,
                    "ignoring undecodable checkpoint"
                ),
            }
        }
    } else {
        let state = std::mem::take(&mut snapshot.state);
        snapshot.state = reduce(state, event);
        snapshot.apply_count += 1;
    }
    snapshot.event = Some(event.clone());
}

/// Loads and caches state for one artifact.
pub struct Replay<S> {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) snapshots: Arc<dyn SnapshotStore>,
    pub(crate) artifact: &'static str,
    pub(crate) mode: SnapshotMode,
    pub(crate) reduce: ReduceFn<S>,
}

impl<S> Replay<S>
where
    S: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn Store>,
        snapshots: Arc<dyn SnapshotStore>,
        artifact: &'static str,
        mode: SnapshotMode,
        reduce: ReduceFn<S>,
    ) -> Self {
        Self {
            store,
            snapshots,
            artifact,
            mode,
            reduce,
        }
    }

    /// Reduce the current state at `address`.
    ///
    /// # Errors
    ///
    /// Propagates store failures. Snapshot-store read failures and
    /// unreadable snapshots degrade to a full replay.
    pub async fn load(&self, address: &Address, options: LoadOptions) -> KernelResult<Snapshot<S>> {
        let id = address.id();
        let mut snapshot = Snapshot::new(self.artifact, S::default());
        let use_cache = options.use_snapshots && self.mode == SnapshotMode::Store;
        let use_checkpoints = options.use_snapshots && self.mode == SnapshotMode::Checkpoint;

        if use_cache {
            if let Some(cached) = self.read_cached(id).await {
                snapshot = cached;
            }
        }

        if use_checkpoints {
            let mut query = address.query().with_names([STATE_CHECKPOINT]).backward().with_limit(1);
            query.stream = Some(id.to_owned());
            query.after = snapshot.event.as_ref().map(|e| e.id);
            let newest = self.store.read(&query).await?;
            if let Some(event) = newest.into_iter().next() {
                match serde_json::from_value::<Checkpoint<S>>(event.data.clone()) {
                    Ok(checkpoint) => {
                        snapshot.state = checkpoint.state;
                        snapshot.event_count = checkpoint.event_count + 1;
                        snapshot.state_count += 1;
                        snapshot.apply_count = 0;
                        snapshot.event = Some(event);
                    }
                    Err(e) => tracing::warn!(
                        artifact = self.artifact,
                        id,
                        error = %e,
                        "ignoring undecodable checkpoint"
                    ),
                }
            }
        }

        let mut query = address.query();
        query.after = snapshot.event.as_ref().map(|e| e.id);
        let reduce = self.reduce;
        self.store
            .query(&query, &mut |event: &CommittedEvent| {
                fold_into(&mut snapshot, event, id, reduce, use_checkpoints)
            })
            .await?;

        Ok(snapshot)
    }

    /// Cached snapshot with its per-read counters reset, or `None`.
    async fn read_cached(&self, id: &str) -> Option<Snapshot<S>> {
        let cached = match self.snapshots.read(self.artifact, id).await {
            Ok(cached) => cached?,
            Err(e) => {
                tracing::warn!(artifact = self.artifact, id, error = %e, "snapshot read failed");
                return None;
            }
        };
        match cached.decode::<S>() {
            Ok(snapshot) => Some(Snapshot {
                apply_count: 0,
                state_count: 0,
                ..snapshot
            }),
            Err(e) => {
                tracing::warn!(
                    artifact = self.artifact,
                    id,
                    error = %e,
                    "cached snapshot no longer matches state; replaying"
                );
                None
            }
        }
    }

    /// Upsert `snapshot` into the snapshot store.
    ///
    /// Failures are logged and swallowed: the snapshot is only a cache.
    pub async fn persist(&self, id: &str, snapshot: &Snapshot<S>) {
        let value = match snapshot.clone().into_value() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(artifact = self.artifact, id, error = %e, "snapshot encode failed");
                return;
            }
        };
        match self.snapshots.upsert(id, &value).await {
            Ok(()) => tracing::debug!(artifact = self.artifact, id, "snapshot written"),
            Err(e) => tracing::warn!(artifact = self.artifact, id, error = %e, "snapshot write failed"),
        }
    }
}
