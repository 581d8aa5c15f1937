//! In-memory [`Store`] adapter.
//!
//! All state lives behind one `tokio::sync::Mutex`, which makes the stream
//! version check, the actor count check and the append a single atomic
//! step even on a multi-threaded runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::message::{CommittedEvent, CommittedEventMetadata, Message};
use crate::store::{Lease, Query, Store, StoreStat, Subscription, deadline, is_deliverable};

#[derive(Debug, Default)]
struct MemoryState {
    /// The log. `events[i].id == i + 1`.
    events: Vec<CommittedEvent>,
    /// Current max version per stream.
    versions: HashMap<String, i64>,
    /// Committed event count per causing actor id.
    actors: HashMap<String, u64>,
    subscriptions: BTreeMap<String, Subscription>,
}

/// Process-local store. Data is lost when the last clone is dropped.
///
/// `Clone` is cheap and clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    /// Create an empty store.
    ///
    /// # Returns
    ///
    /// A store with no events and no subscriptions. Clone it to share the
    /// log between kernels.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn query(
        &self,
        query: &Query,
        callback: &mut (dyn for<'e> FnMut(&'e CommittedEvent) + Send),
    ) -> StoreResult<u64> {
        let state = self.state.lock().await;
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut count = 0u64;
        let mut emit = |event: &CommittedEvent| {
            callback(event);
            count += 1;
        };
        if query.backward {
            state
                .events
                .iter()
                .rev()
                .filter(|e| query.matches(e))
                .take(limit)
                .for_each(&mut emit);
        } else {
            state
                .events
                .iter()
                .filter(|e| query.matches(e))
                .take(limit)
                .for_each(&mut emit);
        }
        Ok(count)
    }

    async fn commit(
        &self,
        stream: &str,
        events: Vec<Message>,
        metadata: CommittedEventMetadata,
        expected_version: Option<i64>,
    ) -> StoreResult<Vec<CommittedEvent>> {
        let mut state = self.state.lock().await;

        let last_version = state.versions.get(stream).copied().unwrap_or(-1);
        if let Some(expected) = expected_version.filter(|v| *v != last_version) {
            tracing::warn!(
                stream,
                expected_version = expected,
                last_version,
                "commit rejected: stale expected version"
            );
            return Err(StoreError::Concurrency {
                stream: stream.to_owned(),
                last_version,
                expected_version: expected,
                events,
            });
        }

        let actor = metadata.actor().cloned();
        if let Some((actor, expected_count)) = actor
            .as_ref()
            .and_then(|a| a.expected_count.map(|count| (a, count)))
        {
            let count = state.actors.get(&actor.id).copied().unwrap_or(0);
            if count != expected_count {
                tracing::warn!(
                    stream,
                    actor = %actor.id,
                    expected_count,
                    count,
                    "commit rejected: stale actor count"
                );
                return Err(StoreError::ActorConcurrency {
                    actor: actor.id.clone(),
                    count,
                    expected_count,
                    events,
                });
            }
        }

        if events.is_empty() {
            return Ok(Vec::new());
        }

        let created = Utc::now();
        let mut committed = Vec::with_capacity(events.len());
        for (offset, message) in events.into_iter().enumerate() {
            let event = CommittedEvent {
                id: state.events.len() as u64 + 1,
                stream: stream.to_owned(),
                version: last_version + 1 + offset as i64,
                created,
                name: message.name,
                data: message.data,
                metadata: metadata.clone(),
            };
            state.events.push(event.clone());
            committed.push(event);
        }

        let appended = committed.len();
        state
            .versions
            .insert(stream.to_owned(), last_version + appended as i64);
        if let Some(actor) = actor {
            *state.actors.entry(actor.id).or_insert(0) += appended as u64;
        }

        tracing::debug!(
            stream,
            count = appended,
            first_id = committed[0].id,
            "events committed"
        );
        Ok(committed)
    }

    async fn poll(
        &self,
        consumer: &str,
        names: &[String],
        limit: usize,
        timeout: Duration,
    ) -> StoreResult<Option<Lease>> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let subscription = state
            .subscriptions
            .entry(consumer.to_owned())
            .or_insert_with(|| Subscription::new(consumer));
        if subscription.is_leased(now) {
            return Ok(None);
        }

        let watermark = subscription.watermark;
        let events: Vec<CommittedEvent> = state
            .events
            .iter()
            .skip(watermark as usize)
            .filter(|e| is_deliverable(names, e))
            .take(limit)
            .cloned()
            .collect();

        if events.is_empty() {
            subscription.lease = None;
            subscription.expires = None;
            return Ok(None);
        }

        let lease = Uuid::new_v4().to_string();
        let expires = deadline(now, timeout);
        subscription.lease = Some(lease.clone());
        subscription.expires = Some(expires);

        tracing::debug!(
            consumer,
            watermark,
            count = events.len(),
            "lease granted"
        );
        Ok(Some(Lease {
            consumer: consumer.to_owned(),
            watermark,
            lease,
            expires,
            events,
        }))
    }

    async fn ack(&self, lease: &Lease, watermark: Option<u64>) -> StoreResult<bool> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(subscription) = state.subscriptions.get_mut(&lease.consumer) else {
            return Ok(false);
        };

        let owned = subscription.lease.as_deref() == Some(lease.lease.as_str())
            && subscription.is_leased(now);
        if !owned {
            tracing::debug!(consumer = %lease.consumer, "ack rejected: lease lost or expired");
            return Ok(false);
        }

        let acked = watermark
            .or_else(|| lease.events.last().map(|e| e.id))
            .unwrap_or(subscription.watermark);
        subscription.watermark = subscription.watermark.max(acked);
        subscription.lease = None;
        subscription.expires = None;
        Ok(true)
    }

    async fn subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.values().cloned().collect())
    }

    async fn stats(&self) -> StoreResult<Vec<StoreStat>> {
        let state = self.state.lock().await;
        let mut stats: BTreeMap<&str, StoreStat> = BTreeMap::new();
        for event in &state.events {
            stats
                .entry(event.name.as_str())
                .and_modify(|s| {
                    s.count += 1;
                    s.last_id = event.id;
                    s.last_created = event.created;
                })
                .or_insert_with(|| StoreStat {
                    name: event.name.clone(),
                    count: 1,
                    first_id: event.id,
                    last_id: event.id,
                    first_created: event.created,
                    last_created: event.created,
                });
        }
        Ok(stats.into_values().collect())
    }
}
