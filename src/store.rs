//! The append-only store contract.
//!
//! A [`Store`] is the single source of truth for committed events and the
//! only place where concurrency is arbitrated. Adapters must implement the
//! contract identically; [`InMemoryStore`](crate::InMemoryStore) is the
//! reference adapter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::message::{CommittedEvent, CommittedEventMetadata, Message, STATE_CHECKPOINT};

/// Filter for [`Store::query`]. The default value reads the whole log.
///
/// All set fields must match. Id and timestamp bounds are exclusive.
///
/// # Examples
///
/// ```
/// use eventfold_kernel::Query;
///
/// let q = Query::stream("room-1").with_names(["RoomBooked"]).with_limit(10);
/// assert_eq!(q.stream.as_deref(), Some("room-1"));
/// assert_eq!(q.limit, Some(10));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub stream: Option<String>,
    /// Event names; empty matches every name.
    pub names: Vec<String>,
    /// Matches the causing command's actor id.
    pub actor: Option<String>,
    pub correlation: Option<String>,
    pub after: Option<u64>,
    pub before: Option<u64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    /// Descending id order instead of ascending.
    pub backward: bool,
}

impl Query {
    /// Events of one stream.
    pub fn stream(stream: impl Into<String>) -> Self {
        Self {
            stream: Some(stream.into()),
            ..Self::default()
        }
    }

    /// Events caused by commands issued under one actor id.
    pub fn actor(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            ..Self::default()
        }
    }

    /// Events of one correlated flow.
    pub fn correlation(correlation: impl Into<String>) -> Self {
        Self {
            correlation: Some(correlation.into()),
            ..Self::default()
        }
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_after(mut self, id: u64) -> Self {
        self.after = Some(id);
        self
    }

    pub fn with_before(mut self, id: u64) -> Self {
        self.before = Some(id);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn backward(mut self) -> Self {
        self.backward = true;
        self
    }

    /// Returns `true` if `event` passes every filter except `limit`.
    ///
    /// Shared by adapters so the filter semantics stay identical.
    pub fn matches(&self, event: &CommittedEvent) -> bool {
        self.stream.as_ref().is_none_or(|s| *s == event.stream)
            && (self.names.is_empty() || self.names.iter().any(|n| *n == event.name))
            && self
                .actor
                .as_ref()
                .is_none_or(|a| event.metadata.actor_id() == Some(a.as_str()))
            && self
                .correlation
                .as_ref()
                .is_none_or(|c| *c == event.metadata.correlation)
            && self.after.is_none_or(|id| event.id > id)
            && self.before.is_none_or(|id| event.id < id)
            && self.created_after.is_none_or(|t| event.created > t)
            && self.created_before.is_none_or(|t| event.created < t)
    }
}

/// A consumer's position in the log.
///
/// Created lazily by the first [`Store::poll`] for the consumer name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub consumer: String,
    /// Last acknowledged event id; `0` before the first ack.
    pub watermark: u64,
    /// Outstanding lease token.
    pub lease: Option<String>,
    /// When the outstanding lease lapses.
    pub expires: Option<DateTime<Utc>>,
}

impl Subscription {
    /// A fresh position for `consumer`: watermark 0, no lease.
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            watermark: 0,
            lease: None,
            expires: None,
        }
    }

    /// Returns `true` if a lease is outstanding and has not lapsed at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_some() && self.expires.is_some_and(|e| e > now)
    }
}

/// A time-bounded, token-protected grant to process a batch of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub consumer: String,
    /// Watermark at grant time.
    pub watermark: u64,
    /// Lease token; must be presented to [`Store::ack`].
    pub lease: String,
    pub expires: DateTime<Utc>,
    /// Events after `watermark`, in id order.
    pub events: Vec<CommittedEvent>,
}

/// Per-name counts and extrema, for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStat {
    pub name: String,
    pub count: u64,
    pub first_id: u64,
    pub last_id: u64,
    pub first_created: DateTime<Utc>,
    pub last_created: DateTime<Utc>,
}

/// The append-only, globally ordered event log.
///
/// # Contract
///
/// - `commit` appends with consecutive per-stream versions and strictly
///   increasing global ids. The stream version check, the actor count check
///   and the append are one atomic step: a failed check appends nothing.
/// - `poll` grants at most one live lease per consumer.
/// - `ack` only succeeds for the live lease's token. A `false` result is a
///   signal to re-poll, not an error.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Adapter name, for logs.
    fn name(&self) -> &str;

    /// Stream matching events to `callback` in id order. Returns the count.
    async fn query(
        &self,
        query: &Query,
        callback: &mut (dyn for<'e> FnMut(&'e CommittedEvent) + Send),
    ) -> StoreResult<u64>;

    /// Collect matching events.
    async fn read(&self, query: &Query) -> StoreResult<Vec<CommittedEvent>> {
        let mut events = Vec::new();
        self.query(query, &mut |e: &CommittedEvent| events.push(e.clone()))
            .await?;
        Ok(events)
    }

    /// Append `events` to `stream`.
    ///
    /// `expected_version` is compared with the stream's current max version
    /// (`-1` when empty). `metadata.causation.command.actor.expected_count`,
    /// when set, is compared with the number of events already committed
    /// under that actor id.
    ///
    /// # Errors
    ///
    /// [`StoreError::Concurrency`](crate::StoreError::Concurrency) or
    /// [`StoreError::ActorConcurrency`](crate::StoreError::ActorConcurrency)
    /// when a check fails.
    async fn commit(
        &self,
        stream: &str,
        events: Vec<Message>,
        metadata: CommittedEventMetadata,
        expected_version: Option<i64>,
    ) -> StoreResult<Vec<CommittedEvent>>;

    /// Try to lease the next batch of events matching `names` for `consumer`.
    ///
    /// Returns `None` while another lease is live or when nothing new
    /// matches. An empty `names` matches every event except checkpoints.
    async fn poll(
        &self,
        consumer: &str,
        names: &[String],
        limit: usize,
        timeout: Duration,
    ) -> StoreResult<Option<Lease>>;

    /// Release `lease` and advance the watermark.
    ///
    /// `watermark` defaults to the id of the lease's last event.
    async fn ack(&self, lease: &Lease, watermark: Option<u64>) -> StoreResult<bool>;

    /// All subscriptions, ordered by consumer name.
    async fn subscriptions(&self) -> StoreResult<Vec<Subscription>>;

    /// Per-name statistics, ordered by name.
    async fn stats(&self) -> StoreResult<Vec<StoreStat>>;
}

/// Returns `true` if a polled consumer with `names` should receive `event`.
pub fn is_deliverable(names: &[String], event: &CommittedEvent) -> bool {
    event.name != STATE_CHECKPOINT && (names.is_empty() || names.iter().any(|n| *n == event.name))
}

/// Lease deadline, saturating on overflow.
pub(crate) fn deadline(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Actor, Causation, CommandCausation};

    fn event(id: u64, stream: &str, name: &str, actor: Option<&str>) -> CommittedEvent {
        CommittedEvent {
            id,
            stream: stream.into(),
            version: 0,
            created: Utc::now(),
            name: name.into(),
            data: serde_json::Value::Null,
            metadata: CommittedEventMetadata {
                correlation: "c-1".into(),
                causation: Causation {
                    command: Some(CommandCausation {
                        name: "Cmd".into(),
                        stream: Some(stream.into()),
                        expected_version: None,
                        actor: actor.map(|a| Actor::new(a, "tester")),
                    }),
                    event: None,
                },
            },
        }
    }

    #[test]
    fn default_query_matches_everything() {
        assert!(Query::default().matches(&event(1, "a", "X", None)));
    }

    #[test]
    fn query_bounds_are_exclusive() {
        let q = Query::default().with_after(1).with_before(3);
        assert!(!q.matches(&event(1, "a", "X", None)));
        assert!(q.matches(&event(2, "a", "X", None)));
        assert!(!q.matches(&event(3, "a", "X", None)));
    }

    #[test]
    fn actor_filter_reads_causation() {
        let q = Query::actor("2024-03");
        assert!(q.matches(&event(1, "room-1", "RoomBooked", Some("2024-03"))));
        assert!(!q.matches(&event(2, "room-1", "RoomBooked", Some("2024-04"))));
        assert!(!q.matches(&event(3, "room-1", "RoomBooked", None)));
    }

    #[test]
    fn names_and_stream_combine() {
        let q = Query::stream("a").with_names(["X", "Y"]);
        assert!(q.matches(&event(1, "a", "Y", None)));
        assert!(!q.matches(&event(2, "a", "Z", None)));
        assert!(!q.matches(&event(3, "b", "X", None)));
    }

    #[test]
    fn checkpoints_are_never_deliverable() {
        assert!(!is_deliverable(&[], &event(1, "a", STATE_CHECKPOINT, None)));
        assert!(is_deliverable(&[], &event(2, "a", "X", None)));
        assert!(!is_deliverable(&["Y".into()], &event(3, "a", "X", None)));
    }

    #[test]
    fn deadline_saturates() {
        let now = Utc::now();
        assert_eq!(deadline(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(deadline(now, Duration::from_secs(1)) > now);
    }

    #[test]
    fn subscription_lease_lapses() {
        let now = Utc::now();
        let mut sub = Subscription::new("c");
        assert!(!sub.is_leased(now));
        sub.lease = Some("t".into());
        sub.expires = Some(now);
        assert!(!sub.is_leased(now));
        sub.expires = Some(deadline(now, Duration::from_secs(5)));
        assert!(sub.is_leased(now));
    }
}
