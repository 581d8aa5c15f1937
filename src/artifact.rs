//! Artifact traits: the user-implemented units the kernel drives.
//!
//! Each artifact names itself with a `NAME` constant and declares typed,
//! adjacently tagged message sets ([`Messages`]). The kernel resolves every
//! name once, at registration, and decodes untyped payloads into these sets
//! before any artifact code runs.

use serde::{Serialize, de::DeserializeOwned};

use crate::message::{Actor, Command, CommittedEvent, Messages};

/// A named precondition over aggregate state, checked before `handle`.
pub struct Invariant<S> {
    /// Reported in [`KernelError::Invariant`](crate::KernelError::Invariant).
    pub description: &'static str,
    /// Returns `true` when the command may proceed.
    pub holds: fn(&S, Option<&Actor>) -> bool,
}

impl<S> Invariant<S> {
    /// Pair a predicate with the description reported when it fails.
    pub fn new(description: &'static str, holds: fn(&S, Option<&Actor>) -> bool) -> Self {
        Self { description, holds }
    }
}

impl<S> std::fmt::Debug for Invariant<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invariant")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A consistency boundary whose state is derived from its own stream.
///
/// The implementing type itself serves as the aggregate's state.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no side effects. Returning `Ok(vec![])` makes the command a no-op.
/// - [`apply`](Aggregate::apply) must be pure and total.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Artifact name. Also the key of cached snapshots.
    const NAME: &'static str;

    type Command: Messages;
    type Event: Messages;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Preconditions for `command`, checked in order against loaded state.
    fn given(_command: &Self::Command) -> Vec<Invariant<Self>> {
        Vec::new()
    }

    /// Decide which events `command` produces.
    fn handle(
        &self,
        command: Self::Command,
        actor: Option<&Actor>,
    ) -> Result<Vec<Self::Event>, Self::Error>;

    /// Fold one event into the next state.
    fn apply(self, event: &Self::Event) -> Self;
}

/// A stateless gateway to the outside world.
///
/// Systems handle streamless commands, perform their side effect, and
/// record what happened in `command.stream` or, when absent, a stream named
/// after the system.
#[async_trait::async_trait]
pub trait System: Send + Sync + 'static {
    const NAME: &'static str;

    type Command: Messages;
    type Event: Messages;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn handle(
        &self,
        command: Self::Command,
        actor: Option<&Actor>,
    ) -> Result<Vec<Self::Event>, Self::Error>;
}

/// A stateless reaction: an event in, at most one command out.
///
/// Subscribes to every name in `Self::Event`.
pub trait Policy: Send + Sync + 'static {
    const NAME: &'static str;

    type Event: Messages;
    type Error: std::error::Error + Send + Sync + 'static;

    fn on(
        &self,
        event: &Self::Event,
        committed: &CommittedEvent,
    ) -> Result<Option<Command>, Self::Error>;
}

/// A long-running workflow keyed by a derived actor.
///
/// State is reduced from every event caused under the actor key, across
/// streams: the commands the manager issued and the triggering events it
/// recorded in its own stream (named after the key). `Self::Event` must
/// therefore cover both, while [`subscriptions`](ProcessManager::subscriptions)
/// lists only the names that trigger [`on`](ProcessManager::on).
///
/// # Contract
///
/// - [`actor`](ProcessManager::actor) must be deterministic.
/// - [`on`](ProcessManager::on) sees the state before the triggering event
///   is folded.
pub trait ProcessManager:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const NAME: &'static str;

    type Event: Messages;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Event names delivered to `on`. Defaults to the whole event set.
    fn subscriptions() -> &'static [&'static str] {
        <Self::Event as Messages>::NAMES
    }

    /// Derive the actor key, e.g. the month of a booking request.
    fn actor(event: &Self::Event, committed: &CommittedEvent) -> String;

    fn on(
        &self,
        event: &Self::Event,
        committed: &CommittedEvent,
    ) -> Result<Option<Command>, Self::Error>;

    fn apply(self, event: &Self::Event) -> Self;
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;

    #[test]
    fn handle_then_apply() {
        let counter = Counter::default();
        let events = counter.handle(CounterCommand::Increment, None).unwrap();
        let state = events.iter().fold(counter, |s, e| s.apply(e));
        assert_eq!(state.value, 1);
    }

    #[test]
    fn zero_addition_is_a_no_op() {
        let events = Counter::default()
            .handle(CounterCommand::Add { amount: 0 }, None)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn overflow_is_a_domain_error() {
        let counter = Counter { value: u64::MAX };
        let err = counter
            .handle(CounterCommand::Add { amount: 1 }, None)
            .unwrap_err();
        assert!(matches!(err, CounterError::Overflow));
    }

    #[test]
    fn invariants_see_state_and_actor() {
        let [positive] = <[_; 1]>::try_from(Counter::given(&CounterCommand::Decrement)).unwrap();
        assert!(!(positive.holds)(&Counter::default(), None));
        assert!((positive.holds)(&Counter { value: 1 }, None));

        let [admin] =
            <[_; 1]>::try_from(Counter::given(&CounterCommand::Add { amount: 500 })).unwrap();
        let alice = Actor::new("u-1", "Alice").with_roles(["admin"]);
        assert!((admin.holds)(&Counter::default(), Some(&alice)));
        assert!(!(admin.holds)(&Counter::default(), Some(&Actor::new("u-2", "Bob"))));
        assert!(!(admin.holds)(&Counter::default(), None));

        assert!(Counter::given(&CounterCommand::Add { amount: 5 }).is_empty());
    }

    #[test]
    fn process_manager_subscriptions_narrow_the_event_set() {
        assert_eq!(Milestones::subscriptions(), &["Incremented"]);
        assert_eq!(CounterEvent::NAMES.len(), 3);
    }
}
