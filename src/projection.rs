//! In-memory read models fed by the dispatcher.
//!
//! A projection is a consumer like any other: its position in the log is
//! the store subscription named after it, advanced by poll/ack. Delivery is
//! at-least-once, so [`Projection::apply`] should tolerate redelivery, for
//! example by remembering the last applied [`CommittedEvent::id`].

use std::any::{Any, TypeId};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::message::{CommittedEvent, Messages};
use crate::pipeline::decode_event;
use crate::registry::{BoxFuture, Handler};
use crate::snapshot::Snapshot;

/// A read model built from events across all streams.
///
/// # Contract
///
/// - [`apply`](Projection::apply) must be deterministic: given the same
///   sequence of events, it must produce the same state.
pub trait Projection: Default + Clone + Send + Sync + 'static {
    /// Consumer name.
    const NAME: &'static str;

    type Event: Messages;

    /// Event names delivered to `apply`. Defaults to the whole event set.
    fn subscriptions() -> &'static [&'static str] {
        <Self::Event as Messages>::NAMES
    }

    fn apply(&mut self, event: &Self::Event, committed: &CommittedEvent);
}

pub(crate) struct ProjectionHandler<P> {
    state: Arc<Mutex<P>>,
}

impl<P: Projection> ProjectionHandler<P> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(P::default())),
        }
    }
}

impl<P: Projection> Handler for ProjectionHandler<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn events(&self) -> &'static [&'static str] {
        <P::Event as Messages>::NAMES
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        P::subscriptions()
    }

    fn projection(&self) -> Option<(TypeId, Arc<dyn Any + Send + Sync>)> {
        let state: Arc<dyn Any + Send + Sync> = self.state.clone();
        Some((TypeId::of::<P>(), state))
    }

    fn event<'a>(
        &'a self,
        _kernel: &'a Kernel,
        event: &'a CommittedEvent,
    ) -> BoxFuture<'a, KernelResult<Option<Snapshot<Value>>>> {
        Box::pin(async move {
            let typed: P::Event = decode_event(event)?;
            self.state.lock().await.apply(&typed, event);
            Ok(None)
        })
    }
}

/// Downcast the shared state registered for `P`.
pub(crate) fn downcast<P: Projection>(state: Arc<dyn Any + Send + Sync>) -> Option<Arc<Mutex<P>>> {
    state.downcast::<Mutex<P>>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_fixtures::Tally;
    use crate::message::{Command, CommittedEventMetadata};

    fn event(id: u64, name: &str) -> CommittedEvent {
        CommittedEvent {
            id,
            stream: "c-1".into(),
            version: id as i64 - 1,
            created: chrono::Utc::now(),
            name: name.into(),
            data: Value::Null,
            metadata: CommittedEventMetadata::for_command(&Command::new("Increment", Value::Null), None),
        }
    }

    #[test]
    fn registered_state_downcasts_to_its_own_type() {
        let handler = ProjectionHandler::<Tally>::new();
        let (type_id, state) = handler.projection().expect("projection state");
        assert_eq!(type_id, TypeId::of::<Tally>());
        assert!(downcast::<Tally>(state).is_some());
    }

    #[test]
    fn apply_skips_redelivered_ids() {
        let mut tally = Tally::default();
        let first = event(1, "Incremented");
        let typed = first.decode().expect("decode");
        tally.apply(&typed, &first);
        tally.apply(&typed, &first);
        tally.apply(&typed, &event(2, "Incremented"));
        assert_eq!(tally.counts.get("Incremented"), Some(&2));
        assert_eq!(tally.last_id, 2);
    }
}
