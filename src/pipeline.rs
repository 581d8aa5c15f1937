//! Typed handlers behind the registry: validate, load, invoke, cascade,
//! commit, snapshot, notify.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::artifact::{Aggregate, Policy, ProcessManager, System};
use crate::error::{KernelError, KernelResult, StoreError};
use crate::kernel::{Dispatched, Kernel};
use crate::message::{
    Actor, Causation, Command, CommandCausation, CommittedEvent, CommittedEventMetadata,
    EventCausation, Message, Messages, STATE_CHECKPOINT,
};
use crate::reducer::{self, Address, Checkpoint, LoadOptions, Replay};
use crate::registry::{BoxFuture, Handler};
use crate::snapshot::{Snapshot, SnapshotMode, SnapshotOptions};

/// Decode a command into `M`, telling unknown names from bad payloads.
pub(crate) fn decode_command<M: Messages>(command: &Command) -> KernelResult<M> {
    if !M::accepts(&command.name) {
        return Err(KernelError::registration(
            command.name.as_str(),
            "not in the artifact's command set",
        ));
    }
    command
        .decode()
        .map_err(|e| KernelError::validation(command.name.as_str(), e))
}

pub(crate) fn decode_event<M: Messages>(event: &CommittedEvent) -> KernelResult<M> {
    if !M::accepts(&event.name) {
        return Err(KernelError::registration(
            event.name.as_str(),
            "not in the artifact's event set",
        ));
    }
    event
        .decode()
        .map_err(|e| KernelError::validation(event.name.as_str(), e))
}

pub(crate) fn reduce_aggregate<A: Aggregate>(state: A, event: &CommittedEvent) -> A {
    reducer::fold(state, event, A::apply)
}

pub(crate) fn reduce_process<P: ProcessManager>(state: P, event: &CommittedEvent) -> P {
    reducer::fold(state, event, P::apply)
}

fn stateless(_state: (), _event: &CommittedEvent) {}

/// Folded states waiting to be committed at `address`.
struct Pending<'a, S> {
    address: &'a Address,
    base: Snapshot<S>,
    /// State after each message, in order.
    states: Vec<S>,
    messages: Vec<Message>,
    metadata: CommittedEventMetadata,
    expected_version: Option<i64>,
    options: SnapshotOptions,
}

/// Commit `pending`, write snapshots per the artifact's policy and publish
/// the committed batch.
///
/// Returns one snapshot per message. A checkpoint, when the policy asks for
/// one, is appended to the same commit and pins the stream version the base
/// state was loaded at.
async fn commit_folded<S>(
    kernel: &Kernel,
    replay: &Replay<S>,
    pending: Pending<'_, S>,
) -> KernelResult<Dispatched>
where
    S: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let Pending {
        address,
        base,
        states,
        mut messages,
        metadata,
        mut expected_version,
        options,
    } = pending;

    let mut snapshots: Vec<Snapshot<S>> = states
        .into_iter()
        .zip(1u64..)
        .map(|(state, n)| Snapshot {
            artifact: base.artifact.clone(),
            state,
            event: None,
            apply_count: base.apply_count + n,
            state_count: base.state_count,
            event_count: base.event_count + n,
        })
        .collect();

    let write = match snapshots.last() {
        Some(last) if options.mode != SnapshotMode::Off => {
            options.should_write(&last.clone().into_value()?)
        }
        _ => false,
    };

    let stream = address.id();
    if write && options.mode == SnapshotMode::Checkpoint {
        if let Some(last) = snapshots.last() {
            if let Address::Stream(_) = address {
                // The checkpoint only holds for the base it was folded from.
                match expected_version {
                    Some(expected) if expected != base.version() => {
                        tracing::warn!(
                            artifact = replay.artifact,
                            stream,
                            expected,
                            last_version = base.version(),
                            "commit rejected: stale expected version"
                        );
                        return Err(StoreError::Concurrency {
                            stream: stream.to_owned(),
                            last_version: base.version(),
                            expected_version: expected,
                            events: messages,
                        }
                        .into());
                    }
                    _ => expected_version = Some(base.version()),
                }
            }
            let checkpoint = Checkpoint {
                state: last.state.clone(),
                event_count: last.event_count,
            };
            messages.push(Message::new(
                STATE_CHECKPOINT,
                serde_json::to_value(&checkpoint)?,
            ));
        }
    }

    let committed = match kernel
        .store()
        .commit(stream, messages, metadata, expected_version)
        .await
    {
        Ok(committed) => committed,
        Err(e) => {
            tracing::warn!(artifact = replay.artifact, stream, error = %e, "commit rejected");
            return Err(e.into());
        }
    };
    tracing::debug!(
        artifact = replay.artifact,
        stream,
        count = committed.len(),
        "committed events"
    );

    for (snapshot, event) in snapshots.iter_mut().zip(&committed) {
        snapshot.event = Some(event.clone());
    }

    if write && options.mode == SnapshotMode::Store {
        let contiguous = match address {
            Address::Stream(_) => committed
                .first()
                .is_some_and(|e| e.version == base.version() + 1),
            Address::Actor(_) => true,
        };
        match snapshots.last() {
            Some(last) if contiguous => replay.persist(stream, last).await,
            _ => tracing::debug!(stream, "skipping snapshot of a stale base"),
        }
    }

    kernel.notify(&committed);

    let snapshots = snapshots
        .into_iter()
        .map(Snapshot::into_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Dispatched {
        snapshots,
        committed,
    })
}

pub(crate) struct AggregateHandler<A> {
    options: SnapshotOptions,
    _marker: PhantomData<fn() -> A>,
}

impl<A: Aggregate> AggregateHandler<A> {
    pub(crate) fn new(options: SnapshotOptions) -> Self {
        Self {
            options,
            _marker: PhantomData,
        }
    }

    fn replay(&self, kernel: &Kernel) -> Replay<A> {
        kernel.replay(A::NAME, self.options.mode, reduce_aggregate::<A>)
    }

    async fn handle(
        &self,
        kernel: &Kernel,
        command: Command,
        cause: Option<&CommittedEvent>,
    ) -> KernelResult<Dispatched> {
        let Some(stream) = command.stream.clone() else {
            return Err(KernelError::validation(
                command.name.as_str(),
                format!("{} commands require a stream", A::NAME),
            ));
        };
        let typed: A::Command = decode_command(&command)?;

        let replay = self.replay(kernel);
        let address = Address::Stream(stream);
        let base = replay.load(&address, LoadOptions::default()).await?;

        let actor = command.actor.as_ref();
        for invariant in A::given(&typed) {
            if !(invariant.holds)(&base.state, actor) {
                return Err(KernelError::Invariant {
                    command: command.name.clone(),
                    data: command.data.clone(),
                    description: invariant.description.to_owned(),
                });
            }
        }

        let events = base
            .state
            .handle(typed, actor)
            .map_err(|e| KernelError::handler(A::NAME, &command.name, e))?;
        if events.is_empty() {
            return Ok(Dispatched {
                snapshots: vec![base.into_value()?],
                committed: Vec::new(),
            });
        }

        let mut state = base.state.clone();
        let mut states = Vec::with_capacity(events.len());
        let mut messages = Vec::with_capacity(events.len());
        for event in &events {
            messages.push(Message::encode(event)?);
            state = state.apply(event);
            states.push(state.clone());
        }

        let pending = Pending {
            address: &address,
            base,
            states,
            messages,
            metadata: CommittedEventMetadata::for_command(&command, cause),
            expected_version: command.expected_version,
            options: self.options,
        };
        commit_folded(kernel, &replay, pending).await
    }
}

impl<A: Aggregate> Handler for AggregateHandler<A> {
    fn name(&self) -> &'static str {
        A::NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        <A::Command as Messages>::NAMES
    }

    fn events(&self) -> &'static [&'static str] {
        <A::Event as Messages>::NAMES
    }

    fn snapshot_options(&self) -> SnapshotOptions {
        self.options
    }

    fn command<'a>(
        &'a self,
        kernel: &'a Kernel,
        command: Command,
        cause: Option<&'a CommittedEvent>,
    ) -> BoxFuture<'a, KernelResult<Dispatched>> {
        Box::pin(self.handle(kernel, command, cause))
    }

    fn load<'a>(
        &'a self,
        kernel: &'a Kernel,
        id: &'a str,
        options: LoadOptions,
    ) -> BoxFuture<'a, KernelResult<Snapshot<Value>>> {
        Box::pin(async move {
            let snapshot = self
                .replay(kernel)
                .load(&Address::Stream(id.to_owned()), options)
                .await?;
            Ok(snapshot.into_value()?)
        })
    }
}

pub(crate) struct SystemHandler<S> {
    system: S,
}

impl<S: System> SystemHandler<S> {
    pub(crate) fn new(system: S) -> Self {
        Self { system }
    }

    async fn handle(
        &self,
        kernel: &Kernel,
        command: Command,
        cause: Option<&CommittedEvent>,
    ) -> KernelResult<Dispatched> {
        let typed: S::Command = decode_command(&command)?;
        let events = self
            .system
            .handle(typed, command.actor.as_ref())
            .await
            .map_err(|e| KernelError::handler(S::NAME, &command.name, e))?;
        if events.is_empty() {
            return Ok(Dispatched::default());
        }

        let messages = events
            .iter()
            .map(Message::encode)
            .collect::<Result<Vec<_>, _>>()?;
        let stream = command.stream.clone().unwrap_or_else(|| S::NAME.to_owned());
        let address = Address::Stream(stream);
        let pending = Pending {
            address: &address,
            base: Snapshot::new(S::NAME, ()),
            states: vec![(); messages.len()],
            messages,
            metadata: CommittedEventMetadata::for_command(&command, cause),
            expected_version: command.expected_version,
            options: SnapshotOptions::default(),
        };
        let replay = kernel.replay(S::NAME, SnapshotMode::Off, stateless);
        commit_folded(kernel, &replay, pending).await
    }
}

impl<S: System> Handler for SystemHandler<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        <S::Command as Messages>::NAMES
    }

    fn events(&self) -> &'static [&'static str] {
        <S::Event as Messages>::NAMES
    }

    fn command<'a>(
        &'a self,
        kernel: &'a Kernel,
        command: Command,
        cause: Option<&'a CommittedEvent>,
    ) -> BoxFuture<'a, KernelResult<Dispatched>> {
        Box::pin(self.handle(kernel, command, cause))
    }
}

pub(crate) struct PolicyHandler<P> {
    policy: P,
}

impl<P: Policy> PolicyHandler<P> {
    pub(crate) fn new(policy: P) -> Self {
        Self { policy }
    }

    async fn handle(
        &self,
        kernel: &Kernel,
        event: &CommittedEvent,
    ) -> KernelResult<Option<Snapshot<Value>>> {
        let typed: P::Event = decode_event(event)?;
        let command = self
            .policy
            .on(&typed, event)
            .map_err(|e| KernelError::handler(P::NAME, &event.name, e))?;
        let Some(command) = command else {
            return Ok(None);
        };
        let dispatched = kernel.dispatch(command, Some(event)).await?;
        Ok(dispatched.snapshots.into_iter().last())
    }
}

impl<P: Policy> Handler for PolicyHandler<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn events(&self) -> &'static [&'static str] {
        <P::Event as Messages>::NAMES
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        <P::Event as Messages>::NAMES
    }

    fn event<'a>(
        &'a self,
        kernel: &'a Kernel,
        event: &'a CommittedEvent,
    ) -> BoxFuture<'a, KernelResult<Option<Snapshot<Value>>>> {
        Box::pin(self.handle(kernel, event))
    }
}

pub(crate) struct ProcessManagerHandler<P> {
    options: SnapshotOptions,
    _marker: PhantomData<fn() -> P>,
}

impl<P: ProcessManager> ProcessManagerHandler<P> {
    pub(crate) fn new(options: SnapshotOptions) -> Self {
        Self {
            options,
            _marker: PhantomData,
        }
    }

    fn replay(&self, kernel: &Kernel) -> Replay<P> {
        kernel.replay(P::NAME, self.options.mode, reduce_process::<P>)
    }

    /// The actor a manager issues commands under, carrying the causal count
    /// the store must still see when the command commits.
    fn actor(key: &str, snapshot: &Snapshot<P>) -> Actor {
        Actor::new(key, P::NAME).with_expected_count(snapshot.event_count)
    }

    async fn handle(
        &self,
        kernel: &Kernel,
        event: &CommittedEvent,
    ) -> KernelResult<Option<Snapshot<Value>>> {
        let typed: P::Event = decode_event(event)?;
        let key = P::actor(&typed, event);
        let address = Address::Actor(key.clone());
        let replay = self.replay(kernel);
        let mut snapshot = replay.load(&address, LoadOptions::default()).await?;

        let command = snapshot
            .state
            .on(&typed, event)
            .map_err(|e| KernelError::handler(P::NAME, &event.name, e))?;
        if let Some(mut command) = command {
            command.actor = Some(Self::actor(&key, &snapshot));
            let dispatched = kernel.dispatch(command, Some(event)).await?;
            let use_checkpoints = self.options.mode == SnapshotMode::Checkpoint;
            for committed in &dispatched.committed {
                reducer::fold_into(
                    &mut snapshot,
                    committed,
                    &key,
                    reduce_process::<P>,
                    use_checkpoints,
                );
            }
        }

        let metadata = CommittedEventMetadata {
            correlation: event.metadata.correlation.clone(),
            causation: Causation {
                command: Some(CommandCausation {
                    name: event.name.clone(),
                    stream: Some(key.clone()),
                    expected_version: None,
                    actor: Some(Self::actor(&key, &snapshot)),
                }),
                event: Some(EventCausation::from(event)),
            },
        };
        let state = snapshot.state.clone().apply(&typed);
        let pending = Pending {
            address: &address,
            base: snapshot,
            states: vec![state],
            messages: vec![event.message()],
            metadata,
            expected_version: None,
            options: self.options,
        };
        let dispatched = commit_folded(kernel, &replay, pending).await?;
        Ok(dispatched.snapshots.into_iter().next())
    }
}

impl<P: ProcessManager> Handler for ProcessManagerHandler<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn events(&self) -> &'static [&'static str] {
        <P::Event as Messages>::NAMES
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        P::subscriptions()
    }

    fn keeps_actor_stream(&self) -> bool {
        true
    }

    fn snapshot_options(&self) -> SnapshotOptions {
        self.options
    }

    fn event<'a>(
        &'a self,
        kernel: &'a Kernel,
        event: &'a CommittedEvent,
    ) -> BoxFuture<'a, KernelResult<Option<Snapshot<Value>>>> {
        Box::pin(self.handle(kernel, event))
    }

    fn load<'a>(
        &'a self,
        kernel: &'a Kernel,
        id: &'a str,
        options: LoadOptions,
    ) -> BoxFuture<'a, KernelResult<Snapshot<Value>>> {
        Box::pin(async move {
            let snapshot = self
                .replay(kernel)
                .load(&Address::Actor(id.to_owned()), options)
                .await?;
            Ok(snapshot.into_value()?)
        })
    }
}
