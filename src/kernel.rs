//! The kernel context and its builder.

use std::any::TypeId;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::artifact::{Aggregate, Policy, ProcessManager, System};
use crate::error::{KernelError, KernelResult};
use crate::memory::InMemoryStore;
use crate::message::{Command, CommittedEvent};
use crate::pipeline::{
    AggregateHandler, PolicyHandler, ProcessManagerHandler, SystemHandler, reduce_aggregate,
    reduce_process,
};
use crate::projection::{self, Projection, ProjectionHandler};
use crate::reducer::{Address, LoadOptions, ReduceFn, Replay};
use crate::registry::{BoxFuture, Consumer, Handler, Registry};
use crate::snapshot::{
    InMemorySnapshotStore, Snapshot, SnapshotMode, SnapshotOptions, SnapshotStore,
};
use crate::store::{Query, Store};

/// Default capacity of the commit notification channel.
const DEFAULT_NOTIFY_CAPACITY: usize = 1024;

/// Outcome of one command: a snapshot per committed business event and the
/// raw committed batch, checkpoints included.
#[derive(Debug, Default)]
pub(crate) struct Dispatched {
    pub(crate) snapshots: Vec<Snapshot<Value>>,
    pub(crate) committed: Vec<CommittedEvent>,
}

/// Entry point for commands, event delivery and state loads.
///
/// Holds the store, the snapshot store, the registered artifacts and the
/// commit notifier. `Clone` is cheap -- all internal state is `Arc`-wrapped.
///
/// Every error reaches the caller unmodified; nothing is retried here.
#[derive(Clone)]
pub struct Kernel {
    store: Arc<dyn Store>,
    snapshots: Arc<dyn SnapshotStore>,
    registry: Arc<Registry>,
    notifier: broadcast::Sender<Vec<CommittedEvent>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("store", &self.store.name())
            .field("consumers", &self.registry.consumers())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Start configuring a kernel. See [`KernelBuilder`].
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    /// Handle `command` with the artifact registered for its name.
    ///
    /// # Returns
    ///
    /// One snapshot per committed event, or the loaded snapshot when the
    /// command was a no-op. Streamless system commands return no snapshot
    /// when they commit nothing.
    ///
    /// # Errors
    ///
    /// [`KernelError::Registration`] for unknown names,
    /// [`KernelError::Validation`] for bad payloads,
    /// [`KernelError::Invariant`], [`KernelError::Handler`], or the
    /// store's concurrency errors.
    pub async fn command(&self, command: Command) -> KernelResult<Vec<Snapshot<Value>>> {
        let dispatched = self.dispatch(command, None).await?;
        Ok(dispatched.snapshots)
    }

    /// Route `command`, continuing the flow of `cause` if present.
    pub(crate) fn dispatch<'a>(
        &'a self,
        command: Command,
        cause: Option<&'a CommittedEvent>,
    ) -> BoxFuture<'a, KernelResult<Dispatched>> {
        let span = tracing::info_span!(
            "command",
            name = %command.name,
            stream = command.stream.as_deref().unwrap_or_default()
        );
        Box::pin(
            async move {
                let handler = self.registry.command(&command.name)?;
                handler.command(self, command, cause).await
            }
            .instrument(span),
        )
    }

    /// Deliver `event` to the consumer named `consumer`.
    ///
    /// Policies and process managers return the snapshot their cascaded
    /// command or own record produced; projections return `None`. A process
    /// manager's own records are acknowledged without delivery.
    ///
    /// # Errors
    ///
    /// [`KernelError::Registration`] if the consumer is unknown or does not
    /// subscribe to `event.name`; otherwise whatever the handler or its
    /// cascade fails with.
    pub async fn event(
        &self,
        consumer: &str,
        event: &CommittedEvent,
    ) -> KernelResult<Option<Snapshot<Value>>> {
        let handler = self.registry.artifact(consumer)?;
        if !handler.subscriptions().contains(&event.name.as_str()) {
            return Err(KernelError::registration(
                event.name.as_str(),
                format!("{consumer} does not subscribe to it"),
            ));
        }
        if self.registry.is_process_record(event) {
            tracing::trace!(consumer, id = event.id, "skipping process manager record");
            return Ok(None);
        }
        let span = tracing::info_span!("event", consumer, name = %event.name, id = event.id);
        handler.event(self, event).instrument(span).await
    }

    /// Load the state of `artifact` at `id`: a stream for aggregates, an
    /// actor key for process managers.
    pub async fn load(
        &self,
        artifact: &str,
        id: &str,
        options: LoadOptions,
    ) -> KernelResult<Snapshot<Value>> {
        self.registry.artifact(artifact)?.load(self, id, options).await
    }

    /// Typed [`load`](Kernel::load) for a registered aggregate.
    pub async fn load_aggregate<A: Aggregate>(
        &self,
        stream: &str,
        options: LoadOptions,
    ) -> KernelResult<Snapshot<A>> {
        let mode = self.registry.artifact(A::NAME)?.snapshot_options().mode;
        self.replay(A::NAME, mode, reduce_aggregate::<A>)
            .load(&Address::Stream(stream.to_owned()), options)
            .await
    }

    /// Typed [`load`](Kernel::load) for a registered process manager.
    pub async fn load_process<P: ProcessManager>(
        &self,
        key: &str,
        options: LoadOptions,
    ) -> KernelResult<Snapshot<P>> {
        let mode = self.registry.artifact(P::NAME)?.snapshot_options().mode;
        self.replay(P::NAME, mode, reduce_process::<P>)
            .load(&Address::Actor(key.to_owned()), options)
            .await
    }

    /// Read committed events matching `query`.
    pub async fn query(&self, query: &Query) -> KernelResult<Vec<CommittedEvent>> {
        Ok(self.store.read(query).await?)
    }

    /// A copy of the current state of projection `P`.
    ///
    /// # Errors
    ///
    /// [`KernelError::Registration`] if `P` was not registered.
    pub async fn projection<P: Projection>(&self) -> KernelResult<P> {
        let state = self
            .registry
            .projection(TypeId::of::<P>())
            .and_then(projection::downcast::<P>)
            .ok_or_else(|| KernelError::registration(P::NAME, "unknown projection"))?;
        let state = state.lock().await;
        Ok(state.clone())
    }

    /// Receive every committed batch, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<CommittedEvent>> {
        self.notifier.subscribe()
    }

    /// Artifacts with subscriptions, in registration order.
    pub fn consumers(&self) -> &[Consumer] {
        self.registry.consumers()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn replay<S>(
        &self,
        artifact: &'static str,
        mode: SnapshotMode,
        reduce: ReduceFn<S>,
    ) -> Replay<S>
    where
        S: Default + Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        Replay::new(
            Arc::clone(&self.store),
            Arc::clone(&self.snapshots),
            artifact,
            mode,
            reduce,
        )
    }

    pub(crate) fn notify(&self, committed: &[CommittedEvent]) {
        if committed.is_empty() {
            return;
        }
        // No receivers is not an error.
        let _ = self.notifier.send(committed.to_vec());
    }
}

/// Builder for configuring and constructing a [`Kernel`].
///
/// # Examples
///
/// ```no_run
/// use eventfold_kernel::{Kernel, SnapshotOptions};
/// # use eventfold_kernel::{Actor, Aggregate, Messages};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// # struct Counter { value: u64 }
/// # #[derive(Debug, Clone, Serialize, Deserialize)]
/// # #[serde(tag = "name", content = "data")]
/// # enum CounterCommand { Increment }
/// # impl Messages for CounterCommand { const NAMES: &'static [&'static str] = &["Increment"]; }
/// # #[derive(Debug, Clone, Serialize, Deserialize)]
/// # #[serde(tag = "name", content = "data")]
/// # enum CounterEvent { Incremented }
/// # impl Messages for CounterEvent { const NAMES: &'static [&'static str] = &["Incremented"]; }
/// # impl Aggregate for Counter {
/// #     const NAME: &'static str = "Counter";
/// #     type Command = CounterCommand;
/// #     type Event = CounterEvent;
/// #     type Error = std::convert::Infallible;
/// #     fn handle(&self, _: CounterCommand, _: Option<&Actor>) -> Result<Vec<CounterEvent>, Self::Error> {
/// #         Ok(vec![CounterEvent::Incremented])
/// #     }
/// #     fn apply(mut self, _: &CounterEvent) -> Self { self.value += 1; self }
/// # }
/// let kernel = Kernel::builder()
///     .aggregate_with::<Counter>(SnapshotOptions::store(10))
///     .build()
///     .expect("valid registrations");
/// ```
pub struct KernelBuilder {
    store: Option<Arc<dyn Store>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    handlers: Vec<Arc<dyn Handler>>,
    notify_capacity: usize,
}

impl KernelBuilder {
    /// Create a builder over in-memory stores with nothing registered.
    pub fn new() -> Self {
        Self {
            store: None,
            snapshots: None,
            handlers: Vec::new(),
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }

    /// Use `store` as the event log. Defaults to a fresh [`InMemoryStore`].
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `snapshots` as the snapshot cache. Defaults to a fresh
    /// [`InMemorySnapshotStore`].
    pub fn snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Register aggregate `A` without snapshots.
    pub fn aggregate<A: Aggregate>(self) -> Self {
        self.aggregate_with::<A>(SnapshotOptions::default())
    }

    /// Register aggregate `A` with a snapshot policy.
    ///
    /// # Arguments
    ///
    /// * `options` - When to cache state: [`SnapshotOptions::store`] writes to
    ///   the snapshot store, [`SnapshotOptions::checkpoint`] appends state to
    ///   the stream itself.
    pub fn aggregate_with<A: Aggregate>(mut self, options: SnapshotOptions) -> Self {
        self.handlers.push(Arc::new(AggregateHandler::<A>::new(options)));
        self
    }

    /// Register process manager `P` without snapshots.
    pub fn process_manager<P: ProcessManager>(self) -> Self {
        self.process_manager_with::<P>(SnapshotOptions::default())
    }

    /// Register process manager `P` with a snapshot policy, keyed by the
    /// actor each event derives.
    pub fn process_manager_with<P: ProcessManager>(mut self, options: SnapshotOptions) -> Self {
        self.handlers
            .push(Arc::new(ProcessManagerHandler::<P>::new(options)));
        self
    }

    /// Register a stateless policy. It reacts to every event in its event
    /// set with at most one command.
    pub fn policy<P: Policy>(mut self, policy: P) -> Self {
        self.handlers.push(Arc::new(PolicyHandler::new(policy)));
        self
    }

    /// Register a system. Its commits land on the command's stream, or on
    /// a stream named after the system when the command has none.
    pub fn system<S: System>(mut self, system: S) -> Self {
        self.handlers.push(Arc::new(SystemHandler::new(system)));
        self
    }

    /// Register projection `P`, starting from `P::default()`.
    ///
    /// Read its state back with [`Kernel::projection`].
    pub fn projection<P: Projection>(mut self) -> Self {
        self.handlers.push(Arc::new(ProjectionHandler::<P>::new()));
        self
    }

    /// Buffered batches per notification receiver before it lags.
    ///
    /// Defaults to 1024.
    pub fn notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity;
        self
    }

    /// Validate the registrations and build the [`Kernel`].
    ///
    /// # Errors
    ///
    /// [`KernelError::Registration`] for a duplicate artifact or command
    /// name, or a subscription outside the artifact's event set.
    pub fn build(self) -> KernelResult<Kernel> {
        let mut registry = Registry::default();
        for handler in self.handlers {
            registry.register(handler)?;
        }
        let (notifier, _) = broadcast::channel(self.notify_capacity.max(1));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn Store>);
        let snapshots = self
            .snapshots
            .unwrap_or_else(|| Arc::new(InMemorySnapshotStore::new()) as Arc<dyn SnapshotStore>);
        tracing::info!(
            store = store.name(),
            consumers = registry.consumers().len(),
            "kernel built"
        );
        Ok(Kernel {
            store,
            snapshots,
            registry: Arc::new(registry),
            notifier,
        })
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
