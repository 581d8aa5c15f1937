//! Event-sourcing kernel: an append-only store contract, reducible
//! artifacts (aggregates, systems, policies, process managers, projections)
//! and lease-based background dispatch.

mod artifact;
mod dispatcher;
mod error;
mod kernel;
mod memory;
mod message;
mod pipeline;
mod projection;
mod reducer;
mod registry;
mod scheduler;
mod snapshot;
mod store;

pub use artifact::{Aggregate, Invariant, Policy, ProcessManager, System};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{KernelError, KernelResult, StoreError, StoreResult};
pub use kernel::{Kernel, KernelBuilder};
pub use memory::InMemoryStore;
pub use message::{
    Actor, Causation, Command, CommandCausation, CommittedEvent, CommittedEventMetadata,
    EventCausation, Message, Messages, STATE_CHECKPOINT,
};
pub use projection::Projection;
pub use reducer::{Address, Checkpoint, LoadOptions, ReduceFn, Replay, fold};
pub use registry::Consumer;
pub use scheduler::{Action, Scheduler, SchedulerConfig, SchedulerStatus, Task};
pub use snapshot::{
    FileSnapshotStore, InMemorySnapshotStore, Snapshot, SnapshotMode, SnapshotOptions,
    SnapshotPredicate, SnapshotStore, snapshot_path,
};
pub use store::{Lease, Query, Store, StoreStat, Subscription, is_deliverable};
