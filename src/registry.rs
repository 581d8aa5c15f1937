//! Registration-time name tables over type-erased artifact handlers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{KernelError, KernelResult};
use crate::kernel::{Dispatched, Kernel};
use crate::message::{Command, CommittedEvent};
use crate::reducer::LoadOptions;
use crate::snapshot::{Snapshot, SnapshotOptions};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered artifact with its types erased.
///
/// Every entry point defaults to a registration error, so each artifact
/// kind only overrides what it supports.
pub(crate) trait Handler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Command names routed to this artifact.
    fn commands(&self) -> &'static [&'static str] {
        &[]
    }

    /// Every event name this artifact can decode.
    fn events(&self) -> &'static [&'static str] {
        &[]
    }

    /// Event names delivered by the dispatcher. Must be a subset of
    /// [`events`](Handler::events).
    fn subscriptions(&self) -> &'static [&'static str] {
        &[]
    }

    /// `true` for process managers, whose own-stream records are
    /// bookkeeping and never delivered.
    fn keeps_actor_stream(&self) -> bool {
        false
    }

    fn snapshot_options(&self) -> SnapshotOptions {
        SnapshotOptions::default()
    }

    /// Type id and shared state of a projection.
    fn projection(&self) -> Option<(TypeId, Arc<dyn Any + Send + Sync>)> {
        None
    }

    fn command<'a>(
        &'a self,
        _kernel: &'a Kernel,
        command: Command,
        _cause: Option<&'a CommittedEvent>,
    ) -> BoxFuture<'a, KernelResult<Dispatched>> {
        let name = self.name();
        Box::pin(async move {
            Err(KernelError::registration(
                command.name,
                format!("{name} does not handle commands"),
            ))
        })
    }

    fn event<'a>(
        &'a self,
        _kernel: &'a Kernel,
        event: &'a CommittedEvent,
    ) -> BoxFuture<'a, KernelResult<Option<Snapshot<Value>>>> {
        let name = self.name();
        Box::pin(async move {
            Err(KernelError::registration(
                event.name.as_str(),
                format!("{name} does not consume events"),
            ))
        })
    }

    fn load<'a>(
        &'a self,
        _kernel: &'a Kernel,
        _id: &'a str,
        _options: LoadOptions,
    ) -> BoxFuture<'a, KernelResult<Snapshot<Value>>> {
        let name = self.name();
        Box::pin(async move { Err(KernelError::registration(name, "artifact has no state")) })
    }
}

/// An artifact that receives events from the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    /// Artifact name; also the store subscription name.
    pub name: String,
    /// Subscribed event names.
    pub names: Vec<String>,
}

#[derive(Default)]
pub(crate) struct Registry {
    artifacts: HashMap<&'static str, Arc<dyn Handler>>,
    commands: HashMap<&'static str, Arc<dyn Handler>>,
    consumers: Vec<Consumer>,
    projections: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Registry {
    /// Add `handler`, rejecting duplicate names and stray subscriptions.
    pub(crate) fn register(&mut self, handler: Arc<dyn Handler>) -> KernelResult<()> {
        let name = handler.name();
        if self.artifacts.contains_key(name) {
            return Err(KernelError::registration(name, "artifact registered twice"));
        }
        for command in handler.commands() {
            if let Some(owner) = self.commands.get(command) {
                return Err(KernelError::registration(
                    *command,
                    format!("command already handled by {}", owner.name()),
                ));
            }
        }
        if let Some(stray) = handler
            .subscriptions()
            .iter()
            .find(|s| !handler.events().contains(*s))
        {
            return Err(KernelError::registration(
                *stray,
                format!("{name} subscribes to an event outside its event set"),
            ));
        }

        for command in handler.commands() {
            self.commands.insert(*command, Arc::clone(&handler));
        }
        if !handler.subscriptions().is_empty() {
            self.consumers.push(Consumer {
                name: name.to_owned(),
                names: handler.subscriptions().iter().map(|s| s.to_string()).collect(),
            });
        }
        if let Some((type_id, state)) = handler.projection() {
            self.projections.insert(type_id, state);
        }
        tracing::debug!(artifact = name, "registered artifact");
        self.artifacts.insert(name, handler);
        Ok(())
    }

    pub(crate) fn artifact(&self, name: &str) -> KernelResult<&Arc<dyn Handler>> {
        self.artifacts
            .get(name)
            .ok_or_else(|| KernelError::registration(name, "unknown artifact"))
    }

    pub(crate) fn command(&self, name: &str) -> KernelResult<&Arc<dyn Handler>> {
        self.commands
            .get(name)
            .ok_or_else(|| KernelError::registration(name, "no handler for command"))
    }

    pub(crate) fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    pub(crate) fn projection(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.projections.get(&type_id).cloned()
    }

    /// Returns `true` if `event` is a process manager's own record of a
    /// triggering event rather than a business fact.
    pub(crate) fn is_process_record(&self, event: &CommittedEvent) -> bool {
        let Some(actor) = event.metadata.actor() else {
            return false;
        };
        actor.id == event.stream
            && event.metadata.causation.event.is_some()
            && self
                .artifacts
                .get(actor.name.as_str())
                .is_some_and(|h| h.keeps_actor_stream())
    }
}
