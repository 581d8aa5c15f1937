//! Crate-level error types for the store contract and the message pipeline.

use crate::message::Message;

/// Convenience alias for store adapter results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Convenience alias for pipeline results.
pub type KernelResult<T> = Result<T, KernelError>;

/// Error returned by a [`Store`](crate::Store) or
/// [`SnapshotStore`](crate::SnapshotStore) adapter.
///
/// The two concurrency variants are synchronous and never leave a partial
/// write behind. They are not retryable as-is: the caller must reload state
/// and recompute the command.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream moved past the version the caller expected.
    ///
    /// `last_version` is `-1` for a stream with no events.
    #[error(
        "concurrency conflict on stream {stream}: expected version {expected_version}, \
         last version {last_version}"
    )]
    Concurrency {
        /// The stream the commit targeted.
        stream: String,
        /// Current max version of the stream at commit time.
        last_version: i64,
        /// The version the caller expected.
        expected_version: i64,
        /// The rejected, uncommitted events.
        events: Vec<Message>,
    },

    /// The actor's causal event count differs from the caller's token.
    ///
    /// Raised when a command carries `actor.expected_count` and the number
    /// of events previously committed under that actor id does not match.
    #[error(
        "actor concurrency conflict for {actor}: expected count {expected_count}, \
         actual count {count}"
    )]
    ActorConcurrency {
        /// The actor id whose events were counted.
        actor: String,
        /// Events committed under this actor so far.
        count: u64,
        /// The count the caller expected.
        expected_count: u64,
        /// The rejected, uncommitted events.
        events: Vec<Message>,
    },

    /// Underlying storage I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned from the pipeline entry points on
/// [`Kernel`](crate::Kernel).
///
/// Every variant reaches the direct caller of `command`/`event` unmodified.
/// Only the [`Dispatcher`](crate::Dispatcher) poll loop catches and logs
/// them.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Payload does not match the message shape registered for its name.
    #[error("invalid payload for {name}: {reason}")]
    Validation {
        /// Message name.
        name: String,
        /// Decoder or shape diagnostic.
        reason: String,
    },

    /// Unknown message, consumer, or artifact name, or a bad registration.
    #[error("{name} is not registered: {reason}")]
    Registration {
        /// The name that failed to resolve.
        name: String,
        /// What was being looked up.
        reason: String,
    },

    /// A `given` precondition of an aggregate rejected the command.
    ///
    /// The command handler was not invoked.
    #[error("{command} violates invariant: {description}")]
    Invariant {
        /// Command name.
        command: String,
        /// Command payload as received.
        data: serde_json::Value,
        /// Human-readable description of the failed invariant.
        description: String,
    },

    /// The store rejected or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The artifact's own handler returned a domain error.
    #[error("{artifact} rejected {message}: {source}")]
    Handler {
        /// Artifact name.
        artifact: String,
        /// Message name being handled.
        message: String,
        /// The domain error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// State or payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KernelError {
    /// Returns `true` for stream or actor concurrency conflicts.
    ///
    /// These are the conflicts a caller resolves by reloading and retrying.
    pub fn is_concurrency(&self) -> bool {
        matches!(
            self,
            KernelError::Store(StoreError::Concurrency { .. })
                | KernelError::Store(StoreError::ActorConcurrency { .. })
        )
    }

    pub(crate) fn handler<E>(artifact: &str, message: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        KernelError::Handler {
            artifact: artifact.to_owned(),
            message: message.to_owned(),
            source: Box::new(source),
        }
    }

    pub(crate) fn registration(name: impl Into<String>, reason: impl Into<String>) -> Self {
        KernelError::Registration {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(name: impl Into<String>, reason: impl ToString) -> Self {
        KernelError::Validation {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
