//! Messages, commands, actors, and committed events.
//!
//! Everything that crosses the store boundary is untyped JSON (`name` +
//! `data`). Artifacts work with typed message sets instead: enums using
//! adjacently tagged serde (`#[serde(tag = "name", content = "data")]`),
//! so a typed variant serializes to exactly the [`Message`] wire shape.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved event name for in-stream state checkpoints.
///
/// A checkpoint carries the full serialized state of the artifact that
/// wrote it. Replay replaces state wholesale when it meets one instead of
/// reducing it. Dispatch never delivers it to consumers.
pub const STATE_CHECKPOINT: &str = "__StateCheckpoint__";

/// A typed, closed set of messages an artifact accepts or produces.
///
/// Implemented by enums with `#[serde(tag = "name", content = "data")]`.
/// `NAMES` must list every variant tag; it is the registration-time lookup
/// table that separates an unknown message (registration error) from a
/// known one with a bad payload (validation error).
///
/// # Examples
///
/// ```
/// use eventfold_kernel::Messages;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(tag = "name", content = "data")]
/// enum CounterEvent {
///     Incremented,
///     Added { amount: u64 },
/// }
///
/// impl Messages for CounterEvent {
///     const NAMES: &'static [&'static str] = &["Incremented", "Added"];
/// }
/// ```
pub trait Messages: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Every message name in the set.
    const NAMES: &'static [&'static str];

    /// Returns `true` if `name` belongs to this set.
    fn accepts(name: &str) -> bool {
        Self::NAMES.contains(&name)
    }
}

/// An uncommitted instruction or fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message name, the serde tag of the typed variant.
    pub name: String,
    /// JSON payload; `null` for fieldless messages.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Message {
    /// Build a message from a name and a JSON payload.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Encode a typed message into its untyped form.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `message` does not serialize to a
    /// `{"name": .., "data": ..}` object.
    pub fn encode<M: Serialize>(message: &M) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::to_value(message)?)
    }

    /// Decode into a typed message set.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` for unknown names or payloads that do not
    /// match the variant's shape.
    pub fn decode<M: DeserializeOwned>(&self) -> serde_json::Result<M> {
        decode_tagged(&self.name, &self.data)
    }
}

/// Rebuild the adjacently tagged JSON object and deserialize it.
fn decode_tagged<M: DeserializeOwned>(name: &str, data: &Value) -> serde_json::Result<M> {
    let tagged = if data.is_null() {
        serde_json::json!({ "name": name })
    } else {
        serde_json::json!({ "name": name, "data": data })
    };
    serde_json::from_value(tagged)
}

/// The identity a command is issued on behalf of.
///
/// For process managers `id` is the derived actor key (e.g. a booking
/// month) and `expected_count` is the optimistic token the store checks
/// against the number of events already committed under that key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Identity or derived actor key.
    pub id: String,
    /// Display name, or the issuing artifact's name.
    pub name: String,
    /// Roles, for invariants that check authorization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Expected number of events already committed under `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<u64>,
}

impl Actor {
    /// Create an actor with no roles and no count token.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            roles: Vec::new(),
            expected_count: None,
        }
    }

    /// Attach roles.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Attach the actor-concurrency token.
    pub fn with_expected_count(mut self, count: u64) -> Self {
        self.expected_count = Some(count);
        self
    }

    /// Returns `true` if the actor carries `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// A message addressed to a command handler.
///
/// # Examples
///
/// ```
/// use eventfold_kernel::{Actor, Command};
///
/// let cmd = Command::new("Increment", serde_json::Value::Null)
///     .with_stream("counter-1")
///     .with_expected_version(-1)
///     .with_actor(Actor::new("user-1", "Alice"));
/// assert_eq!(cmd.stream.as_deref(), Some("counter-1"));
/// assert_eq!(cmd.expected_version, Some(-1));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name.
    pub name: String,
    /// JSON payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Target aggregate stream; `None` for external-system commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// Expected current version of `stream`; `-1` requires an empty stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
    /// Issuing actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
}

impl Command {
    /// Build an untargeted command.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            stream: None,
            expected_version: None,
            actor: None,
        }
    }

    /// Build a command from a typed message set variant.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the variant does not serialize to the
    /// message shape.
    pub fn encode<M: Serialize>(message: &M) -> serde_json::Result<Self> {
        let Message { name, data } = Message::encode(message)?;
        Ok(Self::new(name, data))
    }

    /// Set the target stream.
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Set the expected stream version.
    pub fn with_expected_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Set the issuing actor.
    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Decode the payload into a typed message set.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` for unknown names or mismatched payloads.
    pub fn decode<M: DeserializeOwned>(&self) -> serde_json::Result<M> {
        decode_tagged(&self.name, &self.data)
    }
}

/// The command that caused an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandCausation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
}

impl From<&Command> for CommandCausation {
    fn from(command: &Command) -> Self {
        Self {
            name: command.name.clone(),
            stream: command.stream.clone(),
            expected_version: command.expected_version,
            actor: command.actor.clone(),
        }
    }
}

/// The committed event that caused an event, through a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCausation {
    pub name: String,
    pub stream: String,
    pub id: u64,
}

impl From<&CommittedEvent> for EventCausation {
    fn from(event: &CommittedEvent) -> Self {
        Self {
            name: event.name.clone(),
            stream: event.stream.clone(),
            id: event.id,
        }
    }
}

/// Immediate parent of a committed event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Causation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandCausation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventCausation>,
}

/// Correlation and causation stamped on every committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEventMetadata {
    /// Identifier shared by every command and event of one flow.
    pub correlation: String,
    /// The command or event that directly caused this one.
    #[serde(default)]
    pub causation: Causation,
}

impl CommittedEventMetadata {
    /// Metadata for a command, continuing the flow of `cause` if present.
    ///
    /// Without a cause a fresh UUID v4 correlation id starts a new flow.
    pub fn for_command(command: &Command, cause: Option<&CommittedEvent>) -> Self {
        Self {
            correlation: correlation_of(cause),
            causation: Causation {
                command: Some(CommandCausation::from(command)),
                event: cause.map(EventCausation::from),
            },
        }
    }

    /// The actor id of the causing command, if any.
    pub fn actor_id(&self) -> Option<&str> {
        self.causation
            .command
            .as_ref()
            .and_then(|c| c.actor.as_ref())
            .map(|a| a.id.as_str())
    }

    /// The causing command's actor, if any.
    pub fn actor(&self) -> Option<&Actor> {
        self.causation
            .command
            .as_ref()
            .and_then(|c| c.actor.as_ref())
    }
}

/// Correlation id inherited from `cause`, or a new one.
pub(crate) fn correlation_of(cause: Option<&CommittedEvent>) -> String {
    cause
        .map(|e| e.metadata.correlation.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// An event as recorded in the log. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    /// Global position, unique and strictly increasing across all streams.
    pub id: u64,
    /// Owning stream.
    pub stream: String,
    /// Per-stream position, 0-based and contiguous.
    pub version: i64,
    /// Commit timestamp.
    pub created: DateTime<Utc>,
    /// Event name.
    pub name: String,
    /// JSON payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Correlation and causation.
    pub metadata: CommittedEventMetadata,
}

impl CommittedEvent {
    /// The untyped message this event was committed from.
    pub fn message(&self) -> Message {
        Message::new(self.name.clone(), self.data.clone())
    }

    /// Decode the payload into a typed message set.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` for unknown names or mismatched payloads.
    pub fn decode<M: DeserializeOwned>(&self) -> serde_json::Result<M> {
        decode_tagged(&self.name, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "name", content = "data")]
    enum Sample {
        Ping,
        Moved { x: i32 },
    }

    impl Messages for Sample {
        const NAMES: &'static [&'static str] = &["Ping", "Moved"];
    }

    #[test]
    fn encode_fieldless_variant_omits_data() {
        let message = Message::encode(&Sample::Ping).expect("encode");
        assert_eq!(message, Message::new("Ping", Value::Null));
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json, serde_json::json!({ "name": "Ping" }));
    }

    #[test]
    fn decode_rebuilds_the_tagged_variant() {
        let message = Message::new("Moved", serde_json::json!({ "x": 7 }));
        assert_eq!(message.decode::<Sample>().expect("decode"), Sample::Moved { x: 7 });
    }

    #[test]
    fn decode_rejects_mismatched_payload() {
        let message = Message::new("Moved", serde_json::json!({ "x": "seven" }));
        assert!(message.decode::<Sample>().is_err());
    }

    #[test]
    fn accepts_uses_the_name_table() {
        assert!(Sample::accepts("Moved"));
        assert!(!Sample::accepts("Jumped"));
        assert!(!Sample::accepts(STATE_CHECKPOINT));
    }

    #[test]
    fn command_encode_keeps_payload() {
        let cmd = Command::encode(&Sample::Moved { x: 1 })
            .expect("encode")
            .with_stream("s-1");
        assert_eq!(cmd.name, "Moved");
        assert_eq!(cmd.data, serde_json::json!({ "x": 1 }));
        assert_eq!(cmd.decode::<Sample>().expect("decode"), Sample::Moved { x: 1 });
    }

    #[test]
    fn metadata_inherits_correlation_from_cause() {
        let cause = CommittedEvent {
            id: 9,
            stream: "s-1".into(),
            version: 0,
            created: Utc::now(),
            name: "Ping".into(),
            data: Value::Null,
            metadata: CommittedEventMetadata {
                correlation: "flow-1".into(),
                causation: Causation::default(),
            },
        };
        let cmd = Command::new("Moved", serde_json::json!({ "x": 1 }))
            .with_actor(Actor::new("2024-03", "Booking").with_expected_count(2));

        let meta = CommittedEventMetadata::for_command(&cmd, Some(&cause));
        assert_eq!(meta.correlation, "flow-1");
        assert_eq!(meta.actor_id(), Some("2024-03"));
        assert_eq!(
            meta.causation.event,
            Some(EventCausation {
                name: "Ping".into(),
                stream: "s-1".into(),
                id: 9
            })
        );
    }

    #[test]
    fn metadata_without_cause_starts_new_flow() {
        let cmd = Command::new("Ping", Value::Null);
        let a = CommittedEventMetadata::for_command(&cmd, None);
        let b = CommittedEventMetadata::for_command(&cmd, None);
        assert_ne!(a.correlation, b.correlation);
        assert!(a.causation.event.is_none());
        assert_eq!(a.actor_id(), None);
    }
}
