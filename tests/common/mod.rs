//! Domains and store decorators shared by the integration tests.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use eventfold_kernel::{
    Actor, Aggregate, Command, CommittedEvent, CommittedEventMetadata, InMemoryStore, Invariant,
    Lease, Message, Messages, ProcessManager, Query, Store, StoreResult, StoreStat, Subscription,
};
use serde::{Deserialize, Serialize};

/// Install a test subscriber once, honouring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

/// A pocket calculator driven one key at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calculator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum CalculatorCommand {
    PressKey { key: String },
    Reset,
}

impl Messages for CalculatorCommand {
    const NAMES: &'static [&'static str] = &["PressKey", "Reset"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum CalculatorEvent {
    DigitPressed { digit: String },
    DotPressed,
    OperatorPressed { operator: String },
    EqualsPressed,
    Cleared,
}

impl Messages for CalculatorEvent {
    const NAMES: &'static [&'static str] = &[
        "DigitPressed",
        "DotPressed",
        "OperatorPressed",
        "EqualsPressed",
        "Cleared",
    ];
}

#[derive(Debug, thiserror::Error)]
pub enum CalculatorError {
    #[error("unknown key: {0}")]
    UnknownKey(String),
}

const OPERATORS: &[&str] = &["+", "-", "*", "/"];

impl Calculator {
    fn operand(&mut self) -> &mut Option<String> {
        if self.operator.is_some() {
            &mut self.right
        } else {
            &mut self.left
        }
    }

    fn evaluate(&self) -> Option<f64> {
        let left: f64 = self.left.as_deref()?.parse().ok()?;
        let right: f64 = self.right.as_deref()?.parse().ok()?;
        match self.operator.as_deref()? {
            "+" => Some(left + right),
            "-" => Some(left - right),
            "*" => Some(left * right),
            "/" => Some(left / right),
            _ => None,
        }
    }
}

fn has_operator(calculator: &Calculator, _: Option<&Actor>) -> bool {
    calculator.operator.is_some()
}

impl Aggregate for Calculator {
    const NAME: &'static str = "Calculator";

    type Command = CalculatorCommand;
    type Event = CalculatorEvent;
    type Error = CalculatorError;

    fn given(command: &CalculatorCommand) -> Vec<Invariant<Self>> {
        match command {
            CalculatorCommand::PressKey { key } if key == "=" => {
                vec![Invariant::new("equals needs an operator", has_operator)]
            }
            _ => Vec::new(),
        }
    }

    fn handle(
        &self,
        command: CalculatorCommand,
        _actor: Option<&Actor>,
    ) -> Result<Vec<CalculatorEvent>, CalculatorError> {
        let key = match command {
            CalculatorCommand::Reset => return Ok(vec![CalculatorEvent::Cleared]),
            CalculatorCommand::PressKey { key } => key,
        };
        let event = match key.as_str() {
            "." => CalculatorEvent::DotPressed,
            "=" => CalculatorEvent::EqualsPressed,
            k if OPERATORS.contains(&k) => CalculatorEvent::OperatorPressed { operator: key },
            k if k.len() == 1 && k.chars().all(|c| c.is_ascii_digit()) => {
                CalculatorEvent::DigitPressed { digit: key }
            }
            _ => return Err(CalculatorError::UnknownKey(key)),
        };
        Ok(vec![event])
    }

    fn apply(mut self, event: &CalculatorEvent) -> Self {
        match event {
            CalculatorEvent::DigitPressed { digit } => {
                self.operand().get_or_insert_with(String::new).push_str(digit);
            }
            CalculatorEvent::DotPressed => {
                let operand = self.operand().get_or_insert_with(String::new);
                if !operand.contains('.') {
                    operand.push('.');
                }
            }
            CalculatorEvent::OperatorPressed { operator } => {
                self.operator = Some(operator.clone());
            }
            CalculatorEvent::EqualsPressed => {
                if let Some(result) = self.evaluate() {
                    self.left = Some(result.to_string());
                    self.result = Some(result);
                }
                self.operator = None;
                self.right = None;
            }
            CalculatorEvent::Cleared => self = Self::default(),
        }
        self
    }
}

pub fn press(stream: &str, key: &str) -> Command {
    Command::encode(&CalculatorCommand::PressKey { key: key.into() })
        .expect("encode")
        .with_stream(stream)
}

// ---------------------------------------------------------------------------
// Room booking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    #[default]
    Open,
    Waiting,
    Booked,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub status: RoomStatus,
    pub month: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum RoomCommand {
    RequestBooking { room: String, month: String },
    Book,
    Reject,
}

impl Messages for RoomCommand {
    const NAMES: &'static [&'static str] = &["RequestBooking", "Book", "Reject"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum RoomEvent {
    BookingRequested { room: String, month: String },
    RoomBooked,
    BookingRejected,
}

impl Messages for RoomEvent {
    const NAMES: &'static [&'static str] = &["BookingRequested", "RoomBooked", "BookingRejected"];
}

fn is_open(room: &Room, _: Option<&Actor>) -> bool {
    room.status == RoomStatus::Open
}

fn is_waiting(room: &Room, _: Option<&Actor>) -> bool {
    room.status == RoomStatus::Waiting
}

impl Aggregate for Room {
    const NAME: &'static str = "Room";

    type Command = RoomCommand;
    type Event = RoomEvent;
    type Error = std::convert::Infallible;

    fn given(command: &RoomCommand) -> Vec<Invariant<Self>> {
        match command {
            RoomCommand::RequestBooking { .. } => vec![Invariant::new("room must be open", is_open)],
            RoomCommand::Book | RoomCommand::Reject => {
                vec![Invariant::new("room must be waiting", is_waiting)]
            }
        }
    }

    fn handle(
        &self,
        command: RoomCommand,
        _actor: Option<&Actor>,
    ) -> Result<Vec<RoomEvent>, Self::Error> {
        Ok(vec![match command {
            RoomCommand::RequestBooking { room, month } => {
                RoomEvent::BookingRequested { room, month }
            }
            RoomCommand::Book => RoomEvent::RoomBooked,
            RoomCommand::Reject => RoomEvent::BookingRejected,
        }])
    }

    fn apply(mut self, event: &RoomEvent) -> Self {
        match event {
            RoomEvent::BookingRequested { month, .. } => {
                self.status = RoomStatus::Waiting;
                self.month = Some(month.clone());
            }
            RoomEvent::RoomBooked => self.status = RoomStatus::Booked,
            RoomEvent::BookingRejected => {
                self.status = RoomStatus::Open;
                self.month = None;
            }
        }
        self
    }
}

/// Rooms that can be booked per month.
pub const MONTHLY_CAP: u32 = 3;

/// Books rooms until the month is full, then rejects.
///
/// Keyed by month, so one manager instance sees requests from every room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookingManager {
    pub booked: u32,
}

impl ProcessManager for BookingManager {
    const NAME: &'static str = "BookingManager";

    type Event = RoomEvent;
    type Error = serde_json::Error;

    fn subscriptions() -> &'static [&'static str] {
        &["BookingRequested"]
    }

    fn actor(event: &RoomEvent, committed: &CommittedEvent) -> String {
        match event {
            RoomEvent::BookingRequested { month, .. } => month.clone(),
            _ => committed.stream.clone(),
        }
    }

    fn on(
        &self,
        event: &RoomEvent,
        _committed: &CommittedEvent,
    ) -> Result<Option<Command>, serde_json::Error> {
        let RoomEvent::BookingRequested { room, .. } = event else {
            return Ok(None);
        };
        let command = if self.booked < MONTHLY_CAP {
            RoomCommand::Book
        } else {
            RoomCommand::Reject
        };
        Command::encode(&command).map(|c| Some(c.with_stream(room.clone())))
    }

    fn apply(mut self, event: &RoomEvent) -> Self {
        if *event == RoomEvent::RoomBooked {
            self.booked += 1;
        }
        self
    }
}

pub fn request(room: &str, month: &str) -> Command {
    Command::encode(&RoomCommand::RequestBooking {
        room: room.into(),
        month: month.into(),
    })
    .expect("encode")
    .with_stream(room)
}

// ---------------------------------------------------------------------------
// Store decorators
// ---------------------------------------------------------------------------

/// Yields to the runtime before every store call.
///
/// Two pipelines joined on one task then advance one store call at a time,
/// which makes their interleaving deterministic.
#[derive(Debug, Clone, Default)]
pub struct YieldingStore {
    inner: InMemoryStore,
}

impl YieldingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for YieldingStore {
    fn name(&self) -> &str {
        "yielding"
    }

    async fn query(
        &self,
        query: &Query,
        callback: &mut (dyn for<'e> FnMut(&'e CommittedEvent) + Send),
    ) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.inner.query(query, callback).await
    }

    async fn commit(
        &self,
        stream: &str,
        events: Vec<Message>,
        metadata: CommittedEventMetadata,
        expected_version: Option<i64>,
    ) -> StoreResult<Vec<CommittedEvent>> {
        tokio::task::yield_now().await;
        self.inner
            .commit(stream, events, metadata, expected_version)
            .await
    }

    async fn poll(
        &self,
        consumer: &str,
        names: &[String],
        limit: usize,
        timeout: Duration,
    ) -> StoreResult<Option<Lease>> {
        tokio::task::yield_now().await;
        self.inner.poll(consumer, names, limit, timeout).await
    }

    async fn ack(&self, lease: &Lease, watermark: Option<u64>) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.inner.ack(lease, watermark).await
    }

    async fn subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        self.inner.subscriptions().await
    }

    async fn stats(&self) -> StoreResult<Vec<StoreStat>> {
        self.inner.stats().await
    }
}
