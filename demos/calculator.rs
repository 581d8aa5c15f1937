//! Self-contained demo: an RPN calculator aggregate with checkpoints, a
//! projection fed by the background dispatcher, and structured logs.
//!
//! Run with: `RUST_LOG=eventfold_kernel=debug cargo run --example calculator`

use eventfold_kernel::{
    Actor, Aggregate, Command, CommittedEvent, Dispatcher, DispatcherConfig, Invariant, Kernel,
    KernelError, LoadOptions, Messages, Projection, SnapshotOptions,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Calculator aggregate
// ---------------------------------------------------------------------------

/// A reverse-Polish calculator: operands go on a stack, operators pop two.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Calculator {
    stack: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
enum CalculatorCommand {
    Push { value: f64 },
    Add,
    Multiply,
}

impl Messages for CalculatorCommand {
    const NAMES: &'static [&'static str] = &["Push", "Add", "Multiply"];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
enum CalculatorEvent {
    Pushed { value: f64 },
    Added,
    Multiplied,
}

impl Messages for CalculatorEvent {
    const NAMES: &'static [&'static str] = &["Pushed", "Added", "Multiplied"];
}

fn two_operands(calculator: &Calculator, _: Option<&Actor>) -> bool {
    calculator.stack.len() >= 2
}

impl Calculator {
    fn fold(mut self, op: fn(f64, f64) -> f64) -> Self {
        if let (Some(right), Some(left)) = (self.stack.pop(), self.stack.pop()) {
            self.stack.push(op(left, right));
        }
        self
    }
}

impl Aggregate for Calculator {
    const NAME: &'static str = "Calculator";

    type Command = CalculatorCommand;
    type Event = CalculatorEvent;
    type Error = std::convert::Infallible;

    fn given(command: &CalculatorCommand) -> Vec<Invariant<Self>> {
        match command {
            CalculatorCommand::Push { .. } => Vec::new(),
            _ => vec![Invariant::new("needs two operands", two_operands)],
        }
    }

    fn handle(
        &self,
        command: CalculatorCommand,
        _actor: Option<&Actor>,
    ) -> Result<Vec<CalculatorEvent>, Self::Error> {
        Ok(vec![match command {
            CalculatorCommand::Push { value } => CalculatorEvent::Pushed { value },
            CalculatorCommand::Add => CalculatorEvent::Added,
            CalculatorCommand::Multiply => CalculatorEvent::Multiplied,
        }])
    }

    fn apply(mut self, event: &CalculatorEvent) -> Self {
        match event {
            CalculatorEvent::Pushed { value } => {
                self.stack.push(*value);
                self
            }
            CalculatorEvent::Added => self.fold(|a, b| a + b),
            CalculatorEvent::Multiplied => self.fold(|a, b| a * b),
        }
    }
}

// ---------------------------------------------------------------------------
// Operation counter projection
// ---------------------------------------------------------------------------

/// Counts operations across every calculator.
#[derive(Debug, Clone, Default)]
struct Operations {
    total: u64,
    last_id: u64,
}

impl Projection for Operations {
    const NAME: &'static str = "Operations";

    type Event = CalculatorEvent;

    fn subscriptions() -> &'static [&'static str] {
        &["Added", "Multiplied"]
    }

    fn apply(&mut self, _event: &CalculatorEvent, committed: &CommittedEvent) {
        if committed.id > self.last_id {
            self.last_id = committed.id;
            self.total += 1;
        }
    }
}

fn command(command: &CalculatorCommand, stream: &str) -> Result<Command, KernelError> {
    Ok(Command::encode(command)?.with_stream(stream))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let kernel = Kernel::builder()
        .aggregate_with::<Calculator>(SnapshotOptions::checkpoint(3))
        .projection::<Operations>()
        .build()?;
    let dispatcher = Dispatcher::new(kernel.clone(), DispatcherConfig::default());
    dispatcher.start();

    // (2 + 3) * 4
    let program = [
        CalculatorCommand::Push { value: 2.0 },
        CalculatorCommand::Push { value: 3.0 },
        CalculatorCommand::Add,
        CalculatorCommand::Push { value: 4.0 },
        CalculatorCommand::Multiply,
    ];
    for step in &program {
        kernel.command(command(step, "calc-1")?).await?;
    }

    match kernel.command(command(&CalculatorCommand::Add, "calc-1")?).await {
        Err(KernelError::Invariant { description, .. }) => {
            println!("rejected: {description}");
        }
        other => println!("unexpected: {other:?}"),
    }

    let snapshot = kernel
        .load_aggregate::<Calculator>("calc-1", LoadOptions::default())
        .await?;
    println!(
        "stack = {:?} (replayed {} of {} events)",
        snapshot.state.stack, snapshot.apply_count, snapshot.event_count
    );

    dispatcher.drain().await;
    let operations = kernel.projection::<Operations>().await?;
    println!("operations = {}", operations.total);

    dispatcher.stop().await;
    Ok(())
}
