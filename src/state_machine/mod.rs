pub mod movement;
pub mod route;
pub mod timer;
pub mod wrappers;

/// The [`StateMachine`] trait provides calling semantics for the pure decision logic of this
/// crate and marks the invariants that make that logic deterministic.
///
/// # Functionality
/// A state machine consumes a unified [`Input`](StateMachine::Input) type and produces a unified
/// [`Output`](StateMachine::Output) type. Both are usually enums: the movement classifier takes
/// samples, clock ticks and a teardown signal, and emits status changes.
///
/// Dispatch from the unified input to the machine's inherent methods lives in
/// [`process_input`](StateMachine::process_input), and the reverse mapping for output lives in
/// [`poll_output`](StateMachine::poll_output). The inherent impl stays focused on the actual
/// transition rules.
///
/// # Invariants
/// Given the same sequence of inputs a [`StateMachine`] must produce the same sequence of
/// outputs. In practice that means:
///
/// - **No interior mutability.** State changes only through `&mut self`. No [`std::cell`] or
///   [`std::sync`] containers, and no `Rc`/`Arc` (reference counts are shared state).
/// - **No IO.** No sockets, files, or location hardware.
/// - **No system time.** Reading [`std::time::SystemTime`] or [`std::time::Instant`] from inside
///   the machine makes two otherwise identical runs diverge. Time arrives as input, either on the
///   data itself (a sample's capture time) or through a
///   [`SystemInput::System`](wrappers::input::SystemInput::System) tick.
/// - **No concurrency or async.** The machine never spawns, awaits or blocks.
///
/// Logging via `tracing` is allowed as a side effect as long as nothing in the machine depends
/// on its outcome.
///
/// # Runners
/// The impure parts (reading the clock, sleeping until a deadline, performing network calls) sit
/// in a runner that owns the machine. The runner feeds it input, drains output, and acts on the
/// output. See the sessions in [`controller`](crate::controller) and the
/// [`RouteEstimator`](crate::routing::RouteEstimator) for the two runners in this crate.
///
/// # Limitations
/// Any number of producers can feed input, since each constructs its own variant. Output can only
/// be drained by a single consumer because there is no way to poll for one specific variant.
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) from the state machine.
    type Output;

    /// Process the provided `input` into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
