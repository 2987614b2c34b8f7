pub mod subscription;

/// A deterministic state machine driven by explicit inputs and drained through polled outputs.
///
/// Implementors keep their protocol logic free of IO, clocks, randomness, locks and async so the
/// same sequence of inputs always yields the same sequence of outputs. The async side of the
/// crate owns a machine, feeds it what it observed on the wire through
/// [`process_input`](StateMachine::process_input) and then acts on every output returned by
/// [`poll_output`](StateMachine::poll_output) until it returns `None`.
///
/// Keeping the two halves apart means the lifecycle rules (which transitions are legal, which
/// signals fire at most once) are unit tested without a runtime, and the runner only has to
/// translate outputs into channel sends and broker commands.
///
/// # Invariants
/// - No interior mutability and no shared ownership (`Rc`, `Arc`, cells, mutexes).
/// - No IO and no access to system time or entropy. Time, when needed, arrives as input.
/// - No threads, tasks or `async`; every call returns without blocking.
///
/// Logging through `tracing` is an allowed side effect as long as the machine's behavior never
/// depends on it.
///
/// # Example
/// ```ignore
/// let mut machine = SubscriptionMachine::new();
/// machine.process_input(SubscriptionInput::SubscribeIssued);
/// machine.process_input(SubscriptionInput::Acknowledged { count: 1 });
///
/// while let Some(output) = machine.poll_output() {
///     match output {
///         SubscriptionOutput::Subscribed => { /* fire the signal */ }
///         SubscriptionOutput::Deliver(payload) => { /* push to the consumer */ }
///         SubscriptionOutput::Finished => { /* leave the receive loop */ }
///     }
/// }
/// ```
pub trait StateMachine {
    /// The type of input [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output [polled](StateMachine::poll_output) from the state machine.
    type Output;

    /// Feed one input into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Take the next pending output, if any.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
