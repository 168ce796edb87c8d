use crate::position::Timestamp;

/// The [`SystemResource`] trait indicates that a type is a resource inherently provided by the
/// system context of the application, such as the wall clock.
///
/// [`generate`](SystemResource::generate) takes no input and draws only from that implicit
/// context. Runners use it to build [`SystemInput::System`] values; state machines never call it.
pub trait SystemResource {
    /// Produce an instance of this resource from the implicit system context.
    fn generate() -> Self;
}

impl SystemResource for Timestamp {
    fn generate() -> Self {
        Timestamp::now()
    }
}

/// A [`StateMachine`](super::super::StateMachine) input wrapper that separates domain input `I`
/// from system-provided resources `S`.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemInput<I, S> {
    Input(I),
    System(S),
}
