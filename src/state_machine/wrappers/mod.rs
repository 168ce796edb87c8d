//! Common wrappers for [`StateMachine`](super::StateMachine) inputs and outputs that carry
//! system-provided values, mainly the current time.

pub mod input;
pub mod output;
