//! Error types for the mode controller.

use super::Role;
use crate::sampler::LocationError;
use crate::session::error::SessionAlreadyActive;
use crate::sync::error::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The operation belongs to a role other than the selected one.
    #[error("the {expected} role is not selected")]
    RoleNotSelected { expected: Role },

    #[error(transparent)]
    SessionActive(#[from] SessionAlreadyActive),

    #[error("could not start location updates")]
    Location(#[from] LocationError),

    #[error("could not reach the broadcast channel")]
    Sync(#[from] SyncError),

    #[error("invalid {key}: {reason}")]
    InvalidConfig { key: &'static str, reason: String },
}
