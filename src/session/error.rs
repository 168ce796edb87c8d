//! Error types for session bookkeeping.

use crate::controller::Role;
use crate::entity::EntityId;

/// A session could not be opened because one is already running for this entity and role.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{entity_id} already has an active {role} session")]
pub struct SessionAlreadyActive {
    pub entity_id: EntityId,
    pub role: Role,
}

/// No session is running for this entity and role.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("no active {role} session for {entity_id}")]
pub struct SessionNotFound {
    pub entity_id: EntityId,
    pub role: Role,
}
