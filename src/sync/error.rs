//! Error types for broadcast synchronization.

use crate::entity::EntityId;

/// Failures reported by a [`RealtimeStore`](super::RealtimeStore) implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The store refused or could not accept a write.
    #[error("store rejected write: {0}")]
    Rejected(String),

    /// The store could not establish a subscription.
    #[error("subscription failed: {0}")]
    Subscribe(String),

    /// A row could not be decoded.
    #[error("malformed broadcast row: {0}")]
    Malformed(String),
}

impl From<prost::DecodeError> for StoreError {
    fn from(err: prost::DecodeError) -> Self {
        StoreError::Malformed(err.to_string())
    }
}

/// Errors surfaced by the [`SyncChannel`](super::SyncChannel).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// A publish was rejected. The broadcaster should flag itself disconnected.
    #[error("broadcast for {entity_id} failed")]
    BroadcastFailed {
        entity_id: EntityId,
        #[source]
        source: StoreError,
    },

    /// A listener's subscription was lost.
    #[error("channel for {entity_id} disconnected: {reason}")]
    ChannelDisconnected { entity_id: EntityId, reason: String },

    /// A listener could not subscribe in the first place.
    #[error("could not subscribe to {entity_id}")]
    SubscribeFailed {
        entity_id: EntityId,
        #[source]
        source: StoreError,
    },
}
