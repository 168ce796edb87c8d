pub mod error;

use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, Entry};
use tracing::debug;
use uuid::Uuid;

use self::error::{SessionAlreadyActive, SessionNotFound};
use crate::controller::Role;
use crate::entity::EntityId;

#[derive(Clone, Hash, PartialEq, Eq)]
pub struct SessionId(Arc<Uuid>);

impl SessionId {
    pub fn generate() -> Self {
        Self(Arc::new(Uuid::new_v4()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub entity_id: EntityId,
    pub role: Role,
}

type SessionKey = (EntityId, Role);

/// Tracks running broadcast and tracking sessions, at most one per entity and role.
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionKey, Session, ahash::RandomState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. It stays registered until the returned guard is dropped or the session is
    /// removed explicitly.
    pub fn create_session(
        &self,
        entity_id: &EntityId,
        role: Role,
    ) -> Result<SessionGuard, SessionAlreadyActive> {
        match self.sessions.entry((entity_id.clone(), role)) {
            Entry::Occupied(_) => Err(SessionAlreadyActive {
                entity_id: entity_id.clone(),
                role,
            }),
            Entry::Vacant(slot) => {
                let session_id = SessionId::generate();
                slot.insert(Session {
                    session_id: session_id.clone(),
                    entity_id: entity_id.clone(),
                    role,
                });
                debug!(
                    entity_id = %entity_id,
                    role = %role,
                    session_id = %session_id,
                    "Session opened"
                );

                Ok(SessionGuard {
                    sessions: Arc::clone(&self.sessions),
                    key: (entity_id.clone(), role),
                    session_id,
                })
            }
        }
    }

    pub fn remove_session(
        &self,
        entity_id: &EntityId,
        role: Role,
    ) -> Result<Session, SessionNotFound> {
        self.sessions
            .remove(&(entity_id.clone(), role))
            .map(|(_, session)| session)
            .ok_or_else(|| SessionNotFound {
                entity_id: entity_id.clone(),
                role,
            })
    }

    pub fn has_active_session(&self, entity_id: &EntityId, role: Role) -> bool {
        self.sessions.contains_key(&(entity_id.clone(), role))
    }

    pub fn get_session_id(&self, entity_id: &EntityId, role: Role) -> Option<SessionId> {
        self.sessions
            .get(&(entity_id.clone(), role))
            .map(|entry| entry.session_id.clone())
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Keeps a session registered for as long as it lives.
///
/// Dropping the guard only removes the entry it created, so a guard outliving an explicit
/// [`SessionRegistry::remove_session`] never evicts a newer session.
#[derive(Debug)]
pub struct SessionGuard {
    sessions: Arc<DashMap<SessionKey, Session, ahash::RandomState>>,
    key: SessionKey,
    session_id: SessionId,
}

impl SessionGuard {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self
            .sessions
            .remove_if(&self.key, |_, session| session.session_id == self.session_id)
            .is_some()
        {
            debug!(entity_id = %self.key.0, session_id = %self.session_id, "Session closed");
        }
    }
}
