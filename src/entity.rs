use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityIdError {
    #[error("entity id is blank")]
    Blank,

    #[error("entity id '{0}' contains '/', which separates broadcast path segments")]
    PathSeparator(String),
}

/// The broadcaster a record belongs to, typically one vehicle.
///
/// Ids are trimmed, non-blank and free of `/`, since each one names a broadcast path under its
/// table. One broadcaster per id is assumed; listeners filter on it.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntityId(Arc<str>);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<&str, EntityIdError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(EntityIdError::Blank);
        }
        if id.contains('/') {
            return Err(EntityIdError::PathSeparator(id.to_string()));
        }
        Ok(id)
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<&str> for EntityId {
    type Error = EntityIdError;

    fn try_from(id: &str) -> Result<Self, Self::Error> {
        Self::validate(id).map(|id| Self(id.into()))
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        if Self::validate(&id)?.len() == id.len() {
            return Ok(Self(id.into()));
        }
        Self::try_from(id.as_str())
    }
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        Self::try_from(id)
    }
}
