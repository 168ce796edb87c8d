use bon::Builder;
use url::Url;

use super::error::ControllerError;
use crate::entity::EntityId;
use crate::routing::{OsrmConfig, RouteConfig};
use crate::sampler::SamplerOptions;
use crate::state_machine::movement::MovementConfig;

pub const DEFAULT_ENTITY_ID: &str = "bus-1";
pub const DEFAULT_TABLE: &str = "bus_locations";
pub const DEFAULT_RELAY_URL: &str = "https://localhost:4443";

/// Everything a [`ModeController`](super::ModeController) and the demo binaries need to run.
#[derive(Debug, Clone, Builder)]
pub struct CoreConfig {
    /// The broadcaster this device publishes as, or tracks when listening.
    #[builder(default = EntityId::try_from(DEFAULT_ENTITY_ID).expect("default entity id is valid"))]
    pub entity_id: EntityId,

    /// Realtime store table holding broadcast records.
    #[builder(into, default = DEFAULT_TABLE.to_string())]
    pub table: String,

    #[builder(default = Url::parse(DEFAULT_RELAY_URL).expect("default relay url is valid"))]
    pub relay_url: Url,

    #[builder(default)]
    pub osrm: OsrmConfig,

    #[builder(default)]
    pub movement: MovementConfig,

    #[builder(default)]
    pub route: RouteConfig,

    #[builder(default)]
    pub sampler: SamplerOptions,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CoreConfig {
    /// Read `ENTITY_ID`, `RELAY_URL`, `OSRM_URL` and `BROADCAST_TABLE`, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let mut config = Self::default();

        if let Some(entity_id) = lookup("ENTITY_ID").filter(|id| !id.trim().is_empty()) {
            config.entity_id =
                EntityId::try_from(entity_id).map_err(|err| ControllerError::InvalidConfig {
                    key: "ENTITY_ID",
                    reason: err.to_string(),
                })?;
        }

        if let Some(table) = lookup("BROADCAST_TABLE").filter(|table| !table.trim().is_empty()) {
            config.table = table.trim().to_string();
        }

        if let Some(relay_url) = lookup("RELAY_URL") {
            config.relay_url =
                Url::parse(&relay_url).map_err(|err| ControllerError::InvalidConfig {
                    key: "RELAY_URL",
                    reason: err.to_string(),
                })?;
        }

        if let Some(osrm_url) = lookup("OSRM_URL") {
            Url::parse(&osrm_url).map_err(|err| ControllerError::InvalidConfig {
                key: "OSRM_URL",
                reason: err.to_string(),
            })?;
            config.osrm.endpoint = osrm_url;
        }

        Ok(config)
    }
}
