use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bus_buddy::connect_bidirectional;
use bus_buddy::controller::{CoreConfig, Destination, ModeController, Role};
use bus_buddy::position::Position;
use bus_buddy::routing::osrm::OsrmRouteProvider;
use bus_buddy::sampler::PositionSampler;
use bus_buddy::sampler::scripted::{ScriptStep, ScriptedSource};
use bus_buddy::sync::moq::MoqStore;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

const RIDER: Position = Position::new(5.6140, -0.1862);

/// A rider waiting in place, reporting a slightly noisy fix every few seconds.
fn waiting_rider(fixes: u32) -> Vec<ScriptStep> {
    let mut rng = StdRng::from_os_rng();
    (0..fixes)
        .map(|index| {
            let position = Position::new(
                RIDER.latitude + rng.random_range(-3e-6..3e-6),
                RIDER.longitude + rng.random_range(-3e-6..3e-6),
            );
            ScriptStep::fix(Duration::from_secs(3) * index, position)
        })
        .collect()
}

/// `DESTINATION` is either `rider` or a `lat,lon` stop.
fn destination() -> Result<Destination> {
    let Ok(raw) = std::env::var("DESTINATION") else {
        return Ok(Destination::Rider);
    };
    if raw.trim().eq_ignore_ascii_case("rider") {
        return Ok(Destination::Rider);
    }

    let (lat, lon) = raw
        .split_once(',')
        .context("DESTINATION must be `rider` or `lat,lon`")?;
    Ok(Destination::Fixed(Position::new(
        lat.trim().parse().context("invalid destination latitude")?,
        lon.trim().parse().context("invalid destination longitude")?,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = CoreConfig::from_env()?;
    let destination = destination()?;

    info!(
        entity_id = %config.entity_id,
        relay = %config.relay_url,
        ?destination,
        "Rider connecting to relay"
    );

    let (_session, producer, consumer) = connect_bidirectional(&config.relay_url).await?;
    let store = Arc::new(MoqStore::new(producer, consumer));
    let provider = Arc::new(OsrmRouteProvider::new(config.osrm.clone())?);
    let sampler = PositionSampler::new(
        Arc::new(ScriptedSource::new(waiting_rider(1_200))),
        config.sampler.clone(),
    );

    let mut controller = ModeController::new(config, sampler, store, provider);
    controller.select_role(Role::Listener).await;
    controller.start_tracking(destination).await?;

    let mut snapshots = controller.snapshots();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            snapshot = snapshots.next() => {
                let Some(snapshot) = snapshot else { break };
                if let Some(estimate) = snapshot.estimate {
                    info!(
                        status = %snapshot.status,
                        distance_km = estimate.distance_km(),
                        eta_minutes = estimate.eta_minutes(),
                        "Bus on the way"
                    );
                }
                println!("{}", serde_json::to_string(&snapshot)?);
                if !snapshot.active && snapshot.fault.is_some() {
                    break;
                }
            }
        }
    }

    controller.stop_tracking().await;
    info!("Rider stopped");
    Ok(())
}
