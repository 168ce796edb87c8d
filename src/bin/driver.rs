use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bus_buddy::connect_bidirectional;
use bus_buddy::controller::{CoreConfig, ModeController, Role};
use bus_buddy::position::Position;
use bus_buddy::routing::osrm::OsrmRouteProvider;
use bus_buddy::sampler::PositionSampler;
use bus_buddy::sampler::scripted::{ScriptStep, ScriptedSource};
use bus_buddy::sync::moq::MoqStore;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

const FIX_INTERVAL: Duration = Duration::from_secs(1);
const START: Position = Position::new(5.6037, -0.1870);

/// A drive that alternates legs along the road with dwell periods at stops, with a little GPS
/// noise on every fix.
fn simulated_drive(laps: usize) -> Vec<ScriptStep> {
    let mut rng = StdRng::from_os_rng();
    let mut position = START;
    let mut steps = Vec::new();
    let mut at = Duration::ZERO;

    for lap in 0..laps {
        let heading = if lap % 2 == 0 { 1.0 } else { -1.0 };

        for _ in 0..30 {
            position.latitude += heading * 1.2e-4;
            steps.push(jittered(&mut rng, at, position));
            at += FIX_INTERVAL;
        }
        for _ in 0..10 {
            steps.push(jittered(&mut rng, at, position));
            at += FIX_INTERVAL;
        }
    }

    steps
}

fn jittered(rng: &mut StdRng, at: Duration, position: Position) -> ScriptStep {
    let noisy = Position::new(
        position.latitude + rng.random_range(-3e-6..3e-6),
        position.longitude + rng.random_range(-3e-6..3e-6),
    );
    ScriptStep::fix(at, noisy)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = CoreConfig::from_env()?;

    info!(
        entity_id = %config.entity_id,
        relay = %config.relay_url,
        table = %config.table,
        "Driver connecting to relay"
    );

    let (_session, producer, consumer) = connect_bidirectional(&config.relay_url).await?;
    let store = Arc::new(MoqStore::new(producer, consumer));
    let provider = Arc::new(OsrmRouteProvider::new(config.osrm.clone())?);
    let sampler = PositionSampler::new(
        Arc::new(ScriptedSource::new(simulated_drive(90))),
        config.sampler.clone(),
    );

    let table = config.table.clone();
    let entity_id = config.entity_id.clone();
    let mut controller = ModeController::new(config, sampler, store.clone(), provider);
    controller.select_role(Role::Broadcaster).await;
    controller.start_broadcasting()?;

    let mut snapshots = controller.snapshots();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            snapshot = snapshots.next() => {
                let Some(snapshot) = snapshot else { break };
                println!("{}", serde_json::to_string(&snapshot)?);
                if !snapshot.active && snapshot.fault.is_some() {
                    break;
                }
            }
        }
    }

    controller.stop_broadcasting().await;
    store.retire(&table, &entity_id);
    info!("Driver stopped");
    Ok(())
}
