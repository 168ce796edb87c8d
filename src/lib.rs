pub mod controller;
pub mod entity;
pub mod position;
pub mod routing;
pub mod sampler;
pub mod session;
pub mod state_machine;
pub mod sync;

use anyhow::Result;
use moq_lite::{Client, Origin, Session};
use url::Url;
use web_transport_quinn::ClientBuilder;

/// Broadcast path carrying one entity's records within a table.
/// Published by the broadcaster, subscribed to by its listeners.
pub fn broadcast_path(table: &str, entity_id: &str) -> String {
    format!("{table}/{entity_id}")
}

/// Connect to the relay as a publisher + subscriber (bidirectional).
/// Returns the session handle and the origin producer/consumer pair.
pub async fn connect_bidirectional(
    relay_url: &Url,
) -> Result<(Session, moq_lite::OriginProducer, moq_lite::OriginConsumer)> {
    let pub_origin = Origin::produce();
    let sub_origin = Origin::produce();

    let wt_client = ClientBuilder::new()
        .dangerous()
        .with_no_certificate_verification()?;
    let wt_session = wt_client.connect(relay_url.clone()).await?;

    let client = Client::new()
        .with_publish(pub_origin.consumer)
        .with_consume(sub_origin.producer);
    let session = client.connect(wt_session).await?;

    Ok((session, pub_origin.producer, sub_origin.consumer))
}
