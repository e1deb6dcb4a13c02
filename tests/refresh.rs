//! Configuration refresh over the event bus.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use account_service::lifecycle::{self, Service, ShutdownReason};
use account_service::messaging::{ExchangeType, LocalBroker, MessagingClient};
use common::{eventually, options, peer_client, refresh_event, MockConfigServer};
use serde_json::{json, Value};

const BUS: &str = "config-events";

fn properties(round: u64) -> Value {
    json!({
        "server_port": 6767,
        "amqp_server_url": "memory://broker",
        "config_event_bus": BUS,
        "marker_a": round.to_string(),
        "marker_b": round.to_string()
    })
}

async fn started(server: &MockConfigServer, dir: &std::path::Path) -> (Service, MessagingClient) {
    let broker = LocalBroker::new();
    let service = lifecycle::start(options(&server.url(), dir), Arc::new(broker.clone()))
        .await
        .unwrap();
    let peer = peer_client(&broker).await;
    (service, peer)
}

async fn publish(peer: &MessagingClient, body: Vec<u8>) {
    peer.publish(BUS, ExchangeType::Topic, body).await.unwrap();
}

#[tokio::test]
async fn test_readers_see_whole_snapshots() {
    let server = MockConfigServer::start(properties(1)).await;
    let dir = tempfile::tempdir().unwrap();
    let (service, peer) = started(&server, dir.path()).await;

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let config = service.config.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut reads = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let snapshot = config.current();
                assert_eq!(snapshot.get_string("marker_a"), snapshot.get_string("marker_b"));
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        })
    };

    for round in 2..=5u64 {
        server.set_properties(properties(round));
        publish(&peer, refresh_event("accountservice:**")).await;
        let config = service.config.clone();
        assert!(eventually(Duration::from_secs(5), || config.current().generation() == round).await);
        assert_eq!(config.current().get_string("marker_a"), Some(round.to_string()));
    }

    stop.store(true, Ordering::Relaxed);
    assert!(reader.await.unwrap() > 0);
    assert_eq!(service.config.current().version(), Some("v5"));

    service.coordinator.initiate(ShutdownReason::Application).await;
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_snapshot() {
    let server = MockConfigServer::start(properties(1)).await;
    let dir = tempfile::tempdir().unwrap();
    let (service, peer) = started(&server, dir.path()).await;
    assert_eq!(server.hits(), 1);

    server.fail_with(503);
    publish(&peer, refresh_event("**")).await;
    assert!(eventually(Duration::from_secs(5), || server.hits() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let current = service.config.current();
    assert_eq!(current.generation(), 1);
    assert_eq!(current.get_string("marker_a").as_deref(), Some("1"));

    // The listener is still subscribed after a failure.
    server.set_properties(properties(7));
    publish(&peer, refresh_event("accountservice")).await;
    let config = service.config.clone();
    assert!(eventually(Duration::from_secs(5), || config.current().generation() == 2).await);
    assert_eq!(config.current().get_string("marker_a").as_deref(), Some("7"));

    service.coordinator.initiate(ShutdownReason::Application).await;
}

#[tokio::test]
async fn test_events_for_other_services_are_ignored() {
    let server = MockConfigServer::start(properties(1)).await;
    let dir = tempfile::tempdir().unwrap();
    let (service, peer) = started(&server, dir.path()).await;

    server.set_properties(properties(2));
    publish(&peer, refresh_event("imageservice:**")).await;
    publish(&peer, b"not an event".to_vec()).await;
    publish(&peer, refresh_event("accountservice:**")).await;

    let config = service.config.clone();
    assert!(eventually(Duration::from_secs(5), || config.current().generation() == 2).await);
    // Startup fetch plus the one addressed event.
    assert_eq!(server.hits(), 2);

    service.coordinator.initiate(ShutdownReason::Application).await;
}
