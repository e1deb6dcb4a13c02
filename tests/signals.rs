//! OS termination signals drive the shutdown sequence once.
//!
//! Lives in its own test binary: the handlers replace the default SIGTERM
//! disposition for the whole process.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use account_service::lifecycle::{self, ShutdownState};
use account_service::messaging::{ExchangeType, LocalBroker};
use account_service::resilience::{DiscoveryToken, InstanceState};
use common::{eventually, observe, options, peer_client, MockConfigServer};
use serde_json::json;

fn send_sigterm() {
    let status = std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_repeated_sigterm_shuts_down_once() {
    let server = MockConfigServer::start(json!({
        "server_port": 0,
        "amqp_server_url": "memory://broker"
    }))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let broker = LocalBroker::new();
    let mut opts = options(&server.url(), dir.path());
    opts.install_signal_handlers = true;

    let service = lifecycle::start(opts, Arc::new(broker.clone())).await.unwrap();
    let peers = service.peers.clone();
    assert!(eventually(Duration::from_secs(5), || peers.peers().len() == 1).await);

    let peer = peer_client(&broker).await;
    let mut discovery = observe(&peer, "discovery", ExchangeType::Fanout).await;
    let mut stop = service.coordinator.shutdown().subscribe();

    send_sigterm();
    send_sigterm();

    let coordinator = service.coordinator.clone();
    tokio::time::timeout(Duration::from_secs(10), coordinator.wait_terminated())
        .await
        .unwrap();
    assert_eq!(coordinator.state(), ShutdownState::Terminated);

    // A third signal after termination is ignored as well.
    send_sigterm();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let body = tokio::time::timeout(Duration::from_secs(2), discovery.recv())
        .await
        .unwrap()
        .unwrap();
    let token: DiscoveryToken = serde_json::from_slice(&body).unwrap();
    assert_eq!(token.state, InstanceState::Down);
    assert!(tokio::time::timeout(Duration::from_millis(200), discovery.recv())
        .await
        .is_err());

    // The stop broadcast fired exactly once.
    assert!(stop.try_recv().is_ok());
    assert!(stop.try_recv().is_err());
    assert!(!service.registry.is_registered());
    assert!(!service.messaging.is_connected());
    assert!(service.storage.is_closed());
}
