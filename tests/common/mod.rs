//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use account_service::lifecycle::StartupOptions;
use account_service::messaging::{
    ConnectOptions, Delivery, ExchangeType, LocalBroker, MessageHandler, MessagingClient,
};
use async_trait::async_trait;
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

struct ConfigState {
    status: u16,
    properties: Value,
    version: u64,
    last_path: Option<String>,
}

/// Spring Cloud Config style server on a random local port.
#[derive(Clone)]
pub struct MockConfigServer {
    addr: SocketAddr,
    state: Arc<Mutex<ConfigState>>,
    hits: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct ServerCtx {
    state: Arc<Mutex<ConfigState>>,
    hits: Arc<AtomicUsize>,
}

impl MockConfigServer {
    pub async fn start(properties: Value) -> Self {
        let state = Arc::new(Mutex::new(ConfigState {
            status: 200,
            properties,
            version: 1,
            last_path: None,
        }));
        let hits = Arc::new(AtomicUsize::new(0));

        let app = Router::new()
            .route("/{app}/{profile}/{branch}", get(serve_config))
            .with_state(ServerCtx {
                state: state.clone(),
                hits: hits.clone(),
            });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state, hits }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Serve new properties under a bumped version.
    pub fn set_properties(&self, properties: Value) {
        let mut state = self.state.lock().unwrap();
        state.properties = properties;
        state.version += 1;
        state.status = 200;
    }

    pub fn fail_with(&self, status: u16) {
        self.state.lock().unwrap().status = status;
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_path(&self) -> Option<String> {
        self.state.lock().unwrap().last_path.clone()
    }
}

async fn serve_config(
    State(ctx): State<ServerCtx>,
    UrlPath((app, profile, branch)): UrlPath<(String, String, String)>,
) -> Response {
    ctx.hits.fetch_add(1, Ordering::SeqCst);
    let mut state = ctx.state.lock().unwrap();
    state.last_path = Some(format!("/{app}/{profile}/{branch}"));

    let status = StatusCode::from_u16(state.status).unwrap();
    if !status.is_success() {
        return (status, "config server failure").into_response();
    }
    Json(json!({
        "name": app,
        "profiles": [profile],
        "label": branch,
        "version": format!("v{}", state.version),
        "propertySources": [
            { "name": format!("{app}-{profile}.yml"), "source": state.properties }
        ]
    }))
    .into_response()
}

/// Startup options pointing at `server`, storing under `dir`, with a short
/// broker retry window and no OS signal handlers.
pub fn options(server_url: &str, dir: &Path) -> StartupOptions {
    let mut options = StartupOptions::new(server_url, "test", "master");
    options.install_signal_handlers = false;
    options.bootstrap.storage.path = dir.join("accounts.db").display().to_string();
    options.bootstrap.broker.connect_attempts = 2;
    options.bootstrap.broker.base_delay_ms = 10;
    options.bootstrap.broker.max_delay_ms = 20;
    options.bootstrap.broker.drain_timeout_ms = 200;
    options.bootstrap.shutdown.step_timeout_secs = 2;
    options
}

/// A second client on the same broker, standing in for other services.
pub async fn peer_client(broker: &LocalBroker) -> MessagingClient {
    let client = MessagingClient::new(Arc::new(broker.clone()), ConnectOptions::default());
    client.connect_to_broker("memory://broker").await.unwrap();
    client
}

/// Forwards every delivery body to a channel.
pub struct Collect(pub mpsc::UnboundedSender<Vec<u8>>);

#[async_trait]
impl MessageHandler for Collect {
    async fn handle(&self, delivery: Delivery) {
        let _ = self.0.send(delivery.body);
    }
}

pub async fn observe(
    client: &MessagingClient,
    exchange: &str,
    kind: ExchangeType,
) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    client
        .subscribe(exchange, kind, "observer", Arc::new(Collect(tx)))
        .await
        .unwrap();
    rx
}

pub fn refresh_event(destination: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "type": "RefreshRemoteApplicationEvent",
        "timestamp": 1_494_514_362_123u64,
        "originService": "config-server:docker:8888",
        "destinationService": destination,
        "id": "53e61c71-cbae-4b6d-84bb-d0dcc0aeb4dc"
    }))
    .unwrap()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
