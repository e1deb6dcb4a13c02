//! Startup orchestration.
//!
//! Steps run strictly in order on the calling task; any error before the
//! listener binds is fatal:
//!
//! 1. fetch the remote configuration
//! 2. check the broker URL is present
//! 3. open and seed the store
//! 4. connect to the broker and subscribe the refresh listener
//! 5. initialize span export
//! 6. configure circuit breakers and start health reporting
//! 7. install the shutdown coordinator
//!
//! Serving (`Service::serve`) is the last, blocking step.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::config::{
    BootstrapConfig, ConfigChangeListener, ConfigError, ConfigHolder, ConfigLoader, ServiceIdentity,
};
use crate::http::{AppState, HttpServer};
use crate::lifecycle::shutdown::{Shutdown, ShutdownCoordinator, ShutdownError, ShutdownReason};
use crate::lifecycle::signals;
use crate::messaging::{ConnectOptions, ExchangeType, MessagingClient, MessagingError, Transport};
use crate::observability::{init_tracing, ExportOptions, SpanExporter};
use crate::resilience::{BreakerHealthHandler, CircuitBreakerRegistry, HealthReporting};
use crate::storage::{StorageClient, StorageError};

/// Application name used for config lookup and discovery.
pub const APP_NAME: &str = "accountservice";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("HTTP server failed: {0}")]
    Serve(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StartupOptions {
    pub identity: ServiceIdentity,
    pub config_server_url: String,
    pub bootstrap: BootstrapConfig,
    pub install_signal_handlers: bool,
}

impl StartupOptions {
    pub fn new(config_server_url: impl Into<String>, profile: &str, branch: &str) -> Self {
        Self {
            identity: ServiceIdentity::new(APP_NAME, profile, branch),
            config_server_url: config_server_url.into(),
            bootstrap: BootstrapConfig::default(),
            install_signal_handlers: true,
        }
    }
}

/// Everything a started service owns.
#[derive(Debug)]
pub struct Service {
    pub config: ConfigHolder,
    pub storage: Arc<StorageClient>,
    pub messaging: Arc<MessagingClient>,
    pub registry: Arc<CircuitBreakerRegistry>,
    pub peers: Arc<BreakerHealthHandler>,
    pub tracer: SpanExporter,
    pub coordinator: ShutdownCoordinator,
    port: u16,
    request_timeout: Duration,
}

/// Run every startup step up to, but not including, serving.
pub async fn start(
    options: StartupOptions,
    transport: Arc<dyn Transport>,
) -> Result<Service, StartupError> {
    let bootstrap = &options.bootstrap;
    let app_name = options.identity.app_name.clone();

    tracing::info!(
        identity = %options.identity,
        config_server = %options.config_server_url,
        "Starting {}",
        app_name
    );

    let loader = ConfigLoader::new(
        options.config_server_url.clone(),
        options.identity.clone(),
        Duration::from_secs(bootstrap.config_server.fetch_timeout_secs),
    )?;
    let config = ConfigHolder::new(loader.load().await?);
    let snapshot = config.current();

    let amqp_url = snapshot.amqp_server_url()?;
    let port = snapshot.server_port()?;

    let storage = Arc::new(StorageClient::open(&bootstrap.storage.path)?);
    storage.seed()?;

    let messaging = Arc::new(MessagingClient::new(
        transport,
        ConnectOptions::from(&bootstrap.broker),
    ));
    messaging.connect_to_broker(&amqp_url).await?;

    let event_bus = snapshot
        .config_event_bus()
        .unwrap_or_else(|| bootstrap.config_server.default_event_bus.clone());
    Arc::new(ConfigChangeListener::new(loader, config.clone()))
        .start(&messaging, &event_bus)
        .await?;

    let tracer = init_tracing(
        snapshot.zipkin_server_url().as_deref(),
        &app_name,
        ExportOptions::from(&bootstrap.observability),
    )
    .await;

    let instance_id = format!("{}-{}", app_name, Uuid::new_v4());
    let peers = Arc::new(BreakerHealthHandler::new());
    messaging
        .subscribe(
            &bootstrap.broker.discovery_exchange,
            ExchangeType::Fanout,
            &instance_id,
            peers.clone(),
        )
        .await?;
    let registry = CircuitBreakerRegistry::configure_hystrix(
        &bootstrap.breakers.dependencies,
        &bootstrap.breakers,
        &snapshot,
        HealthReporting {
            exchange: bootstrap.broker.discovery_exchange.clone(),
            heartbeat: Duration::from_secs(bootstrap.broker.heartbeat_secs),
            service: app_name.clone(),
            address: format!("{}:{}", bootstrap.service.advertise_host, port),
            instance_id,
        },
        messaging.clone(),
    )
    .await?;

    let coordinator = ShutdownCoordinator::new(
        Shutdown::new(),
        registry.clone(),
        messaging.clone(),
        storage.clone(),
        Duration::from_secs(bootstrap.shutdown.step_timeout_secs),
    );
    if options.install_signal_handlers {
        signals::install(coordinator.clone())?;
    }

    tracing::info!(port, "Startup complete");
    Ok(Service {
        config,
        storage,
        messaging,
        registry,
        peers,
        tracer,
        coordinator,
        port,
        request_timeout: Duration::from_secs(bootstrap.service.request_timeout_secs),
    })
}

impl Service {
    /// Port taken from the remote `server_port` key.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            config: self.config.clone(),
            storage: self.storage.clone(),
            registry: self.registry.clone(),
            peers: self.peers.clone(),
            tracer: self.tracer.clone(),
        }
    }

    /// Bind `0.0.0.0:{port}`.
    pub async fn bind(&self) -> Result<TcpListener, StartupError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::Bind { addr, source })
    }

    /// Serve on `listener` until shutdown, then wait for the cleanup
    /// sequence to finish.
    pub async fn serve_on(self, listener: TcpListener) -> Result<(), StartupError> {
        let server = HttpServer::new(self.app_state(), self.request_timeout);
        let stop = self.coordinator.shutdown().subscribe();
        if self.coordinator.is_shutting_down() {
            self.coordinator.wait_terminated().await;
            return Ok(());
        }

        let served = server.run(listener, stop).await;
        if let Err(e) = &served {
            tracing::error!(error = %e, "HTTP server exited with error");
            self.coordinator.initiate(ShutdownReason::Application).await;
        }
        self.coordinator.wait_terminated().await;
        served.map_err(StartupError::Serve)
    }

    /// Bind and serve. A failed bind still runs the shutdown sequence so
    /// peers see the instance go DOWN.
    pub async fn serve(self) -> Result<(), StartupError> {
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = %e, "Failed to bind HTTP listener");
                self.coordinator.initiate(ShutdownReason::Application).await;
                self.coordinator.wait_terminated().await;
                return Err(e);
            }
        };
        self.serve_on(listener).await
    }
}
