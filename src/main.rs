//! Account service.
//!
//! ```text
//!  config server ──fetch──▶ ConfigHolder ◀──refresh── config event bus
//!                               │
//!       ┌───────────────┬───────┴───────┬──────────────────┐
//!       ▼               ▼               ▼                  ▼
//!   StorageClient  MessagingClient  CircuitBreakerRegistry  HttpServer
//!   (accounts)     (broker)         (UP / heartbeat / DOWN)  (:server_port)
//!                       ▲
//!                       └── ShutdownCoordinator (SIGINT/SIGTERM, once)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use account_service::config::loader::load_or_default;
use account_service::lifecycle::{self, StartupOptions, EXIT_CODE};
use account_service::messaging::AmqpTransport;
use account_service::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "account-service")]
#[command(about = "Account service backed by a remote config server", long_about = None)]
struct Cli {
    /// Environment profile, something like test, prod etc.
    #[arg(long, default_value = "test")]
    profile: String,

    /// Address to config server.
    #[arg(long = "configServerUrl", default_value = "http://configserver:8888")]
    config_server_url: String,

    /// Git branch to fetch configuration from.
    #[arg(long = "configBranch", default_value = "master")]
    config_branch: String,

    /// Optional bootstrap TOML file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let bootstrap = match load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load bootstrap configuration: {e}");
            std::process::exit(EXIT_CODE);
        }
    };

    if let Err(e) = logging::init_logging(&bootstrap.observability.log_level) {
        eprintln!("failed to initialize logging: {e}");
    }

    if bootstrap.observability.metrics_enabled {
        match bootstrap.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %bootstrap.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let transport = AmqpTransport::new(Duration::from_millis(bootstrap.broker.connect_timeout_ms));
    let mut options = StartupOptions::new(cli.config_server_url, &cli.profile, &cli.config_branch);
    options.bootstrap = bootstrap;

    let service = match lifecycle::start(options, Arc::new(transport)).await {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            std::process::exit(EXIT_CODE);
        }
    };

    if let Err(e) = service.serve().await {
        tracing::error!(error = %e, "Service stopped with error");
    }
    std::process::exit(EXIT_CODE);
}
