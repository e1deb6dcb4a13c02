//! Configuration refresh listener.
//!
//! Subscribes to the config event bus. Each refresh event addressed to this
//! application triggers a fresh fetch; the result replaces the active snapshot
//! in one atomic swap. A failed fetch keeps the current snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::loader::ConfigLoader;
use crate::config::snapshot::ConfigHolder;
use crate::messaging::{Delivery, ExchangeType, MessageHandler, MessagingClient, MessagingError};
use crate::observability::metrics;

const REFRESH_EVENT_TYPE: &str = "RefreshRemoteApplicationEvent";

/// Bus notification that configuration changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub origin_service: Option<String>,
    #[serde(default)]
    pub destination_service: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

impl RefreshEvent {
    pub fn is_refresh(&self) -> bool {
        self.kind == REFRESH_EVENT_TYPE
    }

    /// `**`, `app`, `app:**` and `app:<instance>` address `app`; no
    /// destination means everyone.
    pub fn addresses(&self, app_name: &str) -> bool {
        match self.destination_service.as_deref() {
            None => true,
            Some("**") => true,
            Some(dest) => {
                dest == app_name
                    || dest
                        .strip_prefix(app_name)
                        .map(|rest| rest.starts_with(':'))
                        .unwrap_or(false)
            }
        }
    }
}

/// Refresh handler for the config event bus.
pub struct ConfigChangeListener {
    loader: ConfigLoader,
    holder: ConfigHolder,
}

impl ConfigChangeListener {
    pub fn new(loader: ConfigLoader, holder: ConfigHolder) -> Self {
        Self { loader, holder }
    }

    /// Subscribe this listener to `exchange`.
    pub async fn start(
        self: Arc<Self>,
        messaging: &MessagingClient,
        exchange: &str,
    ) -> Result<(), MessagingError> {
        let consumer = self.loader.identity().app_name.clone();
        messaging
            .subscribe(exchange, ExchangeType::Topic, &consumer, self)
            .await?;
        tracing::info!(exchange = %exchange, "Config change listener started");
        Ok(())
    }

    async fn refresh(&self) {
        match self.loader.load().await {
            Ok(snapshot) => {
                let version = snapshot.version().map(str::to_string);
                let generation = self.holder.replace(snapshot);
                tracing::info!(
                    generation,
                    version = version.as_deref().unwrap_or("unknown"),
                    "Configuration refreshed"
                );
                metrics::record_config_refresh("applied");
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    generation = self.holder.current().generation(),
                    "Failed to refresh config. Keeping current configuration."
                );
                metrics::record_config_refresh("failed");
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ConfigChangeListener {
    async fn handle(&self, delivery: Delivery) {
        let event = match delivery.json::<RefreshEvent>() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(exchange = %delivery.exchange, error = %e, "Ignoring malformed refresh event");
                metrics::record_config_refresh("malformed");
                return;
            }
        };

        let app_name = &self.loader.identity().app_name;
        if !event.is_refresh() || !event.addresses(app_name) {
            tracing::debug!(
                kind = %event.kind,
                destination = event.destination_service.as_deref().unwrap_or("*"),
                "Ignoring event not addressed to this service"
            );
            metrics::record_config_refresh("ignored");
            return;
        }

        tracing::info!(
            origin = event.origin_service.as_deref().unwrap_or("unknown"),
            id = event.id.as_deref().unwrap_or(""),
            "Refresh event received"
        );
        self.refresh().await;
    }
}
