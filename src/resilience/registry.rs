//! Circuit breaker registry and breaker health reporting.
//!
//! One breaker per configured dependency. While registered, the registry
//! announces this instance on the discovery exchange (`UP`) and repeats the
//! announcement with current breaker health on every heartbeat.
//! Deregistration stops the heartbeat and publishes a final `DOWN` token,
//! so it has to run while the broker connection is still open.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::schema::BreakerConfig;
use crate::config::ConfigSnapshot;
use crate::messaging::{ExchangeType, MessagingClient, MessagingError};
use crate::resilience::circuit_breaker::{BreakerHealth, BreakerSpec, CallError, CircuitBreaker};

/// Instance availability announced on the discovery exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    Up,
    Down,
}

/// Discovery / breaker health message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryToken {
    pub state: InstanceState,
    pub address: String,
    pub service: String,
    pub instance_id: String,
    #[serde(default)]
    pub breakers: Vec<BreakerHealth>,
}

/// Where and how often health is reported.
#[derive(Debug, Clone)]
pub struct HealthReporting {
    pub exchange: String,
    pub heartbeat: Duration,
    pub service: String,
    pub address: String,
    pub instance_id: String,
}

/// Breakers by dependency name.
pub struct CircuitBreakerRegistry {
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
    reporting: HealthReporting,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(specs: Vec<BreakerSpec>, reporting: HealthReporting) -> Self {
        let breakers = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), Arc::new(CircuitBreaker::new(spec))))
            .collect();
        Self {
            breakers,
            reporting,
            heartbeat: Mutex::new(None),
        }
    }

    /// Build one breaker per dependency name. The policy comes from the
    /// bootstrap defaults, overridden by `hystrix.command.<name>.*` keys.
    pub fn from_config(
        dependencies: &[String],
        defaults: &BreakerConfig,
        snapshot: &ConfigSnapshot,
        reporting: HealthReporting,
    ) -> Self {
        let specs = dependencies
            .iter()
            .map(|name| BreakerSpec::from_defaults(name.clone(), defaults).with_overrides(snapshot))
            .collect();
        Self::new(specs, reporting)
    }

    /// Install breakers for `dependencies` and start health reporting.
    pub async fn configure_hystrix(
        dependencies: &[String],
        defaults: &BreakerConfig,
        snapshot: &ConfigSnapshot,
        reporting: HealthReporting,
        messaging: Arc<MessagingClient>,
    ) -> Result<Arc<Self>, MessagingError> {
        let registry = Arc::new(Self::from_config(dependencies, defaults, snapshot, reporting));
        for breaker in registry.breakers.values() {
            let spec = breaker.spec();
            tracing::info!(
                dependency = %spec.name,
                timeout_ms = spec.timeout.as_millis() as u64,
                error_percent_threshold = spec.error_percent_threshold,
                request_volume_threshold = spec.request_volume_threshold,
                sleep_window_ms = spec.sleep_window.as_millis() as u64,
                "Circuit breaker configured"
            );
        }
        registry.register(messaging).await?;
        Ok(registry)
    }

    /// Publish `UP` and start the heartbeat. Registering twice restarts it.
    pub async fn register(self: &Arc<Self>, messaging: Arc<MessagingClient>) -> Result<(), MessagingError> {
        self.stop_heartbeat().await;
        self.publish(&messaging, InstanceState::Up).await?;

        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.reporting.heartbeat);
            // The first tick completes immediately; UP was just published.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = registry.publish(&messaging, InstanceState::Up).await {
                    tracing::warn!(error = %e, "Breaker health heartbeat failed");
                }
            }
        });
        *self.lock_heartbeat() = Some(task);

        tracing::info!(
            exchange = %self.reporting.exchange,
            breakers = self.breakers.len(),
            "Breaker health reporting registered"
        );
        Ok(())
    }

    /// Stop reporting and publish a final `DOWN` token.
    pub async fn deregister(&self, messaging: &MessagingClient) -> Result<(), MessagingError> {
        if !self.stop_heartbeat().await {
            tracing::debug!("Breaker health reporting not registered");
            return Ok(());
        }
        self.publish(messaging, InstanceState::Down).await?;
        tracing::info!(exchange = %self.reporting.exchange, "Breaker health reporting deregistered");
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.lock_heartbeat().is_some()
    }

    /// Get the breaker guarding `dependency`.
    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(dependency).cloned()
    }

    /// Names of every guarded dependency.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.breakers.keys().map(String::as_str)
    }

    /// Run `call` through the breaker for `dependency`.
    pub async fn call<F, T, E>(&self, dependency: &str, call: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        match self.breakers.get(dependency) {
            Some(breaker) => breaker.call(call).await,
            None => Err(CallError::UnknownDependency(dependency.to_string())),
        }
    }

    /// Snapshot the health of every breaker.
    pub fn health(&self) -> Vec<BreakerHealth> {
        self.breakers.values().map(|b| b.health()).collect()
    }

    /// Build the discovery token this instance publishes in `state`.
    pub fn token(&self, state: InstanceState) -> DiscoveryToken {
        DiscoveryToken {
            state,
            address: self.reporting.address.clone(),
            service: self.reporting.service.clone(),
            instance_id: self.reporting.instance_id.clone(),
            breakers: self.health(),
        }
    }

    async fn publish(&self, messaging: &MessagingClient, state: InstanceState) -> Result<(), MessagingError> {
        messaging
            .publish_json(&self.reporting.exchange, ExchangeType::Fanout, &self.token(state))
            .await
    }

    /// Abort the heartbeat and wait for it to finish. Returns whether one ran.
    async fn stop_heartbeat(&self) -> bool {
        let task = self.lock_heartbeat().take();
        match task {
            Some(task) => {
                task.abort();
                let _ = task.await;
                true
            }
            None => false,
        }
    }

    fn lock_heartbeat(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.heartbeat.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("dependencies", &self.breakers.keys().collect::<Vec<_>>())
            .field("registered", &self.is_registered())
            .finish()
    }
}
