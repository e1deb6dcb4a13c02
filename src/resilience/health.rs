//! Cluster view of breaker health.
//!
//! Consumes discovery tokens from every instance (this one included) and
//! keeps the latest token per instance. `DOWN` removes the instance.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::messaging::{Delivery, MessageHandler};
use crate::resilience::circuit_breaker::CircuitState;
use crate::resilience::registry::{DiscoveryToken, InstanceState};

#[derive(Debug, Default)]
pub struct BreakerHealthHandler {
    peers: DashMap<String, DiscoveryToken>,
}

impl BreakerHealthHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest token of every live instance, ordered by instance id.
    pub fn peers(&self) -> Vec<DiscoveryToken> {
        let mut peers: Vec<_> = self.peers.iter().map(|r| r.value().clone()).collect();
        peers.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        peers
    }

    pub fn get(&self, instance_id: &str) -> Option<DiscoveryToken> {
        self.peers.get(instance_id).map(|r| r.value().clone())
    }

    /// `(instance_id, dependency)` pairs whose breaker is not closed.
    pub fn tripped(&self) -> Vec<(String, String)> {
        let mut tripped = Vec::new();
        for peer in self.peers.iter() {
            for breaker in &peer.breakers {
                if breaker.state != CircuitState::Closed {
                    tripped.push((peer.instance_id.clone(), breaker.name.clone()));
                }
            }
        }
        tripped.sort();
        tripped
    }

    pub fn apply(&self, token: DiscoveryToken) {
        match token.state {
            InstanceState::Up => {
                self.peers.insert(token.instance_id.clone(), token);
            }
            InstanceState::Down => {
                if self.peers.remove(&token.instance_id).is_some() {
                    tracing::info!(
                        instance = %token.instance_id,
                        service = %token.service,
                        "Instance deregistered"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for BreakerHealthHandler {
    async fn handle(&self, delivery: Delivery) {
        match delivery.json::<DiscoveryToken>() {
            Ok(token) => self.apply(token),
            Err(e) => {
                tracing::warn!(exchange = %delivery.exchange, error = %e, "Ignoring malformed discovery token");
            }
        }
    }
}
