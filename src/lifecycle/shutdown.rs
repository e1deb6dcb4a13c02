//! Shutdown coordination.
//!
//! `Shutdown` is the broadcast every long-running task listens on.
//! `ShutdownCoordinator` owns the one-shot cleanup sequence:
//!
//! ```text
//! Running ──initiate──▶ Draining ──cleanup done──▶ Terminated
//!            (CAS)
//! cleanup: broadcast stop → deregister breakers → close messaging → close storage
//! ```
//!
//! Every cleanup step is bounded by the step timeout; a failed or timed-out
//! step is logged and the sequence moves on.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::messaging::MessagingClient;
use crate::observability::metrics;
use crate::resilience::CircuitBreakerRegistry;
use crate::storage::StorageClient;

/// Process exit status after a graceful shutdown.
pub const EXIT_CODE: i32 = 1;

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to install signal handler: {0}")]
    SignalSetup(String),
}

/// Stop broadcast for background tasks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Number of tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Application,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "SIGINT"),
            ShutdownReason::Terminate => write!(f, "SIGTERM"),
            ShutdownReason::Application => write!(f, "application"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    Draining = 1,
    Terminated = 2,
}

impl ShutdownState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ShutdownState::Running,
            1 => ShutdownState::Draining,
            _ => ShutdownState::Terminated,
        }
    }
}

struct Inner {
    state: AtomicU8,
    shutdown: Shutdown,
    registry: Arc<CircuitBreakerRegistry>,
    messaging: Arc<MessagingClient>,
    storage: Arc<StorageClient>,
    step_timeout: Duration,
    terminated: watch::Sender<bool>,
}

/// Runs the ordered cleanup at most once.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new(
        shutdown: Shutdown,
        registry: Arc<CircuitBreakerRegistry>,
        messaging: Arc<MessagingClient>,
        storage: Arc<StorageClient>,
        step_timeout: Duration,
    ) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(ShutdownState::Running as u8),
                shutdown,
                registry,
                messaging,
                storage,
                step_timeout,
                terminated,
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    /// Run the cleanup sequence. Returns `false` without doing anything if a
    /// sequence already started.
    pub async fn initiate(&self, reason: ShutdownReason) -> bool {
        let won = self
            .inner
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !won {
            tracing::info!(reason = %reason, state = ?self.state(), "Shutdown already in progress, ignoring");
            return false;
        }

        tracing::info!(reason = %reason, "Shutting down");
        self.inner.shutdown.trigger();

        let inner = &self.inner;
        self.step("deregister_breakers", inner.registry.deregister(&inner.messaging))
            .await;
        self.step("close_messaging", inner.messaging.close()).await;
        self.step("close_storage", async { inner.storage.close() }).await;

        inner
            .state
            .store(ShutdownState::Terminated as u8, Ordering::Release);
        inner.terminated.send_replace(true);
        tracing::info!(exit_code = EXIT_CODE, "Shutdown complete");
        true
    }

    /// Resolve once the cleanup sequence has finished.
    pub async fn wait_terminated(&self) {
        let mut rx = self.inner.terminated.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn step<F, E>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        match tokio::time::timeout(self.inner.step_timeout, fut).await {
            Ok(Ok(())) => {
                tracing::info!(step = name, "Shutdown step completed");
                metrics::record_shutdown_step(name, "ok");
            }
            Ok(Err(e)) => {
                tracing::error!(step = name, error = %e, "Shutdown step failed, continuing");
                metrics::record_shutdown_step(name, "failed");
            }
            Err(_) => {
                tracing::error!(
                    step = name,
                    timeout_ms = self.inner.step_timeout.as_millis() as u64,
                    "Shutdown step timed out, continuing"
                );
                metrics::record_shutdown_step(name, "timeout");
            }
        }
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("step_timeout", &self.inner.step_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::BreakerConfig;
    use crate::config::{ConfigSnapshot, ServiceIdentity};
    use crate::messaging::{ConnectOptions, LocalBroker};
    use crate::resilience::HealthReporting;

    async fn coordinator(dir: &std::path::Path) -> (ShutdownCoordinator, Arc<MessagingClient>, Arc<StorageClient>) {
        let broker = LocalBroker::new();
        let messaging = Arc::new(MessagingClient::new(Arc::new(broker), ConnectOptions::default()));
        messaging.connect_to_broker("memory://broker").await.unwrap();
        let storage = Arc::new(StorageClient::open(dir.join("accounts.db")).unwrap());
        let snapshot = ConfigSnapshot::new(ServiceIdentity::new("accountservice", "", ""), None, Default::default());
        let registry = CircuitBreakerRegistry::configure_hystrix(
            &["quotes-service".to_string()],
            &BreakerConfig::default(),
            &snapshot,
            HealthReporting {
                exchange: "discovery".into(),
                heartbeat: Duration::from_secs(60),
                service: "accountservice".into(),
                address: "127.0.0.1:6767".into(),
                instance_id: "i-1".into(),
            },
            messaging.clone(),
        )
        .await
        .unwrap();

        let coordinator = ShutdownCoordinator::new(
            Shutdown::new(),
            registry,
            messaging.clone(),
            storage.clone(),
            Duration::from_secs(1),
        );
        (coordinator, messaging, storage)
    }

    #[test]
    fn test_shutdown_creation() {
        let shutdown = Shutdown::new();
        let _rx = shutdown.subscribe();
        assert_eq!(shutdown.receiver_count(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, messaging, storage) = coordinator(dir.path()).await;
        let mut stop = coordinator.shutdown().subscribe();

        let (a, b, c) = tokio::join!(
            coordinator.initiate(ShutdownReason::Interrupt),
            coordinator.initiate(ShutdownReason::Terminate),
            coordinator.initiate(ShutdownReason::Interrupt),
        );
        assert_eq!([a, b, c].iter().filter(|won| **won).count(), 1);

        coordinator.wait_terminated().await;
        assert_eq!(coordinator.state(), ShutdownState::Terminated);
        assert!(stop.try_recv().is_ok());
        assert!(!messaging.is_connected());
        assert!(storage.is_closed());

        assert!(!coordinator.initiate(ShutdownReason::Terminate).await);
    }

    #[tokio::test]
    async fn test_timed_out_step_does_not_stop_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _, storage) = coordinator(dir.path()).await;

        let slow = std::future::pending::<Result<(), String>>();
        let started = tokio::time::Instant::now();
        coordinator.step("slow", slow).await;
        assert!(started.elapsed() >= Duration::from_secs(1));

        coordinator.initiate(ShutdownReason::Application).await;
        assert!(storage.is_closed());
    }
}
