/// Health monitoring for read replicas
pub mod probe;

use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::core::{ReplicaEntry, ReplicaId, ReplicaRegistry};
use crate::error::{RouterError, RouterResult};
use crate::events::{RouterEvent, RouterObserver};
use crate::utils::duration_ms;

pub use probe::PingProbe;

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy replica
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait::async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe a replica; the caller applies the replica's timeout
    async fn check_health(&self, replica: &ReplicaEntry) -> HealthStatus;
}

struct PeriodicTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Probes replicas and records liveness and latency
///
/// Probes never hold a replica's state lock; the lock is taken only to write
/// the result. Periodic sweeps probe all replicas concurrently so one slow
/// replica never delays another.
pub struct HealthMonitor {
    registry: Arc<ReplicaRegistry>,
    checker: Box<dyn HealthChecker>,
    observer: Arc<dyn RouterObserver>,
    periodic: Mutex<Option<PeriodicTask>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ReplicaRegistry>,
        checker: Box<dyn HealthChecker>,
        observer: Arc<dyn RouterObserver>,
    ) -> Self {
        Self {
            registry,
            checker,
            observer,
            periodic: Mutex::new(None),
        }
    }

    /// Probe one replica with its configured timeout and record the result
    pub async fn check_replica(&self, replica: &ReplicaEntry) -> HealthStatus {
        let limit = replica.replica.config.timeout;
        let started = Instant::now();

        let status = match timeout(limit, self.checker.check_health(replica)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };
        let latency = status.is_healthy().then(|| duration_ms(started.elapsed()));

        let changed = replica.update(|state| state.record_probe(status.is_healthy(), latency));

        match &status {
            HealthStatus::Healthy => {
                tracing::debug!(replica_id = %replica.id(), latency_ms = latency, "Replica probe succeeded");
            }
            HealthStatus::Unhealthy { reason } => {
                tracing::warn!(replica_id = %replica.id(), %reason, "Replica probe failed");
            }
            HealthStatus::Timeout => {
                tracing::warn!(replica_id = %replica.id(), timeout_ms = limit.as_millis() as u64, "Replica probe timed out");
            }
        }

        if let Some(healthy) = changed {
            self.observer.on_event(&RouterEvent::HealthChanged {
                replica_id: replica.id().clone(),
                healthy,
            });
        }

        status
    }

    /// Probe a replica by id; unknown replicas report unhealthy
    pub async fn check_one(&self, replica_id: &ReplicaId) -> bool {
        match self.registry.get(replica_id).await {
            Some(entry) => {
                self.check_replica(&entry).await;
                entry.is_healthy()
            }
            None => false,
        }
    }

    /// Probe every registered replica concurrently
    pub async fn check_all(&self) -> Vec<(ReplicaId, HealthStatus)> {
        let entries = self.registry.entries().await;
        let probes = entries.iter().map(|entry| async move {
            let status = self.check_replica(entry).await;
            (entry.id().clone(), status)
        });
        join_all(probes).await
    }

    /// Re-check a replica out of band without making the caller wait
    pub fn spawn_recheck(self: &Arc<Self>, replica: Arc<ReplicaEntry>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.check_replica(&replica).await;
        });
    }

    /// Start periodic sweeps, replacing any sweep already running
    ///
    /// The sweep task only holds a weak reference to the monitor and ends on
    /// its own once the monitor is dropped.
    pub fn start_periodic(self: &Arc<Self>, interval: Duration) -> RouterResult<()> {
        if interval.is_zero() {
            return Err(RouterError::Config(ConfigError::ValidationError(
                "health check interval must be greater than 0".to_string(),
            )));
        }
        self.stop_periodic();

        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let monitor: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick fires immediately; replicas were probed when added
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else {
                            tracing::debug!("Health monitor dropped, ending sweeps");
                            break;
                        };
                        let results = monitor.check_all().await;
                        let healthy = results.iter().filter(|(_, s)| s.is_healthy()).count();
                        tracing::debug!(healthy, total = results.len(), "Health sweep finished");
                    }
                }
            }
        });

        *self.periodic.lock() = Some(PeriodicTask { cancel, handle });
        tracing::info!(interval_ms = interval.as_millis() as u64, "Periodic health checks started");
        Ok(())
    }

    /// Stop periodic sweeps; safe to call any number of times
    pub fn stop_periodic(&self) {
        if let Some(task) = self.periodic.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
            tracing::info!("Periodic health checks stopped");
        }
    }

    pub fn is_periodic_running(&self) -> bool {
        self.periodic
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop_periodic();
    }
}
