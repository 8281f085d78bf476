/// Router events for observability
///
/// Events are advisory. The router reports them to an injected
/// `RouterObserver`; the default observer turns them into structured
/// `tracing` records so no telemetry backend is baked in.
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::ReplicaId;

/// Something observable happened inside the router
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    ReplicaAdded { replica_id: ReplicaId, name: String },
    ReplicaRemoved { replica_id: ReplicaId },
    HealthChanged { replica_id: ReplicaId, healthy: bool },
    QueryExecuted { replica_id: ReplicaId, latency: Duration, attempts: u32 },
    QueryFailed { replica_id: ReplicaId, attempt: u32, error: String },
    Failover { replica_id: ReplicaId },
    Restored { replica_id: ReplicaId },
    Shutdown,
}

/// Receives router events; must be cheap and must not block
pub trait RouterObserver: Send + Sync {
    fn on_event(&self, event: &RouterEvent);
}

/// Default observer writing events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RouterObserver for TracingObserver {
    fn on_event(&self, event: &RouterEvent) {
        match event {
            RouterEvent::ReplicaAdded { replica_id, name } => {
                info!(%replica_id, %name, "Replica added");
            }
            RouterEvent::ReplicaRemoved { replica_id } => {
                info!(%replica_id, "Replica removed");
            }
            RouterEvent::HealthChanged { replica_id, healthy: true } => {
                info!(%replica_id, "Replica is healthy");
            }
            RouterEvent::HealthChanged { replica_id, healthy: false } => {
                warn!(%replica_id, "Replica is unhealthy");
            }
            RouterEvent::QueryExecuted { replica_id, latency, attempts } => {
                debug!(%replica_id, latency_ms = latency.as_millis() as u64, attempts, "Query executed");
            }
            RouterEvent::QueryFailed { replica_id, attempt, error } => {
                warn!(%replica_id, attempt, %error, "Query attempt failed");
            }
            RouterEvent::Failover { replica_id } => {
                warn!(%replica_id, "Replica manually failed over");
            }
            RouterEvent::Restored { replica_id } => {
                info!(%replica_id, "Replica manually restored");
            }
            RouterEvent::Shutdown => {
                info!("Replica router shut down");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// Observer that keeps every event for later assertions
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<RouterEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<RouterEvent> {
            self.events.lock().clone()
        }
    }

    impl RouterObserver for RecordingObserver {
        fn on_event(&self, event: &RouterEvent) {
            self.events.lock().push(event.clone());
        }
    }
}
