/// Query probe health checker

use super::{HealthChecker, HealthStatus};
use crate::core::ReplicaEntry;
use crate::error::QueryError;

/// Runs the connection's no-op round trip (`SELECT 1`)
///
/// The monitor wraps every probe in the replica's configured timeout, so this
/// checker only has to translate the outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingProbe;

impl PingProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl HealthChecker for PingProbe {
    async fn check_health(&self, replica: &ReplicaEntry) -> HealthStatus {
        tracing::trace!("Probing replica {}", replica.id());

        match replica.connection.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(QueryError::Timeout(_)) => HealthStatus::Timeout,
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }
}
