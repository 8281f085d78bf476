/// Replica connection seam
///
/// The router never manages pooling internals: every registered replica is
/// handed a ready-to-use `ReplicaConnection` produced by a `Connector`. Every
/// blocking operation is bounded by the replica's configured timeout, and a
/// timeout is reported like any other failure.
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::core::{ReplicaConfig, Row, Value};
use crate::error::QueryError;

/// Query used by health probes
pub const PROBE_QUERY: &str = "SELECT 1";

/// Read-only query handle for a single replica
#[async_trait]
pub trait ReplicaConnection: Send + Sync {
    /// Run a read query with positional parameters
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, QueryError>;

    /// Minimal no-op round trip used by the health monitor
    async fn ping(&self) -> Result<(), QueryError> {
        self.query(PROBE_QUERY, &[]).await.map(|_| ())
    }

    /// Release the underlying connection
    async fn close(&self) -> Result<(), QueryError>;
}

/// Opens replica connections with read-only, read-optimized settings
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ReplicaConfig) -> Result<Arc<dyn ReplicaConnection>, QueryError>;
}

/// Run `operation`, mapping an elapsed `limit` to `QueryError::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> Result<T, QueryError>
where
    F: Future<Output = Result<T, QueryError>>,
{
    match timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout(limit)),
    }
}
