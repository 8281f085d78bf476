/// Replica registry
///
/// Owns every registered replica together with its connection and runtime
/// state. The membership map is only locked long enough to insert, remove or
/// clone out an entry; per-replica state has its own lock so unrelated
/// replicas never contend.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::{Connector, Replica, ReplicaConfig, ReplicaConnection, ReplicaId, ReplicaState, ReplicaStatus};
use crate::core::connection::with_timeout;
use crate::error::{RouterError, RouterResult};
use crate::utils::generate_id;

/// A registered replica: static description, live connection and mutable state
pub struct ReplicaEntry {
    pub replica: Replica,
    pub connection: Arc<dyn ReplicaConnection>,
    state: Mutex<ReplicaState>,
    routed: AtomicU64,
}

impl ReplicaEntry {
    pub fn new(replica: Replica, connection: Arc<dyn ReplicaConnection>) -> Self {
        let state = ReplicaState::new(&replica.config);
        Self {
            replica,
            connection,
            state: Mutex::new(state),
            routed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &ReplicaId {
        &self.replica.id
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    /// Apply `f` to the state under this replica's lock
    pub fn update<T>(&self, f: impl FnOnce(&mut ReplicaState) -> T) -> T {
        let mut state = self.state.lock();
        f(&mut state)
    }

    pub fn state(&self) -> ReplicaState {
        self.state.lock().clone()
    }

    /// Count one query routed to this replica
    pub fn mark_routed(&self) {
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ReplicaStatus {
        let state = self.state();
        ReplicaStatus {
            id: self.replica.id.clone(),
            name: self.replica.config.name.clone(),
            tags: self.replica.config.tags.iter().cloned().collect(),
            healthy: state.healthy,
            manually_failed_over: state.manually_failed_over,
            last_health_check: state.last_health_check,
            last_probe_latency_ms: state.last_probe_latency_ms,
            average_latency_ms: state.average_latency_ms,
            query_count: state.query_count,
            error_count: state.error_count,
            weight: state.weight,
            priority: state.priority,
        }
    }

    /// Close the connection; failures are logged, never raised
    pub async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            warn!(replica_id = %self.replica.id, error = %e, "Failed to close replica connection");
        }
    }
}

/// Replica pool keyed by id
pub type ReplicaPool = Arc<RwLock<HashMap<ReplicaId, Arc<ReplicaEntry>>>>;

/// Registry for replica membership
pub struct ReplicaRegistry {
    replicas: ReplicaPool,
    connector: Arc<dyn Connector>,
}

impl ReplicaRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            replicas: Arc::new(RwLock::new(HashMap::new())),
            connector,
        }
    }

    /// Open the replica's connection and register it
    ///
    /// Nothing is stored when the connection cannot be opened. The new entry
    /// starts unhealthy until its first probe succeeds.
    pub async fn add(&self, config: ReplicaConfig) -> RouterResult<Arc<ReplicaEntry>> {
        config.validate()?;

        {
            let replicas = self.replicas.read().await;
            if replicas.values().any(|e| e.replica.config.name == config.name) {
                return Err(RouterError::invalid_replica(format!(
                    "replica name '{}' is already registered",
                    config.name
                )));
            }
        }

        let connection = with_timeout(config.timeout, self.connector.connect(&config))
            .await
            .map_err(|source| RouterError::Registration {
                name: config.name.clone(),
                source,
            })?;

        let replica = Replica {
            id: ReplicaId::from(generate_id("replica")),
            config,
        };
        let entry = Arc::new(ReplicaEntry::new(replica, connection));

        let mut replicas = self.replicas.write().await;
        if replicas.values().any(|e| e.replica.config.name == entry.replica.config.name) {
            drop(replicas);
            entry.close().await;
            return Err(RouterError::invalid_replica(format!(
                "replica name '{}' is already registered",
                entry.replica.config.name
            )));
        }
        replicas.insert(entry.id().clone(), Arc::clone(&entry));
        info!(replica_id = %entry.id(), name = %entry.replica.config.name, "Replica registered");

        Ok(entry)
    }

    /// Unregister and close a replica; unknown ids are ignored
    pub async fn remove(&self, replica_id: &ReplicaId) -> Option<Arc<ReplicaEntry>> {
        let removed = self.replicas.write().await.remove(replica_id);
        if let Some(entry) = &removed {
            entry.close().await;
        }
        removed
    }

    pub async fn get(&self, replica_id: &ReplicaId) -> Option<Arc<ReplicaEntry>> {
        self.replicas.read().await.get(replica_id).cloned()
    }

    /// Ids of replicas carrying `tag`, in id order
    pub async fn list_by_tag(&self, tag: &str) -> Vec<ReplicaId> {
        let replicas = self.replicas.read().await;
        let mut ids: Vec<ReplicaId> = replicas
            .values()
            .filter(|e| e.replica.has_tag(tag))
            .map(|e| e.id().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Look up an id by the replica's configured name
    pub async fn find_by_name(&self, name: &str) -> Option<ReplicaId> {
        let replicas = self.replicas.read().await;
        replicas
            .values()
            .find(|e| e.replica.config.name == name)
            .map(|e| e.id().clone())
    }

    /// Snapshot of every entry, in id order
    pub async fn entries(&self) -> Vec<Arc<ReplicaEntry>> {
        let replicas = self.replicas.read().await;
        let mut entries: Vec<Arc<ReplicaEntry>> = replicas.values().cloned().collect();
        entries.sort_by(|a, b| a.id().cmp(b.id()));
        entries
    }

    pub async fn healthy_entries(&self) -> Vec<Arc<ReplicaEntry>> {
        self.entries().await.into_iter().filter(|e| e.is_healthy()).collect()
    }

    pub async fn len(&self) -> usize {
        self.replicas.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.replicas.read().await.is_empty()
    }

    /// Remove every entry without closing connections, returning what was held
    pub async fn drain(&self) -> Vec<Arc<ReplicaEntry>> {
        let mut replicas = self.replicas.write().await;
        replicas.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mock::MockConnector;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_add_and_get() {
        let registry = ReplicaRegistry::new(MockConnector::new());
        let entry = registry
            .add(ReplicaConfig::new("replica-a", "mock://a").with_tag("analytics"))
            .await
            .unwrap();

        assert!(entry.id().as_str().starts_with("replica-"));
        assert!(!entry.is_healthy());
        assert_eq!(registry.len().await, 1);

        let fetched = registry.get(entry.id()).await.unwrap();
        assert_eq!(fetched.replica.config.name, "replica-a");
        assert_eq!(registry.find_by_name("replica-a").await, Some(entry.id().clone()));
    }

    #[tokio::test]
    async fn test_failed_open_is_never_stored() {
        let connector = MockConnector::new();
        connector.refuse("broken");
        let registry = ReplicaRegistry::new(connector);

        let result = registry.add(ReplicaConfig::new("broken", "mock://broken")).await;

        assert!(matches!(result, Err(RouterError::Registration { .. })));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let registry = ReplicaRegistry::new(MockConnector::new());
        let result = registry
            .add(ReplicaConfig::new("replica-a", "mock://a").with_weight(-1.0))
            .await;
        assert!(matches!(result, Err(RouterError::InvalidReplicaConfig { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = ReplicaRegistry::new(MockConnector::new());
        registry.add(ReplicaConfig::new("replica-a", "mock://a")).await.unwrap();
        let duplicate = registry.add(ReplicaConfig::new("replica-a", "mock://a2")).await;
        assert!(matches!(duplicate, Err(RouterError::InvalidReplicaConfig { .. })));
    }

    #[tokio::test]
    async fn test_remove_closes_and_is_idempotent() {
        let connector = MockConnector::new();
        let registry = ReplicaRegistry::new(connector.clone());
        let entry = registry.add(ReplicaConfig::new("replica-a", "mock://a")).await.unwrap();

        assert!(registry.remove(entry.id()).await.is_some());
        assert!(connector.connection("replica-a").closed.load(Ordering::SeqCst));
        assert!(registry.remove(entry.id()).await.is_none());
        assert!(registry.get(entry.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_swallows_close_failure() {
        let connector = MockConnector::new();
        let registry = ReplicaRegistry::new(connector.clone());
        let entry = registry.add(ReplicaConfig::new("replica-a", "mock://a")).await.unwrap();
        connector.connection("replica-a").set_close_fails(true);

        assert!(registry.remove(entry.id()).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_by_tag() {
        let registry = ReplicaRegistry::new(MockConnector::new());
        let a = registry
            .add(ReplicaConfig::new("a", "mock://a").with_tag("analytics"))
            .await
            .unwrap();
        registry.add(ReplicaConfig::new("b", "mock://b").with_tag("export")).await.unwrap();
        let c = registry
            .add(ReplicaConfig::new("c", "mock://c").with_tag("analytics").with_tag("export"))
            .await
            .unwrap();

        let mut expected = vec![a.id().clone(), c.id().clone()];
        expected.sort();
        assert_eq!(registry.list_by_tag("analytics").await, expected);
        assert!(registry.list_by_tag("background").await.is_empty());
    }
}
