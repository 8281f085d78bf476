/// Core abstractions shared by every router component
pub mod connection;
pub mod registry;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod mock;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::error::{RouterError, RouterResult};

pub use connection::{Connector, ReplicaConnection};
pub use registry::{ReplicaEntry, ReplicaRegistry};
pub use sqlite::SqliteConnector;

/// Opaque replica identifier, assigned at registration and never reused
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ReplicaId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ReplicaId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Static configuration of a read replica, supplied to `add_replica`
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaConfig {
    /// Human readable label used in logs and config files
    pub name: String,
    /// Connection target understood by the `Connector` (file path, DSN, ...)
    pub target: String,
    /// Relative share of unconstrained selection
    pub weight: f64,
    /// Higher values are preferred over lower ones
    pub priority: i32,
    /// Timeout applied to open, probe and every query attempt
    pub timeout: Duration,
    /// Attempts made on this replica before a query is reported failed
    pub max_retries: u32,
    /// Free-form tags such as "analytics", "export" or "background"
    pub tags: BTreeSet<String>,
}

impl ReplicaConfig {
    pub fn new<N: Into<String>, T: Into<String>>(name: N, target: T) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            weight: 1.0,
            priority: 0,
            timeout: Duration::from_secs(5),
            max_retries: 3,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Reject configurations the selection policy cannot work with
    pub fn validate(&self) -> RouterResult<()> {
        if self.name.trim().is_empty() {
            return Err(RouterError::invalid_replica("replica name cannot be empty"));
        }

        if self.target.trim().is_empty() {
            return Err(RouterError::invalid_replica(format!(
                "replica '{}' has an empty connection target",
                self.name
            )));
        }

        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(RouterError::invalid_replica(format!(
                "replica '{}' weight must be a positive number",
                self.name
            )));
        }

        if self.timeout.is_zero() {
            return Err(RouterError::invalid_replica(format!(
                "replica '{}' timeout must be greater than 0",
                self.name
            )));
        }

        Ok(())
    }
}

/// A registered read replica: identity plus immutable configuration
#[derive(Debug, Clone)]
pub struct Replica {
    pub id: ReplicaId,
    pub config: ReplicaConfig,
}

impl Replica {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.config.tags.contains(tag)
    }
}

/// Mutable runtime state of one replica
///
/// Health fields are written by the health monitor, counters by the query
/// executor. Every update goes through the owning entry's lock.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    pub healthy: bool,
    /// Set by a manual failover; probes cannot mark the replica healthy while set
    pub manually_failed_over: bool,
    pub last_health_check: Option<SystemTime>,
    pub last_probe_latency_ms: Option<f64>,
    pub average_latency_ms: f64,
    pub latency_samples: u64,
    pub query_count: u64,
    pub error_count: u64,
    pub weight: f64,
    pub priority: i32,
}

impl ReplicaState {
    pub fn new(config: &ReplicaConfig) -> Self {
        Self {
            healthy: false,
            manually_failed_over: false,
            last_health_check: None,
            last_probe_latency_ms: None,
            average_latency_ms: 0.0,
            latency_samples: 0,
            query_count: 0,
            error_count: 0,
            weight: config.weight,
            priority: config.priority,
        }
    }

    /// Record a successful query attempt and fold its latency into the running mean
    pub fn record_success(&mut self, latency_ms: f64) {
        self.query_count += 1;
        self.latency_samples += 1;
        let n = self.latency_samples as f64;
        self.average_latency_ms = (self.average_latency_ms * (n - 1.0) + latency_ms) / n;
    }

    /// Record a failed query attempt
    pub fn record_failure(&mut self) {
        self.query_count += 1;
        self.error_count += 1;
    }

    /// Apply a probe outcome, returning the new health value when it changed
    pub fn record_probe(&mut self, healthy: bool, latency_ms: Option<f64>) -> Option<bool> {
        self.last_health_check = Some(SystemTime::now());
        if let Some(latency) = latency_ms {
            self.last_probe_latency_ms = Some(latency);
        }

        let next = healthy && !self.manually_failed_over;
        self.set_healthy(next)
    }

    /// Set health directly, returning the new value when it changed
    pub fn set_healthy(&mut self, healthy: bool) -> Option<bool> {
        if self.healthy == healthy {
            return None;
        }
        self.healthy = healthy;
        Some(healthy)
    }
}

/// Read-only snapshot returned by `get_replica_status`
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub id: ReplicaId,
    pub name: String,
    pub tags: Vec<String>,
    pub healthy: bool,
    pub manually_failed_over: bool,
    pub last_health_check: Option<SystemTime>,
    pub last_probe_latency_ms: Option<f64>,
    pub average_latency_ms: f64,
    pub query_count: u64,
    pub error_count: u64,
    pub weight: f64,
    pub priority: i32,
}

/// Per-replica share of routed queries
#[derive(Debug, Clone, Serialize)]
pub struct QueryDistribution {
    pub replica_id: ReplicaId,
    pub name: String,
    pub count: u64,
    pub percentage: f64,
}

/// A single SQL value, used both for positional parameters and result cells
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One result row, columns in statement order
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Look up a cell by column name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|index| self.values.get(index))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_config_validation() {
        let config = ReplicaConfig::new("replica-a", "/tmp/a.db");
        assert!(config.validate().is_ok());

        let zero_weight = config.clone().with_weight(0.0);
        assert!(matches!(
            zero_weight.validate(),
            Err(RouterError::InvalidReplicaConfig { .. })
        ));

        let nan_weight = config.clone().with_weight(f64::NAN);
        assert!(nan_weight.validate().is_err());

        let zero_timeout = config.clone().with_timeout(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());

        let no_target = ReplicaConfig::new("replica-b", " ");
        assert!(no_target.validate().is_err());
    }

    #[test]
    fn test_running_average_latency() {
        let config = ReplicaConfig::new("replica-a", "/tmp/a.db");
        let mut state = ReplicaState::new(&config);

        state.record_success(10.0);
        assert_eq!(state.query_count, 1);
        assert_eq!(state.average_latency_ms, 10.0);

        state.record_success(20.0);
        assert_eq!(state.average_latency_ms, 15.0);

        state.record_success(30.0);
        assert_eq!(state.query_count, 3);
        assert!((state.average_latency_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failures_never_exceed_query_count() {
        let config = ReplicaConfig::new("replica-a", "/tmp/a.db");
        let mut state = ReplicaState::new(&config);

        state.record_failure();
        state.record_failure();
        state.record_success(4.0);

        assert_eq!(state.error_count, 2);
        assert_eq!(state.query_count, 3);
        assert!(state.error_count <= state.query_count);
        // failed attempts carry no latency sample
        assert_eq!(state.average_latency_ms, 4.0);
    }

    #[test]
    fn test_probe_transitions() {
        let config = ReplicaConfig::new("replica-a", "/tmp/a.db");
        let mut state = ReplicaState::new(&config);

        assert_eq!(state.record_probe(true, Some(2.0)), Some(true));
        assert_eq!(state.record_probe(true, Some(3.0)), None);
        assert_eq!(state.last_probe_latency_ms, Some(3.0));

        // failure keeps the last successful latency
        assert_eq!(state.record_probe(false, None), Some(false));
        assert_eq!(state.last_probe_latency_ms, Some(3.0));
        assert!(state.last_health_check.is_some());
    }

    #[test]
    fn test_manual_failover_pins_unhealthy() {
        let config = ReplicaConfig::new("replica-a", "/tmp/a.db");
        let mut state = ReplicaState::new(&config);
        state.record_probe(true, Some(1.0));

        state.manually_failed_over = true;
        assert_eq!(state.set_healthy(false), Some(false));
        assert_eq!(state.record_probe(true, Some(1.0)), None);
        assert!(!state.healthy);
    }

    #[test]
    fn test_row_lookup_and_json() {
        let row = Row::new(
            vec!["id".to_string(), "title".to_string()],
            vec![Value::Integer(7), Value::from("printer jam")],
        );

        assert_eq!(row.get("title"), Some(&Value::Text("printer jam".to_string())));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.len(), 2);

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"id":7,"title":"printer jam"}"#);
    }

    #[test]
    fn test_value_from_option() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3i64)), Value::Integer(3));
    }
}
