//! Replica Router - read replica query routing for SQLite-backed services
//!
//! Routes read-only queries across a pool of replicas by combining pattern
//! based routing rules, caller preferences and priority-then-weight
//! selection, while tracking replica health and per-replica statistics.
//!
//! Composition, top to bottom:
//! 1. `routing`: first matching rule contributes preferred replicas
//! 2. `balancer`: picks one replica by rule, preference or weighted draw
//! 3. `executor`: runs the query with bounded retries on that replica
//!
//! `health` keeps replica liveness current in the background and `core`
//! owns the registry and the connection seam.

pub mod balancer;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod routing;
pub mod utils;

use futures::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::{Candidate, SelectionAlgorithm, SelectionPolicy, WeightedRandom};
use crate::config::Config;
use crate::core::{
    Connector, QueryDistribution, ReplicaConfig, ReplicaEntry, ReplicaId, ReplicaRegistry,
    ReplicaStatus, Row, SqliteConnector, Value,
};
use crate::error::{RouterError, RouterResult};
use crate::events::{RouterEvent, RouterObserver, TracingObserver};
use crate::executor::{ExecutorConfig, QueryExecutor};
use crate::health::{HealthChecker, HealthMonitor, HealthStatus, PingProbe};
use crate::routing::{RegisteredRule, RoutingRule, RuleEngine, RuleId};

/// Time ranges longer than this are treated as heavy analytics
pub const LONG_RANGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub const ANALYTICS_TAG: &str = "analytics";
pub const EXPORT_TAG: &str = "export";
pub const BACKGROUND_TAG: &str = "background";

/// Router tuning
#[derive(Debug, Clone, PartialEq)]
pub struct RouterOptions {
    /// Interval of the periodic health sweep
    pub health_interval: Duration,
    pub executor: ExecutorConfig,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Per-call options for `execute_query`
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Replicas to try first, in order, when no routing rule applies
    pub preferred_replicas: Vec<ReplicaId>,
    /// Overrides the chosen replica's configured `max_retries`
    pub max_retries: Option<u32>,
    /// Abandon the query once this token is cancelled
    pub cancel: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn prefer(mut self, replica_id: ReplicaId) -> Self {
        self.preferred_replicas.push(replica_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Cost class of an analytics query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryComplexity {
    #[default]
    Simple,
    Moderate,
    Heavy,
}

/// Classification hints for `execute_analytics_query`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsHints {
    /// Span of data the query covers
    pub time_range: Option<Duration>,
    pub complexity: QueryComplexity,
}

/// Kind of report behind `execute_reporting_query`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Dashboard,
    Export,
    Scheduled,
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportType::Dashboard => write!(f, "dashboard"),
            ReportType::Export => write!(f, "export"),
            ReportType::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl FromStr for ReportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dashboard" => Ok(ReportType::Dashboard),
            "export" => Ok(ReportType::Export),
            "scheduled" => Ok(ReportType::Scheduled),
            other => Err(format!(
                "unknown report type '{}', expected dashboard, export or scheduled",
                other
            )),
        }
    }
}

/// Builder for `ReplicaRouter`
pub struct ReplicaRouterBuilder {
    connector: Arc<dyn Connector>,
    checker: Option<Box<dyn HealthChecker>>,
    observer: Option<Arc<dyn RouterObserver>>,
    algorithm: Option<Box<dyn SelectionAlgorithm>>,
    options: RouterOptions,
}

impl ReplicaRouterBuilder {
    pub fn with_checker(mut self, checker: Box<dyn HealthChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RouterObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_algorithm(mut self, algorithm: Box<dyn SelectionAlgorithm>) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn with_options(mut self, options: RouterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> ReplicaRouter {
        let observer = self.observer.unwrap_or_else(|| Arc::new(TracingObserver));
        let checker = self.checker.unwrap_or_else(|| Box::new(PingProbe::new()));
        let algorithm = self.algorithm.unwrap_or_else(|| Box::new(WeightedRandom::new()));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let registry = Arc::new(ReplicaRegistry::new(self.connector));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            checker,
            Arc::clone(&observer),
        ));
        let executor = QueryExecutor::new(
            Arc::clone(&monitor),
            Arc::clone(&observer),
            self.options.executor.clone(),
            Arc::clone(&shutting_down),
        );

        ReplicaRouter {
            registry,
            monitor,
            rules: RuleEngine::new(),
            policy: SelectionPolicy::new(algorithm),
            executor,
            observer,
            options: self.options,
            shutting_down,
        }
    }
}

/// Read replica query router
///
/// Constructed explicitly by the owner of the service graph and shared by
/// reference; every method is safe to call concurrently.
pub struct ReplicaRouter {
    registry: Arc<ReplicaRegistry>,
    monitor: Arc<HealthMonitor>,
    rules: RuleEngine,
    policy: SelectionPolicy,
    executor: QueryExecutor,
    observer: Arc<dyn RouterObserver>,
    options: RouterOptions,
    shutting_down: Arc<AtomicBool>,
}

impl ReplicaRouter {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::builder(connector).build()
    }

    pub fn builder(connector: Arc<dyn Connector>) -> ReplicaRouterBuilder {
        ReplicaRouterBuilder {
            connector,
            checker: None,
            observer: None,
            algorithm: None,
            options: RouterOptions::default(),
        }
    }

    /// Router over SQLite replica files
    pub fn sqlite(options: RouterOptions) -> Self {
        Self::builder(Arc::new(SqliteConnector::new()))
            .with_options(options)
            .build()
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> RouterResult<()> {
        if self.is_shutdown() {
            return Err(RouterError::ManagerShutdown);
        }
        Ok(())
    }

    /// Register a replica and probe it once
    ///
    /// The replica is selectable as soon as that first probe succeeds.
    pub async fn add_replica(&self, config: ReplicaConfig) -> RouterResult<ReplicaId> {
        self.ensure_running()?;

        let entry = self.registry.add(config).await?;
        if self.is_shutdown() {
            self.registry.remove(entry.id()).await;
            return Err(RouterError::ManagerShutdown);
        }

        self.observer.on_event(&RouterEvent::ReplicaAdded {
            replica_id: entry.id().clone(),
            name: entry.replica.config.name.clone(),
        });
        self.monitor.check_replica(&entry).await;

        Ok(entry.id().clone())
    }

    /// Unregister and close a replica; unknown ids are a no-op
    pub async fn remove_replica(&self, replica_id: &ReplicaId) -> RouterResult<()> {
        self.ensure_running()?;

        if self.registry.remove(replica_id).await.is_some() {
            self.observer.on_event(&RouterEvent::ReplicaRemoved {
                replica_id: replica_id.clone(),
            });
        }
        Ok(())
    }

    /// Look up a replica id by its configured name
    pub async fn replica_id(&self, name: &str) -> Option<ReplicaId> {
        self.registry.find_by_name(name).await
    }

    /// Route and run a read query
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        options: QueryOptions,
    ) -> RouterResult<Vec<Row>> {
        self.route(
            sql,
            params,
            &options.preferred_replicas,
            options.max_retries,
            options.cancel.as_ref(),
        )
        .await
    }

    /// Run an analytics query, steering heavy work to `analytics` replicas
    pub async fn execute_analytics_query(
        &self,
        sql: &str,
        params: &[Value],
        hints: AnalyticsHints,
    ) -> RouterResult<Vec<Row>> {
        self.ensure_running()?;

        let long_range = hints.time_range.map_or(false, |range| range > LONG_RANGE);
        let healthy = self.registry.healthy_entries().await;

        let preferred = match hints.complexity {
            QueryComplexity::Heavy => least_loaded(&healthy, Some(ANALYTICS_TAG)),
            _ if long_range => least_loaded(&healthy, Some(ANALYTICS_TAG)),
            QueryComplexity::Moderate => fastest(&healthy, ANALYTICS_TAG),
            QueryComplexity::Simple => Vec::new(),
        };
        debug!(complexity = ?hints.complexity, long_range, preferred = preferred.len(), "Analytics preference");

        self.route(sql, params, &preferred, None, None).await
    }

    /// Run a reporting query with a preference derived from the report type
    pub async fn execute_reporting_query(
        &self,
        sql: &str,
        params: &[Value],
        report: ReportType,
    ) -> RouterResult<Vec<Row>> {
        self.ensure_running()?;

        let healthy = self.registry.healthy_entries().await;
        let preferred = match report {
            ReportType::Dashboard => least_loaded(&healthy, None),
            ReportType::Export => least_loaded(&healthy, Some(EXPORT_TAG)),
            ReportType::Scheduled => least_loaded(&healthy, Some(BACKGROUND_TAG)),
        };
        debug!(%report, preferred = preferred.len(), "Reporting preference");

        self.route(sql, params, &preferred, None, None).await
    }

    async fn route(
        &self,
        sql: &str,
        params: &[Value],
        preferred: &[ReplicaId],
        max_retries: Option<u32>,
        cancel: Option<&CancellationToken>,
    ) -> RouterResult<Vec<Row>> {
        self.ensure_running()?;

        let mut tried: HashSet<ReplicaId> = HashSet::new();
        let mut last_error = None;

        loop {
            let entries: Vec<Arc<ReplicaEntry>> = self
                .registry
                .entries()
                .await
                .into_iter()
                .filter(|entry| !tried.contains(entry.id()))
                .collect();
            let candidates: Vec<Candidate> = entries.iter().map(|e| Candidate::from_entry(e)).collect();

            let rule = self
                .rules
                .evaluate(sql, |id| candidates.iter().any(|c| &c.id == id && c.healthy));
            let selection = match self.policy.select(rule.as_ref(), preferred, &candidates) {
                Some(selection) => selection,
                None => return Err(last_error.unwrap_or(RouterError::NoHealthyReplica)),
            };
            let entry = entries
                .iter()
                .find(|e| e.id() == &selection.replica_id)
                .ok_or(RouterError::NoHealthyReplica)?;
            debug!(replica_id = %selection.replica_id, reason = %selection.reason, "Replica selected");

            let retries = max_retries.unwrap_or(entry.replica.config.max_retries);
            match self.executor.execute(entry, sql, params, retries, cancel).await {
                Ok(rows) => return Ok(rows),
                Err(e @ (RouterError::Execution { .. } | RouterError::ReplicaUnavailable { .. }))
                    if self.executor.config().reselect_on_failure =>
                {
                    warn!(replica_id = %entry.id(), error = %e, "Replica failed, selecting another");
                    tried.insert(entry.id().clone());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Append a routing rule; every referenced replica must be registered
    pub async fn add_routing_rule(&self, rule: RoutingRule) -> RouterResult<RuleId> {
        self.ensure_running()?;
        self.check_rule(&rule).await?;

        let rule_id = self.rules.add_rule(rule);
        info!(rule_id, "Routing rule added");
        Ok(rule_id)
    }

    /// Remove a routing rule; false when no such rule exists
    pub fn remove_routing_rule(&self, rule_id: RuleId) -> RouterResult<bool> {
        self.ensure_running()?;
        Ok(self.rules.remove_rule(rule_id))
    }

    /// Swap the whole rule list at once
    pub async fn replace_routing_rules(&self, rules: Vec<RoutingRule>) -> RouterResult<Vec<RuleId>> {
        self.ensure_running()?;
        for rule in &rules {
            self.check_rule(rule).await?;
        }

        let ids = self.rules.replace_rules(rules);
        info!(rules = ids.len(), "Routing rules replaced");
        Ok(ids)
    }

    pub fn routing_rules(&self) -> Vec<RegisteredRule> {
        self.rules.rules()
    }

    async fn check_rule(&self, rule: &RoutingRule) -> RouterResult<()> {
        if rule.preferred.is_empty() {
            return Err(RouterError::invalid_rule(format!(
                "rule '{}' names no replicas",
                rule.pattern()
            )));
        }
        for replica_id in &rule.preferred {
            if self.registry.get(replica_id).await.is_none() {
                return Err(RouterError::invalid_rule(format!(
                    "rule '{}' references unknown replica {}",
                    rule.pattern(),
                    replica_id
                )));
            }
        }
        Ok(())
    }

    /// Snapshot of every replica's status, in id order
    pub async fn get_replica_status(&self) -> Vec<ReplicaStatus> {
        self.registry
            .entries()
            .await
            .iter()
            .map(|entry| entry.status())
            .collect()
    }

    /// Routed query count and share per replica
    pub async fn get_query_distribution(&self) -> Vec<QueryDistribution> {
        let entries = self.registry.entries().await;
        let total: u64 = entries.iter().map(|e| e.routed()).sum();

        entries
            .iter()
            .map(|entry| QueryDistribution {
                replica_id: entry.id().clone(),
                name: entry.replica.config.name.clone(),
                count: entry.routed(),
                percentage: utils::percentage(entry.routed(), total),
            })
            .collect()
    }

    /// Force a replica out of selection until it is restored
    pub async fn failover_replica(&self, replica_id: &ReplicaId) -> RouterResult<()> {
        let entry = self.entry(replica_id).await?;
        let changed = entry.update(|state| {
            state.manually_failed_over = true;
            state.set_healthy(false)
        });

        self.observer.on_event(&RouterEvent::Failover {
            replica_id: replica_id.clone(),
        });
        self.report_transition(replica_id, changed);
        Ok(())
    }

    /// Clear a manual failover and mark the replica healthy
    pub async fn restore_replica(&self, replica_id: &ReplicaId) -> RouterResult<()> {
        let entry = self.entry(replica_id).await?;
        let changed = entry.update(|state| {
            state.manually_failed_over = false;
            state.set_healthy(true)
        });

        self.observer.on_event(&RouterEvent::Restored {
            replica_id: replica_id.clone(),
        });
        self.report_transition(replica_id, changed);
        Ok(())
    }

    fn report_transition(&self, replica_id: &ReplicaId, changed: Option<bool>) {
        if let Some(healthy) = changed {
            self.observer.on_event(&RouterEvent::HealthChanged {
                replica_id: replica_id.clone(),
                healthy,
            });
        }
    }

    async fn entry(&self, replica_id: &ReplicaId) -> RouterResult<Arc<ReplicaEntry>> {
        self.ensure_running()?;
        self.registry
            .get(replica_id)
            .await
            .ok_or_else(|| RouterError::UnknownReplica {
                replica_id: replica_id.clone(),
            })
    }

    /// Probe every replica now
    pub async fn check_health(&self) -> RouterResult<Vec<(ReplicaId, HealthStatus)>> {
        self.ensure_running()?;
        Ok(self.monitor.check_all().await)
    }

    /// Start the periodic health sweep at the configured interval
    ///
    /// A zero interval is rejected and leaves no sweep running.
    pub fn start_health_checks(&self) -> RouterResult<()> {
        self.ensure_running()?;
        self.monitor.start_periodic(self.options.health_interval)
    }

    pub fn stop_health_checks(&self) {
        self.monitor.stop_periodic();
    }

    /// Register every replica and rule from a config file
    ///
    /// Rules reference replicas by name; names are resolved to the ids just
    /// assigned.
    pub async fn apply_config(&self, config: &Config) -> RouterResult<Vec<ReplicaId>> {
        let mut ids = Vec::with_capacity(config.replicas.len());
        for replica in config.replica_configs() {
            ids.push(self.add_replica(replica).await?);
        }

        for settings in &config.rules {
            let mut preferred = Vec::with_capacity(settings.replicas.len());
            for name in &settings.replicas {
                let id = self.replica_id(name).await.ok_or_else(|| {
                    RouterError::invalid_rule(format!("rule references unknown replica {}", name))
                })?;
                preferred.push(id);
            }

            let mut rule = RoutingRule::new(&settings.pattern, preferred)?
                .with_fallback_to_primary(settings.fallback_to_primary);
            if let Some(ttl) = settings.cache_ttl_sec {
                rule = rule.with_cache_ttl(Duration::from_secs(ttl));
            }
            self.add_routing_rule(rule).await?;
        }

        Ok(ids)
    }

    /// Stop health checks, close every replica and clear all state
    ///
    /// New calls fail with `ManagerShutdown` from the moment this starts;
    /// calls already running finish or time out on their own.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down replica router");

        self.monitor.stop_periodic();

        let entries = self.registry.drain().await;
        join_all(entries.iter().map(|entry| entry.close())).await;
        self.rules.clear();

        self.observer.on_event(&RouterEvent::Shutdown);
        info!(closed = entries.len(), "Replica router shut down");
    }
}

/// A router dropped without `shutdown` stops its sweeps and closes its
/// replicas in the background when a runtime is still available.
impl Drop for ReplicaRouter {
    fn drop(&mut self) {
        self.monitor.stop_periodic();
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = Arc::clone(&self.registry);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let entries = registry.drain().await;
                    join_all(entries.iter().map(|entry| entry.close())).await;
                    debug!(closed = entries.len(), "Closed replicas of dropped router");
                });
            }
            Err(_) => warn!("Replica router dropped outside a runtime; connections close on drop"),
        }
    }
}

/// Healthy replicas, optionally restricted to a tag, least loaded first
fn least_loaded(entries: &[Arc<ReplicaEntry>], tag: Option<&str>) -> Vec<ReplicaId> {
    let mut ranked: Vec<(u64, ReplicaId)> = entries
        .iter()
        .filter(|e| tag.map_or(true, |t| e.replica.has_tag(t)))
        .map(|e| (e.state().query_count, e.id().clone()))
        .collect();
    ranked.sort();
    ranked.into_iter().map(|(_, id)| id).collect()
}

/// Healthy replicas carrying `tag`, lowest average latency first
fn fastest(entries: &[Arc<ReplicaEntry>], tag: &str) -> Vec<ReplicaId> {
    let mut ranked: Vec<(f64, ReplicaId)> = entries
        .iter()
        .filter(|e| e.replica.has_tag(tag))
        .map(|e| (e.state().average_latency_ms, e.id().clone()))
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    ranked.into_iter().map(|(_, id)| id).collect()
}
