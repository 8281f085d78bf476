/// Query execution against a chosen replica
///
/// Attempts are bounded per call and stay on the replica that was selected.
/// Every attempt is checked against the replica's health first, timed, and
/// bounded by the replica's timeout. Stats are written under the replica's
/// own lock.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::connection::with_timeout;
use crate::core::{ReplicaEntry, Row, Value};
use crate::error::{QueryError, RouterError, RouterResult};
use crate::events::{RouterEvent, RouterObserver};
use crate::health::HealthMonitor;
use crate::utils::duration_ms;

/// Executor tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Pause before attempt `n + 1` is `retry_backoff * n`
    pub retry_backoff: Duration,
    /// Re-run selection on another replica once one is exhausted
    pub reselect_on_failure: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(10),
            reselect_on_failure: false,
        }
    }
}

pub struct QueryExecutor {
    monitor: Arc<HealthMonitor>,
    observer: Arc<dyn RouterObserver>,
    config: ExecutorConfig,
    shutting_down: Arc<AtomicBool>,
}

impl QueryExecutor {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        observer: Arc<dyn RouterObserver>,
        config: ExecutorConfig,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            monitor,
            observer,
            config,
            shutting_down,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `sql` on `replica`, making up to `max_retries` attempts (at least one)
    ///
    /// Fails fast with `ReplicaUnavailable` when the replica is not healthy at
    /// the start of an attempt. When every attempt fails the replica is
    /// re-probed in the background and the last failure is returned wrapped in
    /// `Execution`.
    pub async fn execute(
        &self,
        replica: &Arc<ReplicaEntry>,
        sql: &str,
        params: &[Value],
        max_retries: u32,
        cancel: Option<&CancellationToken>,
    ) -> RouterResult<Vec<Row>> {
        let attempts = max_retries.max(1);
        let timeout = replica.replica.config.timeout;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(RouterError::ManagerShutdown);
            }
            if !replica.is_healthy() {
                return Err(RouterError::ReplicaUnavailable {
                    replica_id: replica.id().clone(),
                });
            }

            let started = Instant::now();
            let run = with_timeout(timeout, replica.connection.query(sql, params));
            let outcome = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(RouterError::Cancelled),
                    result = run => result,
                },
                None => run.await,
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(rows) => {
                    replica.update(|state| state.record_success(duration_ms(elapsed)));
                    replica.mark_routed();
                    self.observer.on_event(&RouterEvent::QueryExecuted {
                        replica_id: replica.id().clone(),
                        latency: elapsed,
                        attempts: attempt,
                    });
                    return Ok(rows);
                }
                Err(e) => {
                    replica.update(|state| state.record_failure());
                    self.observer.on_event(&RouterEvent::QueryFailed {
                        replica_id: replica.id().clone(),
                        attempt,
                        error: e.to_string(),
                    });
                    last_error = Some(e);
                }
            }

            if attempt < attempts && !self.config.retry_backoff.is_zero() {
                let pause = self.config.retry_backoff * attempt;
                match cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(RouterError::Cancelled),
                        _ = tokio::time::sleep(pause) => {}
                    },
                    None => tokio::time::sleep(pause).await,
                }
            }
        }

        self.monitor.spawn_recheck(Arc::clone(replica));

        Err(RouterError::Execution {
            replica_id: replica.id().clone(),
            attempts,
            source: last_error.unwrap_or_else(|| QueryError::backend("no attempt was made")),
        })
    }
}
