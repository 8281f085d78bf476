/// Scripted in-memory replica connections for unit tests
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::connection::PROBE_QUERY;
use crate::core::{Connector, ReplicaConfig, ReplicaConnection, Row, Value};
use crate::error::QueryError;

/// Connection whose behavior tests flip at runtime
pub struct MockConnection {
    name: String,
    /// Remaining query failures; `u32::MAX` means fail forever
    failures_left: AtomicU32,
    ping_ok: AtomicBool,
    close_fails: AtomicBool,
    delay_ms: AtomicU64,
    pub queries: AtomicU64,
    pub closed: AtomicBool,
}

impl MockConnection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failures_left: AtomicU32::new(0),
            ping_ok: AtomicBool::new(true),
            close_fails: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.failures_left.store(u32::MAX, Ordering::SeqCst);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_close_fails(&self, fails: bool) {
        self.close_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl ReplicaConnection for MockConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>, QueryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueryError::Closed);
        }

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if sql == PROBE_QUERY {
            return if self.ping_ok.load(Ordering::SeqCst) {
                Ok(vec![Row::new(vec!["1".to_string()], vec![Value::Integer(1)])])
            } else {
                Err(QueryError::backend(format!("{} is down", self.name)))
            };
        }

        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(QueryError::backend(format!("{} rejected query", self.name)));
        }

        Ok(vec![Row::new(
            vec!["replica".to_string()],
            vec![Value::Text(self.name.clone())],
        )])
    }

    async fn close(&self) -> Result<(), QueryError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.close_fails.load(Ordering::SeqCst) {
            return Err(QueryError::backend("close failed"));
        }
        Ok(())
    }
}

/// Connector handing out `MockConnection`s keyed by replica name
#[derive(Default)]
pub struct MockConnector {
    connections: Mutex<HashMap<String, Arc<MockConnection>>>,
    refuse: Mutex<HashSet<String>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `connect` fail for the named replica
    pub fn refuse(&self, name: &str) {
        self.refuse.lock().insert(name.to_string());
    }

    /// Handle to the connection opened for `name`, created on demand
    pub fn connection(&self, name: &str) -> Arc<MockConnection> {
        self.connections
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MockConnection::new(name)))
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &ReplicaConfig) -> Result<Arc<dyn ReplicaConnection>, QueryError> {
        if self.refuse.lock().contains(&config.name) {
            return Err(QueryError::backend(format!(
                "unable to open {}",
                config.target
            )));
        }
        let connection = self.connection(&config.name);
        connection.closed.store(false, Ordering::SeqCst);
        Ok(connection)
    }
}
