/// SQLite read replica connections
///
/// Replicas are opened read-only and tuned for reads: WAL journaling where the
/// file allows it, a large page cache and memory-mapped I/O. rusqlite is
/// blocking, so every call runs on the blocking thread pool.
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, InterruptHandle, OpenFlags, ToSql};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::connection::with_timeout;
use crate::core::{Connector, ReplicaConfig, ReplicaConnection, Row, Value};
use crate::error::QueryError;

/// Page cache size in KiB (negative value form of `PRAGMA cache_size`)
const CACHE_SIZE_KIB: i64 = 64 * 1024;
/// Memory-mapped I/O window
const MMAP_SIZE_BYTES: i64 = 256 * 1024 * 1024;

/// Opens SQLite database files as read replicas
#[derive(Debug, Clone, Default)]
pub struct SqliteConnector;

impl SqliteConnector {
    pub fn new() -> Self {
        Self
    }

    fn open(target: &str) -> Result<Connection, QueryError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(target, flags)?;

        // Changing the journal mode needs write access; a replica that is not
        // already in WAL mode keeps whatever mode its writer chose.
        match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
            Ok(mode) => debug!(target, %mode, "Replica journal mode"),
            Err(e) => debug!(target, error = %e, "Could not switch replica to WAL"),
        }

        conn.pragma_update(None, "query_only", true)?;
        conn.pragma_update(None, "cache_size", -CACHE_SIZE_KIB)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        if let Err(e) = conn.pragma_update_and_check(None, "mmap_size", MMAP_SIZE_BYTES, |row| row.get::<_, i64>(0)) {
            warn!(target, error = %e, "Memory-mapped I/O not available");
        }

        // Force the file header to be read so a bad target fails here, not on first query
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;

        Ok(conn)
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self, config: &ReplicaConfig) -> Result<Arc<dyn ReplicaConnection>, QueryError> {
        let target = config.target.clone();
        let open = async move {
            tokio::task::spawn_blocking(move || Self::open(&target))
                .await
                .map_err(|e| QueryError::TaskJoin(e.to_string()))?
        };

        let conn = with_timeout(config.timeout, open).await?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Arc::new(SqliteReplica {
            conn: Arc::new(Mutex::new(Some(conn))),
            interrupt,
        }))
    }
}

/// A single read-only SQLite connection
pub struct SqliteReplica {
    conn: Arc<Mutex<Option<Connection>>>,
    interrupt: Arc<InterruptHandle>,
}

/// Where one query call is, as seen from both the caller and the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryPhase {
    Queued,
    Running,
    Abandoned,
    Done,
}

/// Interrupts the call's statement when its future is dropped before completion
///
/// A timed-out or cancelled query would otherwise keep running on the
/// blocking pool while holding the connection. The phase lock is held while
/// interrupting, so the interrupt can only hit this call's statement.
struct AbandonGuard {
    phase: Arc<Mutex<QueryPhase>>,
    interrupt: Arc<InterruptHandle>,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let mut phase = self.phase.lock();
        match *phase {
            QueryPhase::Queued => *phase = QueryPhase::Abandoned,
            QueryPhase::Running => {
                self.interrupt.interrupt();
                *phase = QueryPhase::Abandoned;
                debug!("Interrupted abandoned replica query");
            }
            QueryPhase::Abandoned | QueryPhase::Done => {}
        }
    }
}

impl SqliteReplica {
    fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, QueryError> {
        let mut stmt = conn.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                values.push(Value::from(row.get_ref(index)?));
            }
            result.push(Row::new(columns.clone(), values));
        }

        Ok(result)
    }
}

#[async_trait]
impl ReplicaConnection for SqliteReplica {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, QueryError> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params = params.to_vec();
        let phase = Arc::new(Mutex::new(QueryPhase::Queued));
        let _guard = AbandonGuard {
            phase: Arc::clone(&phase),
            interrupt: Arc::clone(&self.interrupt),
        };

        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let db = guard.as_ref().ok_or(QueryError::Closed)?;

            {
                let mut phase = phase.lock();
                if *phase == QueryPhase::Abandoned {
                    return Err(QueryError::backend("query abandoned before it started"));
                }
                *phase = QueryPhase::Running;
            }
            let result = Self::run_query(db, &sql, &params);
            *phase.lock() = QueryPhase::Done;

            result
        })
        .await
        .map_err(|e| QueryError::TaskJoin(e.to_string()))?
    }

    async fn close(&self) -> Result<(), QueryError> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let taken = conn.lock().take();
            match taken {
                Some(conn) => conn.close().map_err(|(_, e)| QueryError::Sqlite(e)),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| QueryError::TaskJoin(e.to_string()))?
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn seed_replica(dir: &TempDir) -> String {
        let path = dir.path().join("replica.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE tickets (id INTEGER PRIMARY KEY, title TEXT NOT NULL, priority TEXT);
            INSERT INTO tickets (title, priority) VALUES ('VPN down', 'high');
            INSERT INTO tickets (title, priority) VALUES ('Printer jam', NULL);
            "#,
        )
        .unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_query_with_params() {
        let dir = TempDir::new().unwrap();
        let config = ReplicaConfig::new("replica-a", seed_replica(&dir));
        let replica = SqliteConnector::new().connect(&config).await.unwrap();

        let rows = replica
            .query("SELECT id, title, priority FROM tickets WHERE id >= ?1 ORDER BY id", &[Value::Integer(1)])
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("title"), Some(&Value::Text("VPN down".to_string())));
        assert_eq!(rows[1].get("priority"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_replica_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let config = ReplicaConfig::new("replica-a", seed_replica(&dir));
        let replica = SqliteConnector::new().connect(&config).await.unwrap();

        let result = replica
            .query("INSERT INTO tickets (title) VALUES ('nope')", &[])
            .await;
        assert!(matches!(result, Err(QueryError::Sqlite(_))));
    }

    #[tokio::test]
    async fn test_ping_and_close() {
        let dir = TempDir::new().unwrap();
        let config = ReplicaConfig::new("replica-a", seed_replica(&dir));
        let replica = SqliteConnector::new().connect(&config).await.unwrap();

        assert!(replica.ping().await.is_ok());
        assert!(replica.close().await.is_ok());
        assert!(matches!(replica.ping().await, Err(QueryError::Closed)));
        // second close is a no-op
        assert!(replica.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_timed_out_query_releases_connection() {
        let dir = TempDir::new().unwrap();
        let config = ReplicaConfig::new("replica-a", seed_replica(&dir));
        let replica = SqliteConnector::new().connect(&config).await.unwrap();

        let slow = "WITH RECURSIVE counter(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM counter WHERE x < 200000000) \
                    SELECT count(*) FROM counter";
        let result = with_timeout(Duration::from_millis(50), replica.query(slow, &[])).await;
        assert!(matches!(result, Err(QueryError::Timeout(_))));

        let started = std::time::Instant::now();
        let ping = with_timeout(Duration::from_secs(2), replica.ping()).await;
        assert!(ping.is_ok(), "ping after abandoned query failed: {:?}", ping);
        assert!(started.elapsed() < Duration::from_secs(1));

        let rows = replica.query("SELECT count(*) AS n FROM tickets", &[]).await.unwrap();
        assert_eq!(rows[0].get("n"), Some(&Value::Integer(2)));
    }

    #[tokio::test]
    async fn test_missing_file_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.db");
        let config = ReplicaConfig::new("replica-x", missing.to_string_lossy())
            .with_timeout(Duration::from_secs(2));

        let result = SqliteConnector::new().connect(&config).await;
        assert!(result.is_err());
    }
}
