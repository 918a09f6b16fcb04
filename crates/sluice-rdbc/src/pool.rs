//! Connection pool for sluice-rdbc
//!
//! Every [`crate::db::Db`] owns one pool. The pool is lazy (no connections
//! are opened until the first borrow), bounded by `max_open` live
//! connections, and keeps at most `max_idle` of them parked between borrows.
//! Sizing comes from the JSON [`PoolPolicy`]:
//!
//! ```json
//! {"pool": {"maxOpenConns": 8, "maxIdleConns": 4,
//!           "connMaxIdleTime": "5m", "connMaxLifetime": "1h"}}
//! ```
//!
//! Non-positive sizes fall back to the defaults (4 open, 2 idle); missing or
//! zero durations mean "unlimited".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};

/// Default maximum number of open connections
pub const DEFAULT_MAX_OPEN_CONNS: usize = 4;

/// Default maximum number of idle connections
pub const DEFAULT_MAX_IDLE_CONNS: usize = 2;

/// Pool sizing policy as found under the `"pool"` key of a source config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolPolicy {
    /// Maximum open connections; non-positive means default
    pub max_open_conns: i64,
    /// Maximum idle connections; non-positive means default
    pub max_idle_conns: i64,
    /// Idle connections older than this are closed
    #[serde(with = "humantime_serde")]
    pub conn_max_idle_time: Option<Duration>,
    /// Connections older than this are recycled
    #[serde(with = "humantime_serde")]
    pub conn_max_lifetime: Option<Duration>,
}

#[derive(Deserialize)]
struct PolicyEnvelope {
    #[serde(default)]
    pool: Option<PoolPolicy>,
}

impl PoolPolicy {
    /// Parse the policy from a JSON config object holding a `"pool"` key.
    ///
    /// A missing key yields the default policy.
    pub fn from_json(config: &serde_json::Value) -> Result<Self> {
        if config.is_null() {
            return Ok(Self::default());
        }
        let envelope: PolicyEnvelope = serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("invalid pool policy: {e}")))?;
        Ok(envelope.pool.unwrap_or_default())
    }

    /// Effective maximum number of open connections
    pub fn max_open(&self) -> usize {
        positive_or(self.max_open_conns, DEFAULT_MAX_OPEN_CONNS)
    }

    /// Effective maximum number of idle connections
    pub fn max_idle(&self) -> usize {
        positive_or(self.max_idle_conns, DEFAULT_MAX_IDLE_CONNS)
    }

    /// Effective idle timeout; `None` is unlimited
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.conn_max_idle_time.filter(|d| !d.is_zero())
    }

    /// Effective connection lifetime; `None` is unlimited
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.conn_max_lifetime.filter(|d| !d.is_zero())
    }
}

fn positive_or(value: i64, default: usize) -> usize {
    if value > 0 {
        usize::try_from(value).unwrap_or(default)
    } else {
        default
    }
}

/// Connection pool trait
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Get a connection from the pool
    async fn get(&self) -> Result<PooledConnection>;

    /// Return a connection to the pool
    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant);

    /// Close a borrowed connection instead of returning it
    async fn discard_connection(&self, conn: Box<dyn Connection>);

    /// Get current pool size
    fn size(&self) -> usize;

    /// Get number of idle connections
    fn idle(&self) -> usize;

    /// Get number of connections in use
    fn in_use(&self) -> usize {
        self.size().saturating_sub(self.idle())
    }

    /// Get pool statistics
    fn stats(&self) -> PoolStats;

    /// Close all connections and shutdown the pool
    async fn close(&self) -> Result<()>;
}

/// A connection borrowed from the pool; returned when dropped, or closed
/// when marked broken
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    pool: Arc<dyn ConnectionPool>,
    broken: bool,
}

impl PooledConnection {
    /// Create a new pooled connection wrapper
    pub fn new(conn: Box<dyn Connection>, created_at: Instant, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            pool,
            broken: false,
        }
    }

    /// Whether the connection will be closed rather than reused
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Mark the session state as unknown, e.g. while a transaction is open.
    /// A broken connection is closed when dropped.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Undo [`Self::mark_broken`] once the session is clean again
    pub fn mark_healthy(&mut self) {
        self.broken = false;
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &(dyn Connection + 'static) {
        self.conn
            .as_ref()
            .expect("connection already returned")
            .as_ref()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Outside a runtime the pool is going away with it
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pool = self.pool.clone();
                let created_at = self.created_at;
                let broken = self.broken;
                handle.spawn(async move {
                    if broken {
                        pool.discard_connection(conn).await;
                    } else {
                        pool.return_connection(conn, created_at).await;
                    }
                });
            }
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Maximum number of live connections
    pub max_open: usize,
    /// Maximum number of parked connections
    pub max_idle: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime; `None` is unlimited
    pub max_lifetime: Option<Duration>,
    /// Idle timeout; `None` is unlimited
    pub idle_timeout: Option<Duration>,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
    /// Whether to test connections on return
    pub test_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_open: DEFAULT_MAX_OPEN_CONNS,
            max_idle: DEFAULT_MAX_IDLE_CONNS,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: None,
            idle_timeout: None,
            test_on_borrow: false,
            test_on_return: false,
        }
    }
}

impl PoolConfig {
    /// Create pool config from connection settings
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    /// Create pool config from connection settings and a sizing policy
    pub fn from_policy(connection: ConnectionConfig, policy: &PoolPolicy) -> Self {
        Self {
            connection,
            max_open: policy.max_open(),
            max_idle: policy.max_idle(),
            max_lifetime: policy.max_lifetime(),
            idle_timeout: policy.idle_timeout(),
            ..Default::default()
        }
    }

    /// Set maximum open connections
    pub fn with_max_open(mut self, size: usize) -> Self {
        self.max_open = size;
        self
    }

    /// Set maximum idle connections
    pub fn with_max_idle(mut self, size: usize) -> Self {
        self.max_idle = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    /// Enable/disable test on return
    pub fn with_test_on_return(mut self, test: bool) -> Self {
        self.test_on_return = test;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of times pool was exhausted
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

/// Bounded, lazily filled connection pool.
///
/// A semaphore with `max_open` permits bounds live connections; a permit is
/// held for as long as a connection is borrowed and handed back on return.
/// Parked connections are kept LIFO, capped at `max_idle`.
pub struct SimpleConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    idle_count: AtomicUsize,
    semaphore: Semaphore,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
    self_ref: std::sync::OnceLock<std::sync::Weak<Self>>,
}

struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

impl SimpleConnectionPool {
    /// Create a new connection pool. No connection is opened yet.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let max_open = config.max_open.max(1);
        let pool = Arc::new(Self {
            semaphore: Semaphore::new(max_open),
            idle: Mutex::new(Vec::with_capacity(config.max_idle)),
            config,
            factory,
            idle_count: AtomicUsize::new(0),
            total_connections: AtomicUsize::new(0),
            stats: AtomicPoolStats::new(),
            shutdown: AtomicBool::new(false),
            self_ref: std::sync::OnceLock::new(),
        });

        let _ = pool.self_ref.set(Arc::downgrade(&pool));
        pool
    }

    fn get_self_arc(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(|w| w.upgrade())
    }

    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.factory.connect(&self.config.connection).await?;
        self.total_connections.fetch_add(1, Ordering::Release);
        self.stats.record_created();
        Ok(conn)
    }

    async fn discard(&self, conn: Box<dyn Connection>) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing pooled connection");
        }
        self.total_connections.fetch_sub(1, Ordering::Release);
        self.stats.record_closed();
    }

    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        self.config
            .max_lifetime
            .is_some_and(|max| entry.created_at.elapsed() > max)
            || self
                .config
                .idle_timeout
                .is_some_and(|max| entry.last_used.elapsed() > max)
    }

    async fn pop_idle(&self) -> Option<PoolEntry> {
        let mut idle = self.idle.lock().await;
        let entry = idle.pop();
        self.idle_count.store(idle.len(), Ordering::Release);
        entry
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn get(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "pool is shut down".to_string(),
            });
        }

        let start = Instant::now();

        let permit = tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                self.stats.record_exhausted();
                Error::PoolExhausted {
                    message: format!(
                        "timeout waiting for connection ({}ms)",
                        self.config.acquire_timeout.as_millis()
                    ),
                }
            })?
            .map_err(|_| Error::PoolExhausted {
                message: "pool semaphore closed".to_string(),
            })?;

        let mut reused = None;
        while let Some(entry) = self.pop_idle().await {
            if self.should_recycle(&entry) {
                self.discard(entry.conn).await;
                continue;
            }
            if self.config.test_on_borrow && !entry.conn.is_valid().await {
                self.stats.record_health_check_failure();
                self.discard(entry.conn).await;
                continue;
            }
            reused = Some((entry.conn, entry.created_at));
            break;
        }

        // a failed connect drops the permit here
        let (conn, created_at) = match reused {
            Some(found) => found,
            None => (self.create_connection().await?, Instant::now()),
        };

        let wait_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.stats.record_acquisition(wait_ms);

        let pool_arc = self.get_self_arc().ok_or_else(|| Error::PoolExhausted {
            message: "pool has been dropped".to_string(),
        })?;

        // released again in return_connection
        permit.forget();
        Ok(PooledConnection::new(conn, created_at, pool_arc))
    }

    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant) {
        self.semaphore.add_permits(1);

        if self.shutdown.load(Ordering::Acquire) {
            self.discard(conn).await;
            return;
        }

        if self.config.test_on_return && !conn.is_valid().await {
            self.stats.record_health_check_failure();
            self.discard(conn).await;
            return;
        }

        let entry = PoolEntry {
            conn,
            created_at,
            last_used: Instant::now(),
        };
        if self.should_recycle(&entry) {
            self.discard(entry.conn).await;
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.config.max_idle {
            drop(idle);
            self.discard(entry.conn).await;
            return;
        }
        idle.push(entry);
        self.idle_count.store(idle.len(), Ordering::Release);
    }

    async fn discard_connection(&self, conn: Box<dyn Connection>) {
        self.semaphore.add_permits(1);
        warn!("discarding connection left in an unknown session state");
        self.discard(conn).await;
    }

    fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    fn idle(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let drained: Vec<PoolEntry> = {
            let mut idle = self.idle.lock().await;
            self.idle_count.store(0, Ordering::Release);
            idle.drain(..).collect()
        };
        for entry in drained {
            self.discard(entry.conn).await;
        }

        let in_use = self.size();
        if in_use > 0 {
            warn!(in_use, "pool closed with connections still borrowed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults_for_non_positive() {
        let policy: PoolPolicy =
            serde_json::from_str(r#"{"maxOpenConns": 0, "maxIdleConns": -3}"#).unwrap();
        assert_eq!(policy.max_open(), DEFAULT_MAX_OPEN_CONNS);
        assert_eq!(policy.max_idle(), DEFAULT_MAX_IDLE_CONNS);
        assert_eq!(policy.idle_timeout(), None);
        assert_eq!(policy.max_lifetime(), None);
    }

    #[test]
    fn test_policy_from_json() {
        let config = serde_json::json!({
            "url": "postgres://localhost/db",
            "pool": {
                "maxOpenConns": 8,
                "maxIdleConns": 3,
                "connMaxIdleTime": "30s",
                "connMaxLifetime": "0s"
            }
        });
        let policy = PoolPolicy::from_json(&config).unwrap();
        assert_eq!(policy.max_open(), 8);
        assert_eq!(policy.max_idle(), 3);
        assert_eq!(policy.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(policy.max_lifetime(), None);

        let missing = PoolPolicy::from_json(&serde_json::json!({"url": "x"})).unwrap();
        assert_eq!(missing, PoolPolicy::default());
    }

    #[test]
    fn test_policy_rejects_bad_duration() {
        let config = serde_json::json!({"pool": {"connMaxIdleTime": "soon"}});
        let err = PoolPolicy::from_json(&config).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_pool_config_from_policy() {
        let policy = PoolPolicy {
            max_open_conns: 10,
            conn_max_lifetime: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let config = PoolConfig::from_policy(ConnectionConfig::new("postgres://h/db"), &policy);
        assert_eq!(config.max_open, 10);
        assert_eq!(config.max_idle, DEFAULT_MAX_IDLE_CONNS);
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(60)));
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::new();

        stats.record_created();
        stats.record_created();
        stats.record_acquisition(100);
        stats.record_acquisition(200);
        stats.record_closed();
        stats.record_exhausted();
        stats.record_health_check_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_created, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.acquisitions, 2);
        assert_eq!(snapshot.total_wait_time_ms, 300);
        assert_eq!(snapshot.exhausted_count, 1);
        assert_eq!(snapshot.health_check_failures, 1);
    }
}
