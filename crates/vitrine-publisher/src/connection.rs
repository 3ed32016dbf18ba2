//! Process-wide store connection with single-flight acquisition.
//!
//! [`ConnectionManager`] caches one [`ContentStore`] handle. The first caller
//! starts a connection attempt; callers arriving while it is in flight await
//! the same memoised future and observe the same handle or the same error.
//! A failed attempt resets the cache so the next call starts over.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use rusqlite::Connection;
use tracing::{debug, info, warn};
use vitrine_core::StoreConfig;

use crate::db::init_db;
use crate::error::ConnectionError;
use crate::store::ContentStore;

const MEMORY_ADDRESS: &str = "sqlite::memory:";
const SQLITE_SCHEME: &str = "sqlite://";

/// Parsed form of `store.url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAddress {
    /// `sqlite://<path>`
    File(PathBuf),
    /// `sqlite::memory:`
    Memory,
}

impl StoreAddress {
    pub fn parse(raw: &str) -> Result<Self, ConnectionError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConnectionError::MissingAddress);
        }
        if raw == MEMORY_ADDRESS {
            return Ok(StoreAddress::Memory);
        }
        match raw.strip_prefix(SQLITE_SCHEME) {
            Some(path) if !path.trim().is_empty() => Ok(StoreAddress::File(PathBuf::from(path))),
            Some(_) => Err(ConnectionError::MalformedAddress(format!(
                "{raw}: database path is empty"
            ))),
            None => Err(ConnectionError::MalformedAddress(format!(
                "{raw}: expected {SQLITE_SCHEME}<path> or {MEMORY_ADDRESS}"
            ))),
        }
    }
}

/// Opens a new store handle. One call = one underlying connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<ContentStore>, ConnectionError>;
}

/// Opens SQLite databases described by a [`StoreConfig`].
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    url: Option<String>,
    busy_timeout: Duration,
    init_schema: bool,
}

impl SqliteConnector {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            url: config.url().map(String::from),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            init_schema: config.init_schema,
        }
    }

    pub fn with_init_schema(mut self, init_schema: bool) -> Self {
        self.init_schema = init_schema;
        self
    }

    fn open(
        address: StoreAddress,
        busy_timeout: Duration,
        init_schema: bool,
    ) -> Result<ContentStore, ConnectionError> {
        let unreachable = |e: rusqlite::Error| ConnectionError::Unreachable(e.to_string());

        let conn = match &address {
            StoreAddress::Memory => Connection::open_in_memory().map_err(unreachable)?,
            StoreAddress::File(path) => Connection::open(path).map_err(|e| {
                ConnectionError::Unreachable(format!("{}: {e}", path.display()))
            })?,
        };
        conn.busy_timeout(busy_timeout).map_err(unreachable)?;
        if matches!(address, StoreAddress::File(_)) {
            conn.execute_batch("PRAGMA journal_mode=WAL;")
                .map_err(unreachable)?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(unreachable)?;
        if init_schema {
            init_db(&conn).map_err(|e| ConnectionError::Unreachable(e.to_string()))?;
        }
        Ok(ContentStore::new(conn))
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self) -> Result<Arc<ContentStore>, ConnectionError> {
        let raw = self.url.as_deref().ok_or(ConnectionError::MissingAddress)?;
        let address = StoreAddress::parse(raw)?;
        let busy_timeout = self.busy_timeout;
        let init_schema = self.init_schema;

        let store = tokio::task::spawn_blocking(move || {
            Self::open(address, busy_timeout, init_schema)
        })
        .await
        .map_err(|e| ConnectionError::Unreachable(format!("connect task failed: {e}")))??;
        Ok(Arc::new(store))
    }
}

type Attempt = Shared<BoxFuture<'static, Result<Arc<ContentStore>, ConnectionError>>>;

enum Slot {
    Uninitialized,
    Connecting { generation: u64, attempt: Attempt },
    Connected { store: Arc<ContentStore> },
}

/// Coarse view of the cached connection, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
}

struct Inner {
    slot: Slot,
    /// Bumped for every new attempt; only the current attempt may settle the slot.
    generation: u64,
}

/// Lazily established, shared store handle.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
}

static GLOBAL: OnceLock<Arc<ConnectionManager>> = OnceLock::new();

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            inner: Mutex::new(Inner {
                slot: Slot::Uninitialized,
                generation: 0,
            }),
        }
    }

    /// Manager backed by [`SqliteConnector`].
    pub fn sqlite(config: &StoreConfig) -> Self {
        Self::new(Arc::new(SqliteConnector::new(config)))
    }

    /// The process-wide manager. `config` is only read on the first call.
    pub fn global(config: &StoreConfig) -> Arc<ConnectionManager> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::sqlite(config))))
    }

    /// Return the cached handle, join an in-flight attempt, or start one.
    pub async fn acquire(&self) -> Result<Arc<ContentStore>, ConnectionError> {
        let (generation, attempt) = {
            let mut inner = self.lock();
            let in_flight = match &inner.slot {
                Slot::Connected { store } => return Ok(Arc::clone(store)),
                Slot::Connecting {
                    generation,
                    attempt,
                } => Some((*generation, attempt.clone())),
                Slot::Uninitialized => None,
            };
            match in_flight {
                Some((generation, attempt)) => {
                    debug!(generation, "joining in-flight store connection attempt");
                    (generation, attempt)
                }
                None => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    let connector = Arc::clone(&self.connector);
                    let attempt = async move { connector.connect().await }.boxed().shared();
                    inner.slot = Slot::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    info!(generation, "opening store connection");
                    (generation, attempt)
                }
            }
        };

        let outcome = attempt.await;

        let mut inner = self.lock();
        let current = matches!(
            inner.slot,
            Slot::Connecting { generation: g, .. } if g == generation
        );
        if current {
            inner.slot = match &outcome {
                Ok(store) => {
                    info!(generation, "store connection established");
                    Slot::Connected {
                        store: Arc::clone(store),
                    }
                }
                Err(e) => {
                    warn!(
                        generation,
                        error = %e,
                        "store connection failed; next acquire will retry"
                    );
                    Slot::Uninitialized
                }
            };
        }
        outcome
    }

    /// Drop the cached handle; the next [`acquire`](Self::acquire) reconnects.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if !matches!(inner.slot, Slot::Uninitialized) {
            info!("store connection reset");
        }
        inner.slot = Slot::Uninitialized;
    }

    pub fn state(&self) -> ConnectionState {
        match self.lock().slot {
            Slot::Uninitialized => ConnectionState::Uninitialized,
            Slot::Connecting { .. } => ConnectionState::Connecting,
            Slot::Connected { .. } => ConnectionState::Connected,
        }
    }

    // The lock is never held across an await or a call that can panic, so a
    // poisoned guard still holds a consistent slot.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts connect calls; fails the first `failures` of them.
    struct CountingConnector {
        calls: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    impl CountingConnector {
        fn new(failures: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self) -> Result<Arc<ContentStore>, ConnectionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.failures {
                return Err(ConnectionError::Unreachable(format!("attempt {n} refused")));
            }
            let conn = Connection::open_in_memory()
                .map_err(|e| ConnectionError::Unreachable(e.to_string()))?;
            Ok(Arc::new(ContentStore::new(conn)))
        }
    }

    #[test]
    fn parses_store_addresses() {
        assert_eq!(StoreAddress::parse("sqlite::memory:"), Ok(StoreAddress::Memory));
        assert_eq!(
            StoreAddress::parse("sqlite://data/content.db"),
            Ok(StoreAddress::File(PathBuf::from("data/content.db")))
        );
        assert_eq!(
            StoreAddress::parse("sqlite:///var/lib/vitrine.db"),
            Ok(StoreAddress::File(PathBuf::from("/var/lib/vitrine.db")))
        );
        assert_eq!(StoreAddress::parse("  "), Err(ConnectionError::MissingAddress));
        assert!(matches!(
            StoreAddress::parse("sqlite://"),
            Err(ConnectionError::MalformedAddress(_))
        ));
        assert!(matches!(
            StoreAddress::parse("mongodb://localhost/content"),
            Err(ConnectionError::MalformedAddress(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_acquire_shares_one_connection() {
        let connector = CountingConnector::new(0, Duration::from_millis(50));
        let manager = Arc::new(ConnectionManager::new(connector.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.acquire().await })
            })
            .collect();
        let mut stores = Vec::new();
        for handle in handles {
            stores.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(connector.calls(), 1);
        assert!(stores.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn connected_handle_is_reused() {
        let connector = CountingConnector::new(0, Duration::ZERO);
        let manager = ConnectionManager::new(connector.clone());
        assert_eq!(manager.state(), ConnectionState::Uninitialized);

        let a = manager.acquire().await.unwrap();
        let b = manager.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn failed_attempt_is_not_cached() {
        let connector = CountingConnector::new(1, Duration::ZERO);
        let manager = ConnectionManager::new(connector.clone());

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Unreachable(_)));
        assert_eq!(manager.state(), ConnectionState::Uninitialized);

        manager.acquire().await.unwrap();
        assert_eq!(connector.calls(), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_callers_share_one_failure() {
        let connector = CountingConnector::new(1, Duration::from_millis(50));
        let manager = Arc::new(ConnectionManager::new(connector.clone()));

        let (a, b) = tokio::join!(manager.acquire(), manager.acquire());
        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(connector.calls(), 1);

        // The shared failure did not poison the manager.
        manager.acquire().await.unwrap();
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn reset_forces_reconnect() {
        let connector = CountingConnector::new(0, Duration::ZERO);
        let manager = ConnectionManager::new(connector.clone());

        let first = manager.acquire().await.unwrap();
        manager.reset();
        assert_eq!(manager.state(), ConnectionState::Uninitialized);
        let second = manager.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn sqlite_connector_reports_missing_address() {
        let manager = ConnectionManager::sqlite(&StoreConfig::default());
        assert_eq!(
            manager.acquire().await.unwrap_err(),
            ConnectionError::MissingAddress
        );
    }

    #[tokio::test]
    async fn sqlite_connector_reports_malformed_address() {
        let manager = ConnectionManager::sqlite(&StoreConfig::with_url("postgres://db/content"));
        assert!(matches!(
            manager.acquire().await.unwrap_err(),
            ConnectionError::MalformedAddress(_)
        ));
    }

    #[tokio::test]
    async fn sqlite_connector_reports_unreachable_path() {
        let manager = ConnectionManager::sqlite(&StoreConfig::with_url(
            "sqlite:///nonexistent-vitrine-dir/nested/content.db",
        ));
        assert!(matches!(
            manager.acquire().await.unwrap_err(),
            ConnectionError::Unreachable(_)
        ));
        assert_eq!(manager.state(), ConnectionState::Uninitialized);
    }

    #[tokio::test]
    async fn sqlite_connector_opens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("content.db").display());
        let manager = ConnectionManager::sqlite(&StoreConfig::with_url(url));

        let store = manager.acquire().await.unwrap();
        assert!(store.list_pending().unwrap().is_empty());
    }
}
