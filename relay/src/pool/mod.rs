//! Connection pool
//!
//! Owns every live backend connection, keyed by `(backend, instance)` and by
//! a process-wide numeric id. Disconnected records are purged from both
//! indexes; reconnecting the same key yields a new id.
//!
//! Index mutations happen under a single mutex. Connection establishment
//! runs outside that mutex but under a per-key creation lock, so two callers
//! racing on one key cannot both spawn a backend.

mod record;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendClient, BackendError, Connector};
use crate::config::ServerConfig;

pub use record::{ConnectionKey, ConnectionRecord, ConnectionStatus};

/// Idle timeout before a connection is reaped (5 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the reaper scans for idle connections
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Idle-reaping policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub auto_disconnect: bool,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            auto_disconnect: true,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to connect to {key}: {source}")]
    Connect {
        key: ConnectionKey,
        #[source]
        source: BackendError,
    },

    #[error("no config cached for {key}; connect it first")]
    NoCachedConfig { key: ConnectionKey },
}

/// A live connection handed out by the pool
#[derive(Clone)]
pub struct PooledConnection {
    pub record: ConnectionRecord,
    pub client: Arc<dyn BackendClient>,
    /// False when an existing live connection was reused
    pub created: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("record", &self.record)
            .field("created", &self.created)
            .finish()
    }
}

/// Outcome of [`ConnectionPool::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub closed: usize,
    pub failed: usize,
}

struct Entry {
    record: ConnectionRecord,
    last_used: Instant,
    client: Arc<dyn BackendClient>,
}

impl Entry {
    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.record.last_used_at = Utc::now();
    }

    fn handle(&self, created: bool) -> PooledConnection {
        PooledConnection {
            record: self.record.clone(),
            client: self.client.clone(),
            created,
        }
    }
}

/// Config a key was last connected with
struct CachedConfig {
    config: ServerConfig,
    /// Generated-tag keys are never reused, so their config is dropped on disconnect
    generated: bool,
}

#[derive(Default)]
struct PoolState {
    by_id: HashMap<u64, Entry>,
    by_key: HashMap<ConnectionKey, u64>,
    configs: HashMap<ConnectionKey, CachedConfig>,
    tag_counters: HashMap<String, u64>,
}

impl PoolState {
    fn remove_key(&mut self, key: &ConnectionKey) -> Option<Entry> {
        let id = self.by_key.remove(key)?;
        let entry = self.by_id.remove(&id)?;
        self.forget_generated(key);
        Some(entry)
    }

    fn remove_id(&mut self, id: u64) -> Option<Entry> {
        let entry = self.by_id.remove(&id)?;
        let key = entry.record.key();
        self.by_key.remove(&key);
        self.forget_generated(&key);
        Some(entry)
    }

    fn forget_generated(&mut self, key: &ConnectionKey) {
        if self.configs.get(key).map_or(false, |c| c.generated) {
            self.configs.remove(key);
        }
    }
}

/// Pool of backend connections
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    create_locks: Mutex<HashMap<ConnectionKey, Arc<Mutex<()>>>>,
    next_id: AtomicU64,
    reaper_started: AtomicBool,
    reaper_stop: CancellationToken,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, options: PoolOptions) -> Self {
        Self {
            connector,
            options,
            state: Mutex::new(PoolState::default()),
            create_locks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reaper_started: AtomicBool::new(false),
            reaper_stop: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Return the live connection for the key, connecting if needed
    pub async fn get_or_create(
        &self,
        backend: &str,
        config: &ServerConfig,
        instance: Option<&str>,
    ) -> Result<PooledConnection, PoolError> {
        self.get_or_connect(ConnectionKey::new(backend, instance), config, false)
            .await
    }

    /// Like [`get_or_create`](Self::get_or_create) with the next sequential
    /// tag for this backend ("1", "2", ...)
    pub async fn get_or_create_with_generated_tag(
        &self,
        backend: &str,
        config: &ServerConfig,
    ) -> Result<PooledConnection, PoolError> {
        let tag = {
            let mut state = self.state.lock().await;
            loop {
                let counter = state.tag_counters.entry(backend.to_string()).or_insert(0);
                *counter += 1;
                let tag = counter.to_string();
                if !state
                    .by_key
                    .contains_key(&ConnectionKey::new(backend, Some(&tag)))
                {
                    break tag;
                }
            }
        };
        self.get_or_connect(ConnectionKey::new(backend, Some(&tag)), config, true)
            .await
    }

    /// Close and purge the connection for the key
    pub async fn disconnect(
        &self,
        backend: &str,
        instance: Option<&str>,
    ) -> Option<ConnectionRecord> {
        let key = ConnectionKey::new(backend, instance);
        let entry = self.state.lock().await.remove_key(&key)?;
        Some(close_entry(entry).await.unwrap_or_else(|(record, _)| record))
    }

    /// Close and purge the connection with the given id
    pub async fn disconnect_by_id(&self, id: u64) -> Option<ConnectionRecord> {
        let entry = self.state.lock().await.remove_id(id)?;
        Some(close_entry(entry).await.unwrap_or_else(|(record, _)| record))
    }

    /// Replace the key's connection with a fresh one using the cached config
    pub async fn reconnect(
        &self,
        backend: &str,
        instance: Option<&str>,
    ) -> Result<PooledConnection, PoolError> {
        let key = ConnectionKey::new(backend, instance);
        let (config, generated) = self
            .state
            .lock()
            .await
            .configs
            .get(&key)
            .map(|c| (c.config.clone(), c.generated))
            .ok_or_else(|| PoolError::NoCachedConfig { key: key.clone() })?;

        let lock = self.create_lock(&key).await;
        let guard = lock.lock().await;

        if let Some(old) = self.disconnect(backend, instance).await {
            tracing::info!("Reconnecting {} (replacing connection {})", key, old.id);
        }
        let result = self.connect_and_register(key.clone(), config, generated).await;

        self.release_create_lock(&key, &lock).await;
        drop(guard);
        result
    }

    /// Live connection for the key; refreshes its last-used time
    pub async fn get(&self, backend: &str, instance: Option<&str>) -> Option<PooledConnection> {
        self.touch_key(&ConnectionKey::new(backend, instance)).await
    }

    /// Live connection with the given id; refreshes its last-used time
    pub async fn get_by_id(&self, id: u64) -> Option<PooledConnection> {
        let mut state = self.state.lock().await;
        let entry = state.by_id.get_mut(&id)?;
        entry.touch();
        Some(entry.handle(false))
    }

    /// Snapshots of every live connection, ordered by id
    pub async fn list_all(&self) -> Vec<ConnectionRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state.by_id.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Snapshots of the live connections for one backend, ordered by id
    pub async fn list_for_backend(&self, backend: &str) -> Vec<ConnectionRecord> {
        let mut records = self.list_all().await;
        records.retain(|r| r.backend == backend);
        records
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Disconnect every connection idle for longer than the configured timeout
    pub async fn reap_idle(&self) -> Vec<ConnectionRecord> {
        let expired: Vec<Entry> = {
            let mut state = self.state.lock().await;
            let ids: Vec<u64> = state
                .by_id
                .iter()
                .filter(|(_, e)| e.last_used.elapsed() > self.options.idle_timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| state.remove_id(id)).collect()
        };

        let mut reaped = Vec::with_capacity(expired.len());
        for entry in expired {
            tracing::info!(
                "Disconnecting idle connection {} ({})",
                entry.record.id,
                entry.record.key()
            );
            reaped.push(close_entry(entry).await.unwrap_or_else(|(record, _)| record));
        }
        reaped
    }

    /// Start the background idle reaper; later calls are no-ops
    pub fn start_reaper(self: &Arc<Self>) {
        if self.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool: Weak<Self> = Arc::downgrade(self);
        let stop = self.reaper_stop.clone();
        let period = self.options.reap_interval;

        tracing::debug!(
            "Idle reaper started (timeout {:?}, interval {:?})",
            self.options.idle_timeout,
            period
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.reap_idle().await;
                    }
                }
            }
            tracing::debug!("Idle reaper stopped");
        });
    }

    /// Stop the idle reaper; safe to call more than once
    pub fn stop_reaper(&self) {
        self.reaper_stop.cancel();
    }

    /// Stop reaping, close every connection best-effort, clear all indexes
    pub async fn shutdown(&self) -> ShutdownReport {
        self.stop_reaper();

        let entries: Vec<Entry> = {
            let mut state = self.state.lock().await;
            state.by_key.clear();
            state.configs.clear();
            state.tag_counters.clear();
            state.by_id.drain().map(|(_, e)| e).collect()
        };

        let mut report = ShutdownReport::default();
        for entry in entries {
            match close_entry(entry).await {
                Ok(_) => report.closed += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    async fn touch_key(&self, key: &ConnectionKey) -> Option<PooledConnection> {
        let mut state = self.state.lock().await;
        let id = *state.by_key.get(key)?;
        let entry = state.by_id.get_mut(&id)?;
        entry.touch();
        Some(entry.handle(false))
    }

    async fn get_or_connect(
        &self,
        key: ConnectionKey,
        config: &ServerConfig,
        generated: bool,
    ) -> Result<PooledConnection, PoolError> {
        if let Some(found) = self.touch_key(&key).await {
            return Ok(found);
        }

        let lock = self.create_lock(&key).await;
        let guard = lock.lock().await;

        // Another caller may have connected while we waited for the lock
        let result = match self.touch_key(&key).await {
            Some(found) => Ok(found),
            None => {
                self.connect_and_register(key.clone(), config.clone(), generated)
                    .await
            }
        };

        self.release_create_lock(&key, &lock).await;
        drop(guard);
        result
    }

    async fn create_lock(&self, key: &ConnectionKey) -> Arc<Mutex<()>> {
        self.create_locks
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drop the key's creation lock unless another caller is queued on it
    ///
    /// Caller must still hold the lock; the map and the caller account for
    /// two strong references.
    async fn release_create_lock(&self, key: &ConnectionKey, lock: &Arc<Mutex<()>>) {
        let mut locks = self.create_locks.lock().await;
        let ours = locks.get(key).map_or(false, |held| Arc::ptr_eq(held, lock));
        if ours && Arc::strong_count(lock) <= 2 {
            locks.remove(key);
        }
    }

    /// Caller must hold the key's creation lock
    async fn connect_and_register(
        &self,
        key: ConnectionKey,
        config: ServerConfig,
        generated: bool,
    ) -> Result<PooledConnection, PoolError> {
        let client = self
            .connector
            .connect(&key.backend, &config)
            .await
            .map_err(|source| PoolError::Connect {
                key: key.clone(),
                source,
            })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let entry = Entry {
            record: ConnectionRecord {
                id,
                backend: key.backend.clone(),
                instance: key.instance.clone(),
                status: ConnectionStatus::Connected,
                connected_at: now,
                last_used_at: now,
                closed_at: None,
            },
            last_used: Instant::now(),
            client,
        };
        let handle = entry.handle(true);

        let mut state = self.state.lock().await;
        state
            .configs
            .insert(key.clone(), CachedConfig { config, generated });
        state.by_key.insert(key.clone(), id);
        state.by_id.insert(id, entry);
        drop(state);

        tracing::info!("Connected {} as connection {}", key, id);
        Ok(handle)
    }
}

/// Close the transport and produce the final snapshot
async fn close_entry(
    entry: Entry,
) -> Result<ConnectionRecord, (ConnectionRecord, BackendError)> {
    let mut record = entry.record;
    record.status = ConnectionStatus::Disconnected;
    record.closed_at = Some(Utc::now());

    match entry.client.close().await {
        Ok(()) => {
            tracing::info!("Disconnected {} (connection {})", record.key(), record.id);
            Ok(record)
        }
        Err(e) => {
            tracing::warn!(
                "Error closing {} (connection {}): {}",
                record.key(),
                record.id,
                e
            );
            Err((record, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeConnector;

    fn pool_with(connector: Arc<FakeConnector>) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(connector, PoolOptions::default()))
    }

    fn config() -> ServerConfig {
        ServerConfig::stdio("fake", &[])
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_live_connection() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(connector.clone());

        let first = pool.get_or_create("github", &config(), None).await.unwrap();
        let second = pool.get_or_create("github", &config(), None).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.record.id, 1);
        assert_eq!(second.record.id, 1);
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(pool.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ids_strictly_increase_across_reconnects() {
        let pool = pool_with(Arc::new(FakeConnector::new()));
        let mut seen = Vec::new();

        for _ in 0..3 {
            let conn = pool.get_or_create("github", &config(), None).await.unwrap();
            seen.push(conn.record.id);
            let conn = pool.reconnect("github", None).await.unwrap();
            seen.push(conn.record.id);
            pool.disconnect("github", None).await.unwrap();
        }

        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_disconnect_purges_record() {
        let pool = pool_with(Arc::new(FakeConnector::new()));
        let conn = pool.get_or_create("github", &config(), None).await.unwrap();
        let id = conn.record.id;

        let closed = pool.disconnect("github", None).await.unwrap();
        assert_eq!(closed.status, ConnectionStatus::Disconnected);
        assert!(closed.closed_at.is_some());

        assert!(pool.get_by_id(id).await.is_none());
        assert!(pool.get("github", None).await.is_none());
        assert!(pool.disconnect("github", None).await.is_none());

        let fresh = pool.get_or_create("github", &config(), None).await.unwrap();
        assert_ne!(fresh.record.id, id);
    }

    #[tokio::test]
    async fn test_disconnect_by_id() {
        let pool = pool_with(Arc::new(FakeConnector::new()));
        let conn = pool
            .get_or_create("github", &config(), Some("work"))
            .await
            .unwrap();

        let closed = pool.disconnect_by_id(conn.record.id).await.unwrap();
        assert_eq!(closed.instance.as_deref(), Some("work"));
        assert!(pool.disconnect_by_id(conn.record.id).await.is_none());
        assert!(pool.list_for_backend("github").await.is_empty());
    }

    #[tokio::test]
    async fn test_generated_tags_are_per_backend() {
        let pool = pool_with(Arc::new(FakeConnector::new()));

        let a1 = pool
            .get_or_create_with_generated_tag("a", &config())
            .await
            .unwrap();
        let a2 = pool
            .get_or_create_with_generated_tag("a", &config())
            .await
            .unwrap();
        let b1 = pool
            .get_or_create_with_generated_tag("b", &config())
            .await
            .unwrap();

        assert_eq!(a1.record.instance.as_deref(), Some("1"));
        assert_eq!(a2.record.instance.as_deref(), Some("2"));
        assert_eq!(b1.record.instance.as_deref(), Some("1"));
        assert_eq!(pool.list_for_backend("a").await.len(), 2);
    }

    #[tokio::test]
    async fn test_generated_tag_churn_leaves_no_bookkeeping() {
        let pool = pool_with(Arc::new(FakeConnector::new()));

        for _ in 0..200 {
            let conn = pool
                .get_or_create_with_generated_tag("a", &config())
                .await
                .unwrap();
            pool.disconnect_by_id(conn.record.id).await.unwrap();
        }

        assert!(pool.is_empty().await);
        assert_eq!(pool.create_locks.lock().await.len(), 0);
        assert_eq!(pool.state.lock().await.configs.len(), 0);

        // A reconnected generated tag is still forgotten once it goes away
        let conn = pool
            .get_or_create_with_generated_tag("a", &config())
            .await
            .unwrap();
        let tag = conn.record.instance.clone().unwrap();
        pool.reconnect("a", Some(&tag)).await.unwrap();
        pool.disconnect("a", Some(&tag)).await.unwrap();
        assert_eq!(pool.state.lock().await.configs.len(), 0);
        assert_eq!(pool.create_locks.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn test_named_instances_keep_config_for_reconnect() {
        let pool = pool_with(Arc::new(FakeConnector::new()));
        pool.get_or_create("a", &config(), Some("work")).await.unwrap();
        pool.disconnect("a", Some("work")).await.unwrap();

        assert_eq!(pool.create_locks.lock().await.len(), 0);
        let again = pool.reconnect("a", Some("work")).await.unwrap();
        assert!(again.created);
    }

    #[tokio::test]
    async fn test_failed_connect_registers_nothing() {
        let connector = Arc::new(FakeConnector::new().failing_connect("broken"));
        let pool = pool_with(connector);

        let err = pool.get_or_create("broken", &config(), None).await.unwrap_err();
        assert!(matches!(err, PoolError::Connect { .. }));
        assert!(pool.is_empty().await);

        // Nothing cached either, so reconnect has nothing to work from
        let err = pool.reconnect("broken", None).await.unwrap_err();
        assert!(matches!(err, PoolError::NoCachedConfig { .. }));
    }

    #[tokio::test]
    async fn test_reconnect_without_config_fails() {
        let pool = pool_with(Arc::new(FakeConnector::new()));
        assert!(matches!(
            pool.reconnect("never", None).await,
            Err(PoolError::NoCachedConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_creates_share_one_record() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(connector.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.get_or_create("github", &config(), None)
                        .await
                        .map(|c| c.record.id)
                })
            })
            .collect();

        let ids: Vec<u64> = futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(pool.create_locks.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_best_effort() {
        let connector = Arc::new(FakeConnector::new().failing_close());
        let pool = pool_with(connector.clone());
        pool.get_or_create("a", &config(), None).await.unwrap();
        pool.get_or_create("b", &config(), None).await.unwrap();

        let report = pool.shutdown().await;

        assert_eq!(report.failed, 2);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 2);
        assert!(pool.is_empty().await);
        assert!(pool.reconnect("a", None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_disconnects_after_threshold_not_before() {
        let options = PoolOptions {
            auto_disconnect: true,
            idle_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(1),
        };
        let pool = Arc::new(ConnectionPool::new(Arc::new(FakeConnector::new()), options));
        pool.start_reaper();
        pool.get_or_create("github", &config(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert_eq!(pool.list_all().await.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pool.list_all().await.is_empty());

        pool.stop_reaper();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_keeps_connection_alive() {
        let options = PoolOptions {
            auto_disconnect: true,
            idle_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(1),
        };
        let pool = Arc::new(ConnectionPool::new(Arc::new(FakeConnector::new()), options));
        pool.start_reaper();
        pool.get_or_create("github", &config(), None).await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            assert!(pool.get("github", None).await.is_some());
        }
        pool.stop_reaper();
    }
}
