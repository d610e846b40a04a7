//! Connection cache with delayed eviction
//!
//! A connection returned to the pool stays idle for `idle_timeout` before it
//! is shut down. Taking it again in the meantime cancels the eviction and
//! hands back the same connection. Removal from the idle map decides which
//! of take, eviction or clear owns an idle connection.

use crate::metrics::TrafficMetrics;
use crate::{ClusterError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Network addresses identifying one logical connection target
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSet(BTreeSet<String>);

impl AddressSet {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(addresses.into_iter().map(Into::into).collect())
    }

    pub fn single(address: impl Into<String>) -> Self {
        Self::new([address])
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for AddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "[{}]", joined.join(","))
    }
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn shutdown(&self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(
        &self,
        addresses: &AddressSet,
        attributes: &BTreeMap<String, String>,
    ) -> Result<Self::Conn>;
}

/// Handle to a pooled connection
pub struct PooledConnection<C> {
    id: u64,
    key: AddressSet,
    conn: Arc<C>,
}

impl<C> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addresses(&self) -> &AddressSet {
        &self.key
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }
}

impl<C> Clone for PooledConnection<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            key: self.key.clone(),
            conn: Arc::clone(&self.conn),
        }
    }
}

impl<C> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("addresses", &self.key)
            .finish()
    }
}

struct IdleEntry<C> {
    handle: PooledConnection<C>,
    eviction: JoinHandle<()>,
}

type IdleMap<C> = DashMap<AddressSet, IdleEntry<C>>;

/// Pool keyed by address set, at most one idle connection per key
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    idle_timeout: Duration,
    runtime: Handle,
    idle: Arc<IdleMap<F::Conn>>,
    checked_out: DashMap<u64, AddressSet>,
    next_id: AtomicU64,
    metrics: Option<TrafficMetrics>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool on the current tokio runtime
    pub fn new(factory: F, idle_timeout: Duration) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            ClusterError::Configuration(format!("connection pool requires a tokio runtime: {}", e))
        })?;
        Ok(Self {
            factory,
            idle_timeout,
            runtime,
            idle: Arc::new(DashMap::new()),
            checked_out: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: TrafficMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn checked_out_count(&self) -> usize {
        self.checked_out.len()
    }

    /// Reuse the idle connection for `addresses` or open a new one
    pub async fn take_or_create(
        &self,
        addresses: &AddressSet,
        attributes: &BTreeMap<String, String>,
    ) -> Result<PooledConnection<F::Conn>> {
        if let Some((_, entry)) = self.idle.remove(addresses) {
            entry.eviction.abort();
            self.set_idle_gauge();
            self.checked_out.insert(entry.handle.id, entry.handle.key.clone());
            debug!("Reusing idle connection {} to {}", entry.handle.id, addresses);
            return Ok(entry.handle);
        }

        let conn = self.factory.connect(addresses, attributes).await?;
        let handle = PooledConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key: addresses.clone(),
            conn: Arc::new(conn),
        };
        self.checked_out.insert(handle.id, handle.key.clone());
        if let Some(metrics) = &self.metrics {
            metrics.pool_connections_created_total.inc();
        }
        info!("Created connection {} to {}", handle.id, addresses);
        Ok(handle)
    }

    /// Return a connection; it is evicted unless taken again within the idle timeout
    pub async fn give_back(&self, handle: PooledConnection<F::Conn>) {
        if self.checked_out.remove(&handle.id).is_none() {
            warn!("Ignoring return of unknown connection {} to {}", handle.id, handle.key);
            return;
        }

        let surplus = match self.idle.entry(handle.key.clone()) {
            Entry::Occupied(_) => Some(handle),
            Entry::Vacant(slot) => {
                let eviction = self.schedule_eviction(handle.key.clone(), handle.id);
                debug!(
                    "Connection {} to {} idle, evicting in {:?}",
                    handle.id, handle.key, self.idle_timeout
                );
                slot.insert(IdleEntry { handle, eviction });
                None
            }
        };
        self.set_idle_gauge();

        if let Some(handle) = surplus {
            debug!("Connection {} to {} already cached idle, shutting down", handle.id, handle.key);
            handle.conn.shutdown().await;
        }
    }

    fn schedule_eviction(&self, key: AddressSet, id: u64) -> JoinHandle<()> {
        let idle = Arc::clone(&self.idle);
        let timeout = self.idle_timeout;
        let metrics = self.metrics.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some((_, entry)) = idle.remove_if(&key, |_, entry| entry.handle.id == id) else {
                return;
            };
            entry.handle.conn.shutdown().await;
            if let Some(metrics) = &metrics {
                metrics.pool_connections_evicted_total.inc();
                metrics.pool_idle_connections.set(idle.len() as i64);
            }
            info!("Evicted idle connection {} to {}", id, key);
        })
    }

    /// Shut down every idle connection; checked-out connections are untouched
    pub async fn clear(&self) {
        let keys: Vec<AddressSet> = self.idle.iter().map(|e| e.key().clone()).collect();
        let mut cleared = 0;
        for key in keys {
            if let Some((_, entry)) = self.idle.remove(&key) {
                entry.eviction.abort();
                entry.handle.conn.shutdown().await;
                cleared += 1;
            }
        }
        self.set_idle_gauge();
        info!("Cleared {} idle connection(s)", cleared);
    }

    fn set_idle_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.pool_idle_connections.set(self.idle.len() as i64);
        }
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        for entry in self.idle.iter() {
            entry.eviction.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    struct MockConnection {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn shutdown(&self) {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockFactory {
        counters: Arc<Counters>,
        fail: bool,
    }

    #[async_trait]
    impl ConnectionFactory for MockFactory {
        type Conn = MockConnection;

        async fn connect(
            &self,
            addresses: &AddressSet,
            _attributes: &BTreeMap<String, String>,
        ) -> Result<MockConnection> {
            if self.fail {
                return Err(ClusterError::ConnectionFailed {
                    address: addresses.to_string(),
                    reason: "refused".to_string(),
                });
            }
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(MockConnection {
                counters: self.counters.clone(),
            })
        }
    }

    const IDLE: Duration = Duration::from_secs(30);

    fn pool() -> (Arc<Counters>, ConnectionPool<MockFactory>) {
        let counters = Arc::new(Counters::default());
        let factory = MockFactory {
            counters: counters.clone(),
            fail: false,
        };
        (counters, ConnectionPool::new(factory, IDLE).unwrap())
    }

    fn key() -> AddressSet {
        AddressSet::new(["10.0.0.2:50051", "10.0.0.1:50051"])
    }

    #[test]
    fn test_requires_runtime() {
        let factory = MockFactory {
            counters: Arc::new(Counters::default()),
            fail: false,
        };
        assert!(matches!(
            ConnectionPool::new(factory, IDLE),
            Err(ClusterError::Configuration(_))
        ));
    }

    #[test]
    fn test_address_set_identity() {
        let reordered = AddressSet::new(["10.0.0.1:50051", "10.0.0.2:50051"]);
        assert_eq!(key(), reordered);
        assert_eq!(key().to_string(), "[10.0.0.1:50051,10.0.0.2:50051]");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_evicted_after_timeout() {
        let (counters, pool) = pool();
        let conn = pool.take_or_create(&key(), &BTreeMap::new()).await.unwrap();
        pool.give_back(conn).await;
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(IDLE - Duration::from_millis(1)).await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retake_cancels_eviction() {
        let (counters, pool) = pool();
        let first = pool.take_or_create(&key(), &BTreeMap::new()).await.unwrap();
        let id = first.id();
        pool.give_back(first).await;

        tokio::time::sleep(IDLE / 2).await;
        let again = pool.take_or_create(&key(), &BTreeMap::new()).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);

        tokio::time::sleep(IDLE * 2).await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(pool.checked_out_count(), 1);

        pool.give_back(again).await;
        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_idle_connection_shut_down_immediately() {
        let (counters, pool) = pool();
        let first = pool.take_or_create(&key(), &BTreeMap::new()).await.unwrap();
        let second = pool.take_or_create(&key(), &BTreeMap::new()).await.unwrap();
        assert_ne!(first.id(), second.id());

        pool.give_back(first).await;
        pool.give_back(second).await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_duplicate_returns_ignored() {
        let (counters, pool) = pool();
        let conn = pool.take_or_create(&key(), &BTreeMap::new()).await.unwrap();
        pool.give_back(conn.clone()).await;
        pool.give_back(conn).await;
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_shuts_down_idle_only() {
        let (counters, pool) = pool();
        let idle = pool.take_or_create(&key(), &BTreeMap::new()).await.unwrap();
        let busy = pool
            .take_or_create(&AddressSet::single("10.0.0.3:50051"), &BTreeMap::new())
            .await
            .unwrap();
        pool.give_back(idle).await;

        pool.clear().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.checked_out_count(), 1);

        tokio::time::sleep(IDLE * 2).await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        drop(busy);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let factory = MockFactory {
            counters: Arc::new(Counters::default()),
            fail: true,
        };
        let pool = ConnectionPool::new(factory, IDLE).unwrap();
        let err = pool.take_or_create(&key(), &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ClusterError::ConnectionFailed { .. }));
        assert_eq!(pool.checked_out_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_metrics() {
        let (_, pool) = pool();
        let metrics = TrafficMetrics::new().unwrap();
        let pool = pool.with_metrics(metrics.clone());
        let conn = pool.take_or_create(&key(), &BTreeMap::new()).await.unwrap();
        pool.give_back(conn).await;
        assert_eq!(metrics.pool_idle_connections.get(), 1);

        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        assert_eq!(metrics.pool_connections_created_total.get() as u64, 1);
        assert_eq!(metrics.pool_connections_evicted_total.get() as u64, 1);
        assert_eq!(metrics.pool_idle_connections.get(), 0);
    }
}
