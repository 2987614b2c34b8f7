use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bon::Builder;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::{BrokerError, Connection, Connector};

/// Limits for a connection [`Pool`].
#[derive(Debug, Clone, Builder)]
pub struct PoolConfig {
    /// Maximum number of idle connections kept for reuse.
    #[builder(default = 5)]
    pub max_idle: usize,

    /// Maximum number of connections leased at once. `0` means unbounded.
    #[builder(default = 10)]
    pub max_active: usize,

    /// Idle connections older than this are closed instead of reused.
    #[builder(default = Duration::from_secs(200))]
    pub idle_timeout: Duration,

    /// Connections older than this are closed on checkin or checkout.
    pub max_conn_lifetime: Option<Duration>,

    /// Upper bound on waiting for a lease when `max_active` is reached. Waits forever if unset.
    pub wait_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
}

struct IdleConn<T> {
    conn: T,
    created: Instant,
    idle_since: Instant,
}

struct Shared<C: Connector> {
    connector: Arc<C>,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn<C::Conn>>>,
    permits: Option<Arc<Semaphore>>,
    active: AtomicUsize,
}

impl<C: Connector> Shared<C> {
    fn expired(&self, created: Instant) -> bool {
        self.config
            .max_conn_lifetime
            .is_some_and(|lifetime| created.elapsed() >= lifetime)
    }

    fn take_idle(&self) -> Option<(C::Conn, Instant)> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(entry) = idle.pop_front() {
            if entry.idle_since.elapsed() >= self.config.idle_timeout
                || self.expired(entry.created)
                || !entry.conn.is_reusable()
            {
                debug!("Closing stale idle connection");
                continue;
            }
            return Some((entry.conn, entry.created));
        }

        None
    }

    fn checkin(&self, conn: C::Conn, created: Instant) {
        if !conn.is_reusable() || self.expired(created) {
            debug!("Closing connection on checkin");
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() >= self.config.max_idle {
            return;
        }
        idle.push_front(IdleConn {
            conn,
            created,
            idle_since: Instant::now(),
        });
    }
}

/// A bounded pool of reusable broker connections.
///
/// Leasing blocks while `max_active` connections are checked out. A lease is returned when the
/// [`PooledConnection`] is dropped; connections that report themselves as not reusable (still
/// subscribed, severed) are closed instead of being handed to the next caller.
pub struct Pool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> Pool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self::build(Arc::new(connector), config)
    }

    /// A new pool dialing through the same connector with the same limits.
    ///
    /// The two pools share no connections and no leases, so long-held leases in one (blocking
    /// pops, subscriptions) never starve short-lived ones in the other.
    pub fn sibling(&self) -> Self {
        Self::build(Arc::clone(&self.shared.connector), self.shared.config.clone())
    }

    fn build(connector: Arc<C>, config: PoolConfig) -> Self {
        let permits = (config.max_active > 0).then(|| Arc::new(Semaphore::new(config.max_active)));

        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                idle: Mutex::new(VecDeque::new()),
                permits,
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Lease a connection, reusing an idle one when possible.
    pub async fn get(&self) -> Result<PooledConnection<C>, BrokerError> {
        let permit = match &self.shared.permits {
            Some(permits) => Some(self.acquire(Arc::clone(permits)).await?),
            None => None,
        };

        let (conn, created) = match self.shared.take_idle() {
            Some(reused) => reused,
            None => (self.shared.connector.connect().await?, Instant::now()),
        };

        self.shared.active.fetch_add(1, Ordering::SeqCst);

        Ok(PooledConnection {
            conn: Some(conn),
            created,
            discard: false,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    async fn acquire(&self, permits: Arc<Semaphore>) -> Result<OwnedSemaphorePermit, BrokerError> {
        let acquire = permits.acquire_owned();

        let permit = match self.shared.config.wait_timeout {
            Some(wait) => tokio::time::timeout(wait, acquire)
                .await
                .map_err(|_| BrokerError::PoolTimeout(wait))?,
            None => acquire.await,
        };

        permit.map_err(|_| BrokerError::ConnectionClosed)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.shared.active.load(Ordering::SeqCst),
            idle: self
                .shared
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Close every idle connection. Leased connections are unaffected.
    pub fn clear_idle(&self) {
        self.shared
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

/// A connection leased from a [`Pool`]. Returned to the pool on drop.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Conn>,
    created: Instant,
    discard: bool,
    shared: Arc<Shared<C>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<C: Connector> PooledConnection<C> {
    /// Close the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Conn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled connection is present until dropped")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection is present until dropped")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.discard {
                self.shared.checkin(conn, self.created);
            }
        }
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn pool(config: PoolConfig) -> (MemoryBroker, Pool<MemoryBroker>) {
        let broker = MemoryBroker::new();
        (broker.clone(), Pool::new(broker, config))
    }

    #[tokio::test]
    async fn test_lease_and_return() {
        let (broker, pool) = pool(PoolConfig::default());

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.stats(), PoolStats { active: 1, idle: 0 });

        drop(conn);
        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 1 });

        // The idle connection is reused rather than dialing a new one
        let _conn = pool.get().await.unwrap();
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_max_idle_bounds_reuse() {
        let (_broker, pool) = pool(PoolConfig::builder().max_idle(1).build());

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        drop(a);
        drop(b);

        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 1 });
    }

    #[tokio::test]
    async fn test_max_active_blocks_until_release() {
        let (_broker, pool) = pool(
            PoolConfig::builder()
                .max_active(1)
                .wait_timeout(Duration::from_millis(50))
                .build(),
        );

        let held = pool.get().await.unwrap();
        let waited = pool.get().await;
        assert!(matches!(waited, Err(BrokerError::PoolTimeout(_))));

        drop(held);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_discard_does_not_return_connection() {
        let (_broker, pool) = pool(PoolConfig::default());

        let conn = pool.get().await.unwrap();
        conn.discard();

        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 0 });
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_stale_connections() {
        let (broker, pool) = pool(
            PoolConfig::builder()
                .idle_timeout(Duration::from_millis(10))
                .build(),
        );

        drop(pool.get().await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let _conn = pool.get().await.unwrap();
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_sibling_has_its_own_leases() {
        let (broker, pool) = pool(PoolConfig::builder().max_active(1).build());
        let sibling = pool.sibling();

        let _held = pool.get().await.unwrap();
        let other = tokio::time::timeout(Duration::from_millis(50), sibling.get()).await;
        assert!(other.unwrap().is_ok());

        assert_eq!(sibling.config().max_active, 1);
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_severed_connection_not_reused() {
        let (broker, pool) = pool(PoolConfig::default());

        let conn = pool.get().await.unwrap();
        broker.sever();
        drop(conn);

        assert_eq!(pool.stats().idle, 0);
    }
}
