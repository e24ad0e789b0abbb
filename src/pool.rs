//! Connection pooling.
//!
//! Each endpoint gets a [`Pool`]: a bounded set of idle connections plus a
//! live-count cap. Acquire prefers a healthy idle connection, creates one
//! while under the cap, and otherwise waits for a release until the acquire
//! deadline. The [`PoolRegistry`] maps endpoints to pools and creates them on
//! first use.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::{ClientConfig, Endpoint};
use crate::connection::Connection;
use crate::errors::{Error, Result};

struct PoolState {
    idle: VecDeque<Connection>,
    /// Connections alive for this endpoint: idle + checked out.
    live: usize,
}

/// A bounded connection pool for one endpoint.
pub struct Pool {
    endpoint: Endpoint,
    config: Arc<ClientConfig>,
    state: Mutex<PoolState>,
    released: Notify,
}

impl Pool {
    fn new(endpoint: Endpoint, config: Arc<ClientConfig>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
            }),
            released: Notify::new(),
        })
    }

    /// Checks out a connection: a healthy idle one, a freshly-connected one
    /// while under the live cap, or an error after the acquire deadline.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            let connect_slot = {
                let mut state = self.state.lock();
                while let Some(conn) = state.idle.pop_back() {
                    if conn.is_usable(self.config.idle_timeout) {
                        return Ok(PooledConnection::new(conn, self.clone()));
                    }
                    // stale or broken; closing it frees a slot
                    state.live -= 1;
                }
                if state.live < self.config.max_total_per_pool {
                    state.live += 1;
                    true
                } else {
                    false
                }
            };

            if connect_slot {
                match self.connect_with_retry().await {
                    Ok(conn) => return Ok(PooledConnection::new(conn, self.clone())),
                    Err(e) => {
                        self.state.lock().live -= 1;
                        self.released.notify_one();
                        return Err(e);
                    }
                }
            }

            if timeout_at(deadline, self.released.notified()).await.is_err() {
                return Err(Error::PoolExhausted {
                    endpoint: self.endpoint.to_string(),
                });
            }
        }
    }

    /// Hands a connection back. Broken connections are discarded; healthy
    /// ones return to the idle set unless it is full.
    pub fn release(&self, mut pooled: PooledConnection) {
        let Some(conn) = pooled.conn.take() else {
            return;
        };

        {
            let mut state = self.state.lock();
            if conn.is_broken() {
                debug!(endpoint = %self.endpoint, "discarding broken connection");
                state.live -= 1;
            } else if state.idle.len() >= self.config.max_idle_per_pool {
                state.live -= 1;
            } else {
                state.idle.push_back(conn);
            }
            Self::sweep_locked(&mut state, &self.config);
        }
        self.released.notify_one();
    }

    /// Evicts idle connections past the idle TTL.
    pub fn sweep(&self) {
        let freed = {
            let mut state = self.state.lock();
            Self::sweep_locked(&mut state, &self.config)
        };
        if freed > 0 {
            debug!(endpoint = %self.endpoint, freed, "swept idle connections");
            self.released.notify_one();
        }
    }

    fn sweep_locked(state: &mut PoolState, config: &ClientConfig) -> usize {
        let before = state.idle.len();
        state
            .idle
            .retain(|conn| conn.is_usable(config.idle_timeout));
        let freed = before - state.idle.len();
        state.live -= freed;
        freed
    }

    /// Drops every idle connection. Checked-out connections are discarded by
    /// their guards when they come back.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.idle.len();
        state.idle.clear();
        state.live -= dropped;
        drop(state);
        self.released.notify_waiters();
    }

    /// Idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Live connections: idle plus checked out.
    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    fn discard(&self, conn: Connection) {
        drop(conn);
        self.state.lock().live -= 1;
        self.released.notify_one();
    }

    /// Connects, retrying per the reconnect policy. Retries happen only
    /// here, before any frame is on the wire.
    async fn connect_with_retry(&self) -> Result<Connection> {
        let mut attempt = 0u32;
        loop {
            match Connection::connect(&self.endpoint, &self.config).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    if !self.config.enable_reconnect || attempt >= self.config.max_reconnect {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(
                        endpoint = %self.endpoint,
                        attempt,
                        max = self.config.max_reconnect,
                        error = %e,
                        "connect failed, retrying"
                    );
                    sleep(self.config.reconnect_interval).await;
                }
            }
        }
    }
}

/// A checked-out connection.
///
/// Dereferences to [`Connection`]. Hand it back with [`Pool::release`]; if it
/// is dropped instead (a cancelled operation, an early return), the guard
/// discards it rather than re-pooling a connection in an unknown state.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<Pool>,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<Pool>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already released")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

/// Endpoint-to-pool map, shared by every operation.
pub struct PoolRegistry {
    config: Arc<ClientConfig>,
    pools: RwLock<HashMap<Endpoint, Arc<Pool>>>,
}

impl PoolRegistry {
    /// Creates an empty registry.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the pool for an endpoint, creating it on first use.
    pub fn pool(&self, endpoint: &Endpoint) -> Arc<Pool> {
        if let Some(pool) = self.pools.read().get(endpoint) {
            return pool.clone();
        }
        let mut pools = self.pools.write();
        pools
            .entry(endpoint.clone())
            .or_insert_with(|| Pool::new(endpoint.clone(), self.config.clone()))
            .clone()
    }

    /// Sweeps every pool.
    pub fn sweep_all(&self) {
        for pool in self.pools.read().values() {
            pool.sweep();
        }
    }

    /// Drops all idle connections in every pool.
    pub fn clear(&self) {
        for pool in self.pools.read().values() {
            pool.clear();
        }
    }
}
