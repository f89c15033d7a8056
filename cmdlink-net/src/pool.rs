//! Connection pool keyed by peer address.

use crate::connection::Connection;
use crate::error::NetError;
use crate::lifecycle::ChannelListener;
use crate::service::NetService;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

/// Caches one connection per peer and connects on a miss.
///
/// Dead connections are evicted as soon as the service publishes their
/// `Closed` or `ExceptionCaught` event.
pub struct ConnectionPool {
    service: Arc<NetService>,
    connections: DashMap<SocketAddr, Connection>,
    listener_id: u64,
}

impl ConnectionPool {
    pub fn new(service: Arc<NetService>) -> Arc<Self> {
        Arc::new_cyclic(|pool: &Weak<ConnectionPool>| {
            let listener_id = service.add_listener(Arc::new(Evictor { pool: pool.clone() }));
            Self {
                service,
                connections: DashMap::new(),
                listener_id,
            }
        })
    }

    /// Returns the pooled connection to `addr`, connecting if there is none.
    pub async fn get(&self, addr: SocketAddr) -> Result<Connection, NetError> {
        if let Some(connection) = self.get_if_open(addr) {
            return Ok(connection);
        }

        let connection = self.service.connect(addr).await?;

        // Another caller may have connected meanwhile; keep whichever is open.
        let pooled = {
            let mut entry = self
                .connections
                .entry(addr)
                .or_insert_with(|| connection.clone());
            if entry.is_closed() {
                *entry = connection.clone();
            }
            entry.clone()
        };
        if pooled.id() != connection.id() {
            connection.close();
        }
        Ok(pooled)
    }

    /// Returns the pooled connection to `addr` if it is still open.
    pub fn get_if_open(&self, addr: SocketAddr) -> Option<Connection> {
        self.connections
            .get(&addr)
            .map(|entry| entry.value().clone())
            .filter(|connection| !connection.is_closed())
    }

    /// Removes `connection` if it is the one pooled for its peer.
    pub fn evict(&self, connection: &Connection) -> bool {
        let evicted = self
            .connections
            .remove_if(&connection.peer_addr(), |_, pooled| pooled.id() == connection.id())
            .is_some();
        if evicted {
            tracing::debug!("Evicted {} ({}) from pool", connection.id(), connection.peer_addr());
        }
        evicted
    }

    /// Closes and forgets every pooled connection.
    pub fn close_all(&self) {
        let connections: Vec<Connection> = self.connections.iter().map(|e| e.value().clone()).collect();
        self.connections.clear();
        for connection in connections {
            connection.close();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.service.remove_listener(self.listener_id);
    }
}

struct Evictor {
    pool: Weak<ConnectionPool>,
}

impl ChannelListener for Evictor {
    fn on_closed(&self, connection: &Connection) {
        if let Some(pool) = self.pool.upgrade() {
            pool.evict(connection);
        }
    }

    fn on_exception(&self, connection: &Connection, _error: &NetError) {
        if let Some(pool) = self.pool.upgrade() {
            pool.evict(connection);
        }
    }
}
