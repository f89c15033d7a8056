//! Channel lifecycle notification.
//!
//! Every state change of a connection is published twice: to registered
//! [`ChannelListener`]s on the listener executor, and as a [`ChannelEvent`]
//! on a broadcast channel for async subscribers.

use crate::connection::{Connection, ConnectionId};
use crate::error::NetError;
use crate::executor::Executor;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Kind of lifecycle transition.
#[derive(Debug, Clone)]
pub enum ChannelEventKind {
    Connected,
    Closed,
    ReadIdle,
    WriteIdle,
    ExceptionCaught(NetError),
}

impl fmt::Display for ChannelEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEventKind::Connected => write!(f, "CONNECT"),
            ChannelEventKind::Closed => write!(f, "CLOSE"),
            ChannelEventKind::ReadIdle => write!(f, "READ_IDLE"),
            ChannelEventKind::WriteIdle => write!(f, "WRITE_IDLE"),
            ChannelEventKind::ExceptionCaught(_) => write!(f, "EXCEPTION"),
        }
    }
}

/// Event data sent through the broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub connection_id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub kind: ChannelEventKind,
}

/// Receives lifecycle callbacks. Every method defaults to doing nothing.
pub trait ChannelListener: Send + Sync {
    fn on_connected(&self, _connection: &Connection) {}

    fn on_closed(&self, _connection: &Connection) {}

    fn on_read_idle(&self, _connection: &Connection) {}

    fn on_write_idle(&self, _connection: &Connection) {}

    fn on_exception(&self, _connection: &Connection, _error: &NetError) {}
}

/// Fans lifecycle transitions out to listeners and subscribers.
pub struct LifecyclePublisher {
    /// Registered listeners by registration id.
    listeners: DashMap<u64, Arc<dyn ChannelListener>>,

    next_listener_id: AtomicU64,

    /// Broadcast channel for async subscribers.
    sender: broadcast::Sender<ChannelEvent>,

    /// Runs listener callbacks.
    executor: Arc<dyn Executor>,
}

impl LifecyclePublisher {
    pub fn new(channel_capacity: usize, executor: Arc<dyn Executor>) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            sender,
            executor,
        }
    }

    /// Registers a listener. Returns an id for [`remove_listener`](Self::remove_listener).
    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);
        id
    }

    /// Returns true if the listener was found and removed.
    pub fn remove_listener(&self, id: u64) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Subscribes to the event stream. Slow subscribers observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }

    pub fn publish_connected(&self, connection: &Connection) {
        self.publish(connection, ChannelEventKind::Connected);
    }

    pub fn publish_closed(&self, connection: &Connection) {
        self.publish(connection, ChannelEventKind::Closed);
    }

    pub fn publish_read_idle(&self, connection: &Connection) {
        self.publish(connection, ChannelEventKind::ReadIdle);
    }

    pub fn publish_write_idle(&self, connection: &Connection) {
        self.publish(connection, ChannelEventKind::WriteIdle);
    }

    pub fn publish_exception(&self, connection: &Connection, error: &NetError) {
        self.publish(connection, ChannelEventKind::ExceptionCaught(error.clone()));
    }

    fn publish(&self, connection: &Connection, kind: ChannelEventKind) {
        tracing::trace!("{} {} ({})", kind, connection.id(), connection.peer_addr());

        // Snapshot so no map guard is held while listeners run.
        let listeners: Vec<Arc<dyn ChannelListener>> =
            self.listeners.iter().map(|entry| entry.value().clone()).collect();

        for listener in listeners {
            let connection = connection.clone();
            let kind = kind.clone();
            self.executor.execute(Box::new(move || match &kind {
                ChannelEventKind::Connected => listener.on_connected(&connection),
                ChannelEventKind::Closed => listener.on_closed(&connection),
                ChannelEventKind::ReadIdle => listener.on_read_idle(&connection),
                ChannelEventKind::WriteIdle => listener.on_write_idle(&connection),
                ChannelEventKind::ExceptionCaught(error) => listener.on_exception(&connection, error),
            }));
        }

        // Ignore send errors (no subscribers)
        let _ = self.sender.send(ChannelEvent {
            connection_id: connection.id(),
            peer_addr: connection.peer_addr(),
            kind,
        });
    }
}

impl fmt::Debug for LifecyclePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecyclePublisher")
            .field("listeners", &self.listeners.len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
