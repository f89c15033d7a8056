//! Pending request tracking.

use crate::connection::ConnectionId;
use crate::promise::ResponsePromise;
use dashmap::DashMap;
use std::sync::Arc;

/// Unresolved requests on one connection, keyed by command id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    requests: DashMap<u32, Arc<ResponsePromise>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a promise, returning any promise it displaced.
    pub fn insert(&self, promise: Arc<ResponsePromise>) -> Option<Arc<ResponsePromise>> {
        self.requests.insert(promise.command_id(), promise)
    }

    pub fn remove(&self, command_id: u32) -> Option<Arc<ResponsePromise>> {
        self.requests.remove(&command_id).map(|(_, promise)| promise)
    }

    pub fn contains(&self, command_id: u32) -> bool {
        self.requests.contains_key(&command_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Removes and returns every promise that is past its deadline or
    /// already resolved elsewhere.
    ///
    /// Returned promises are not resolved here; callers resolve them after
    /// every map guard has been released.
    pub fn expire(&self, now_millis: i64) -> Vec<Arc<ResponsePromise>> {
        let stale = |promise: &Arc<ResponsePromise>| {
            (promise.is_sent() && promise.is_expired(now_millis)) || promise.is_done()
        };

        let ids: Vec<u32> = self
            .requests
            .iter()
            .filter(|entry| stale(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.requests.remove_if(&id, |_, p| stale(p)).map(|(_, p)| p))
            .collect()
    }

    /// Removes and returns every tracked promise.
    pub fn drain(&self) -> Vec<Arc<ResponsePromise>> {
        let ids: Vec<u32> = self.requests.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// Connections that currently have at least one pending request.
///
/// Walked by the timeout sweeper. A connection joins when a tracked request
/// starts writing and leaves when its map drains or the connection closes.
#[derive(Debug, Default)]
pub struct PendingConnections {
    connections: DashMap<ConnectionId, Arc<PendingRequests>>,
}

impl PendingConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, id: ConnectionId, pending: &Arc<PendingRequests>) {
        self.connections.entry(id).or_insert_with(|| pending.clone());
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    /// Drops the connection from the set if it has nothing pending.
    pub fn release_if_idle(&self, id: ConnectionId) -> bool {
        self.connections
            .remove_if(&id, |_, pending| pending.is_empty())
            .is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Total pending requests across every tracked connection.
    pub fn pending_requests(&self) -> usize {
        self.connections.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn snapshot(&self) -> Vec<(ConnectionId, Arc<PendingRequests>)> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionPermit;
    use crate::error::NetError;
    use crate::executor::InlineExecutor;
    use cmdlink_protocol::{Command, Header, RawCommand};
    use std::time::Duration;

    fn unsent(id: u32, created_at: i64, timeout_ms: u64) -> Arc<ResponsePromise> {
        let request: Arc<dyn Command> = Arc::new(RawCommand::new(Header::request(id, 1, 0), "x"));
        Arc::new(ResponsePromise::new(
            request,
            Duration::from_millis(timeout_ms),
            created_at,
            AdmissionPermit::unbounded(),
            Arc::new(InlineExecutor),
        ))
    }

    fn promise(id: u32, created_at: i64, timeout_ms: u64) -> Arc<ResponsePromise> {
        let promise = unsent(id, created_at, timeout_ms);
        promise.mark_sent();
        promise
    }

    #[test]
    fn test_insert_remove() {
        let pending = PendingRequests::new();
        assert!(pending.insert(promise(1, 0, 100)).is_none());
        assert!(pending.insert(promise(2, 0, 100)).is_none());
        assert_eq!(pending.len(), 2);
        assert!(pending.contains(1));

        assert_eq!(pending.remove(1).unwrap().command_id(), 1);
        assert!(pending.remove(1).is_none());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_expire_removes_only_stale() {
        let pending = PendingRequests::new();
        pending.insert(promise(1, 0, 100));
        pending.insert(promise(2, 0, 500));
        let resolved = promise(3, 0, 10_000);
        resolved.set_failure(NetError::ConnectionClosed);
        pending.insert(resolved);

        let mut expired: Vec<u32> = pending.expire(100).iter().map(|p| p.command_id()).collect();
        expired.sort_unstable();
        assert_eq!(expired, vec![1, 3]);
        assert_eq!(pending.len(), 1);
        assert!(pending.contains(2));

        assert!(pending.expire(499).is_empty());
        assert_eq!(pending.expire(500).len(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unsent_never_expires() {
        let pending = PendingRequests::new();
        let waiting = unsent(1, 0, 100);
        pending.insert(waiting.clone());

        assert!(pending.expire(10_000).is_empty());
        assert!(pending.contains(1));

        waiting.mark_sent();
        assert_eq!(pending.expire(10_000).len(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_drain() {
        let pending = PendingRequests::new();
        for id in 1..=5 {
            pending.insert(promise(id, 0, 100));
        }
        assert_eq!(pending.drain().len(), 5);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_connection_set() {
        let set = PendingConnections::new();
        let id = ConnectionId::new();
        let pending = Arc::new(PendingRequests::new());

        pending.insert(promise(1, 0, 100));
        set.track(id, &pending);
        set.track(id, &pending);
        assert_eq!(set.len(), 1);
        assert_eq!(set.pending_requests(), 1);

        assert!(!set.release_if_idle(id));
        pending.remove(1);
        assert!(set.release_if_idle(id));
        assert!(!set.contains(id));
        assert!(set.is_empty());
    }

    #[test]
    fn test_snapshot_shares_maps() {
        let set = PendingConnections::new();
        let id = ConnectionId::new();
        let pending = Arc::new(PendingRequests::new());
        set.track(id, &pending);

        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, id);
        assert!(Arc::ptr_eq(&snapshot[0].1, &pending));
    }
}
