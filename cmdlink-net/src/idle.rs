//! Read and write idle detection.

use std::time::Duration;
use tokio::time::Instant;

/// Which side of a connection went quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    /// Nothing was read within the read timeout. The connection is closed.
    ReaderIdle,
    /// Nothing was written within the write timeout. A heartbeat is sent.
    WriterIdle,
}

/// Tracks last read and write times against optional timeouts.
#[derive(Debug, Clone)]
pub struct IdleMonitor {
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    last_read: Instant,
    last_write: Instant,
}

impl IdleMonitor {
    pub fn new(read_timeout: Option<Duration>, write_timeout: Option<Duration>, now: Instant) -> Self {
        Self {
            read_timeout,
            write_timeout,
            last_read: now,
            last_write: now,
        }
    }

    pub fn record_read(&mut self, now: Instant) {
        self.last_read = now;
    }

    pub fn record_write(&mut self, now: Instant) {
        self.last_write = now;
    }

    /// The next instant at which [`poll`](Self::poll) may report idleness.
    pub fn next_deadline(&self) -> Option<Instant> {
        let read = self.read_timeout.map(|t| self.last_read + t);
        let write = self.write_timeout.map(|t| self.last_write + t);
        match (read, write) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }

    /// Reports at most one idle state, reader first.
    ///
    /// Each report restarts that side's window, so a quiet writer is reported
    /// once per write timeout.
    pub fn poll(&mut self, now: Instant) -> Option<IdleState> {
        if let Some(timeout) = self.read_timeout {
            if now >= self.last_read + timeout {
                self.last_read = now;
                return Some(IdleState::ReaderIdle);
            }
        }
        if let Some(timeout) = self.write_timeout {
            if now >= self.last_write + timeout {
                self.last_write = now;
                return Some(IdleState::WriterIdle);
            }
        }
        None
    }
}
