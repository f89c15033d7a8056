//! # cmdlink-net
//!
//! Connection engine for cmdlink.
//!
//! This crate provides:
//! - Per-connection async I/O with ordered, atomic frame writes
//! - Request/response correlation through [`ResponsePromise`]
//! - Admission control bounding in-flight requests
//! - A background sweeper expiring unanswered requests
//! - Heartbeats on write-idle and closure on read-idle connections
//! - Channel lifecycle notification and a connection pool built on it
//! - Pluggable request handlers with their own executors

pub mod admission;
pub mod clock;
pub mod config;
pub mod connection;
pub mod echo;
pub mod error;
pub mod executor;
pub mod handler;
pub mod idle;
pub mod lifecycle;
pub mod metrics;
pub mod pending;
pub mod pool;
pub mod promise;
pub mod service;
pub mod sweeper;

pub use admission::{AdmissionController, AdmissionPermit};
pub use clock::{Clock, CommandIdGenerator, ManualClock, SystemClock};
pub use config::{Config, ConfigError, EngineConfig, MetricsConfig, NetworkConfig};
pub use connection::{Connection, ConnectionId};
pub use error::NetError;
pub use executor::{Executor, InlineExecutor, RuntimeExecutor};
pub use handler::{HandlerRegistry, RequestContext, RequestHandler, RequestHandlerFactory};
pub use idle::{IdleMonitor, IdleState};
pub use lifecycle::{ChannelEvent, ChannelEventKind, ChannelListener, LifecyclePublisher};
pub use metrics::Metrics;
pub use pending::{PendingConnections, PendingRequests};
pub use pool::ConnectionPool;
pub use promise::{CallResult, ResponsePromise};
pub use service::{NetService, NetServiceBuilder, ServiceConfig};
pub use sweeper::{SweepResult, TimeoutSweeper};
