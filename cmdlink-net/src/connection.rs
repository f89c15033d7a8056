//! Connections and their I/O task.
//!
//! Each TCP connection is split between two tasks. The reader decodes
//! frames, routes responses and watches idle timers. The writer drains the
//! outbound queue in submission order. Callers only hold a cloneable
//! [`Connection`] handle that queues frames for the writer.
//!
//! A tracked request enters the connection's pending map before its first
//! byte is written, so its response always finds the entry. It only becomes
//! eligible for timeout once the whole frame is on the wire.

use crate::clock::{Clock, CommandIdGenerator};
use crate::error::NetError;
use crate::handler::{self, RequestContext, RequestHandlerFactory};
use crate::idle::{IdleMonitor, IdleState};
use crate::lifecycle::LifecyclePublisher;
use crate::metrics::Metrics;
use crate::pending::{PendingConnections, PendingRequests};
use crate::promise::ResponsePromise;
use bytes::BytesMut;
use cmdlink_protocol::{Command, CommandFactory, Decoder, Encoder, Heartbeat};
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique id of a connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Work queued for the I/O task.
pub(crate) enum Outbound {
    Frame {
        bytes: BytesMut,
        on_written: WriteAction,
    },
    Close,
}

/// What to do with a promise around the write of its frame.
pub(crate) enum WriteAction {
    None,
    /// Insert into the pending map before writing and wait for the response.
    Track(Arc<ResponsePromise>),
    /// Resolve right away; no response is coming.
    Resolve(Arc<ResponsePromise>),
}

impl WriteAction {
    fn fail(self, error: NetError) {
        match self {
            WriteAction::Track(promise) | WriteAction::Resolve(promise) => {
                promise.set_failure(error);
            }
            WriteAction::None => {}
        }
    }
}

struct Shared {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Arc<PendingRequests>,
    closed: AtomicBool,
    encoder: Encoder,
}

/// Handle to a live or closed connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    fn new(
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        encoder: Encoder,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Self {
            shared: Arc::new(Shared {
                id: ConnectionId::new(),
                peer_addr,
                local_addr,
                outbound,
                pending: Arc::new(PendingRequests::new()),
                closed: AtomicBool::new(false),
                encoder,
            }),
        };
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of tracked requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub(crate) fn pending(&self) -> &Arc<PendingRequests> {
        &self.shared.pending
    }

    /// Closes the connection after frames already queued are written.
    ///
    /// Pending requests resolve with [`NetError::ConnectionClosed`].
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            let _ = self.shared.outbound.send(Outbound::Close);
        }
    }

    /// Queues an encoded frame. On failure the action's promise, if any,
    /// is resolved with [`NetError::ConnectionClosed`].
    pub(crate) fn enqueue(&self, bytes: BytesMut, on_written: WriteAction) -> Result<(), NetError> {
        if self.is_closed() {
            on_written.fail(NetError::ConnectionClosed);
            return Err(NetError::ConnectionClosed);
        }
        self.shared
            .outbound
            .send(Outbound::Frame { bytes, on_written })
            .map_err(|mpsc::error::SendError(outbound)| {
                if let Outbound::Frame { on_written, .. } = outbound {
                    on_written.fail(NetError::ConnectionClosed);
                }
                NetError::ConnectionClosed
            })
    }

    /// Writes a response frame without tracking anything.
    pub fn send_response(&self, response: &dyn Command) -> Result<(), NetError> {
        let bytes = self.shared.encoder.encode(response)?;
        self.enqueue(bytes, WriteAction::None)
    }

    /// A connection with no socket behind it. Queued frames land in the
    /// returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        Self::new(addr, addr, Encoder::default())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// How a connection came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Accepted by one of the service's listeners.
    Accepted,
    /// Opened by the service itself.
    Dialed,
}

/// Engine state shared by every connection of a service.
pub(crate) struct ConnectionContext {
    pub(crate) commands: Arc<dyn CommandFactory>,
    pub(crate) handlers: Arc<dyn RequestHandlerFactory>,
    pub(crate) lifecycle: Arc<LifecyclePublisher>,
    pub(crate) pending_connections: Arc<PendingConnections>,
    pub(crate) connections: DashMap<ConnectionId, Connection>,
    /// Live connections with [`Origin::Accepted`].
    pub(crate) accepted: AtomicUsize,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<CommandIdGenerator>,
    pub(crate) encoder: Encoder,
    pub(crate) heartbeat_command_type: u32,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) read_buffer_size: usize,
    pub(crate) metrics: Option<Arc<Metrics>>,
}

impl ConnectionContext {
    /// Registers an established stream and spawns its reader and writer.
    pub(crate) fn spawn(self: &Arc<Self>, stream: TcpStream, origin: Origin) -> Result<Connection, NetError> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        let (read_half, write_half) = stream.into_split();

        let (connection, outbound) = Connection::new(peer_addr, local_addr, self.encoder);
        self.connections.insert(connection.id(), connection.clone());
        if origin == Origin::Accepted {
            self.accepted.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(metrics) = &self.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let now = Instant::now();
        let (written_tx, written) = watch::channel(now);
        let stop = Arc::new(Notify::new());
        let writer = ConnectionWriter {
            connection: connection.clone(),
            stream: write_half,
            outbound,
            written: written_tx,
            in_flight: None,
            ctx: self.clone(),
        };
        let writer = tokio::spawn(writer.run(stop.clone()));

        let driver = ConnectionDriver {
            connection: connection.clone(),
            origin,
            stream: read_half,
            written,
            writer: Some(writer),
            stop,
            decoder: Decoder::new(self.commands.clone(), self.encoder.max_frame_length()),
            idle: IdleMonitor::new(self.read_timeout, self.write_timeout, now),
            ctx: self.clone(),
        };
        tokio::spawn(driver.run());

        Ok(connection)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::Acquire)
    }

    pub(crate) fn close_all(&self) {
        let connections: Vec<Connection> = self.connections.iter().map(|e| e.value().clone()).collect();
        for connection in connections {
            connection.close();
        }
    }
}

/// Writes queued frames for one connection.
struct ConnectionWriter {
    connection: Connection,
    stream: OwnedWriteHalf,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Time of the last completed write, watched by the reader.
    written: watch::Sender<Instant>,
    /// Action of the frame currently being written.
    in_flight: Option<WriteAction>,
    ctx: Arc<ConnectionContext>,
}

impl ConnectionWriter {
    async fn run(mut self, stop: Arc<Notify>) -> Result<(), NetError> {
        let result = tokio::select! {
            result = self.write_loop() => result,
            _ = stop.notified() => Ok(()),
        };

        if let Some(action) = self.in_flight.take() {
            action.fail(NetError::ConnectionClosed);
        }
        // Anything still queued never reached the wire.
        self.outbound.close();
        while let Ok(outbound) = self.outbound.try_recv() {
            if let Outbound::Frame { on_written, .. } = outbound {
                on_written.fail(NetError::ConnectionClosed);
            }
        }
        let _ = self.stream.shutdown().await;
        result
    }

    async fn write_loop(&mut self) -> Result<(), NetError> {
        while let Some(outbound) = self.outbound.recv().await {
            let (bytes, on_written) = match outbound {
                Outbound::Frame { bytes, on_written } => (bytes, on_written),
                Outbound::Close => return Ok(()),
            };
            if let WriteAction::Track(promise) = &on_written {
                self.track(promise);
            }

            self.in_flight = Some(on_written);
            let write = self.stream.write_all(&bytes).await;
            let on_written = self.in_flight.take().unwrap_or(WriteAction::None);

            if let Err(e) = write {
                let error = NetError::from(e);
                if let WriteAction::Track(promise) = &on_written {
                    self.connection.pending().remove(promise.command_id());
                }
                on_written.fail(error.clone());
                return Err(error);
            }
            self.written.send_replace(Instant::now());
            if let WriteAction::Track(promise) = &on_written {
                promise.mark_sent();
            }

            if let WriteAction::Resolve(promise) = on_written {
                promise.resolve(Ok(None));
            }
        }
        Ok(())
    }

    fn track(&self, promise: &Arc<ResponsePromise>) {
        // Already resolved elsewhere, e.g. a synchronous caller gave up.
        if promise.is_done() {
            return;
        }

        let pending = self.connection.pending();
        if let Some(displaced) = pending.insert(promise.clone()) {
            displaced.set_failure(NetError::InvalidRequest(format!(
                "command id {} reused while still pending",
                displaced.command_id()
            )));
        }
        self.ctx.pending_connections.track(self.connection.id(), pending);

        if let Some(metrics) = &self.ctx.metrics {
            metrics.pending_requests.set(self.ctx.pending_connections.pending_requests() as f64);
        }
    }
}

/// Reads frames for one connection and owns its lifecycle.
struct ConnectionDriver {
    connection: Connection,
    origin: Origin,
    stream: OwnedReadHalf,
    written: watch::Receiver<Instant>,
    writer: Option<JoinHandle<Result<(), NetError>>>,
    stop: Arc<Notify>,
    decoder: Decoder,
    idle: IdleMonitor,
    ctx: Arc<ConnectionContext>,
}

impl ConnectionDriver {
    async fn run(mut self) {
        tracing::debug!(
            "{} established ({} -> {})",
            self.connection.id(),
            self.connection.local_addr(),
            self.connection.peer_addr()
        );
        self.ctx.lifecycle.publish_connected(&self.connection);

        let result = self.drive().await;
        self.finish(result).await;
    }

    async fn drive(&mut self) -> Result<(), NetError> {
        let mut buf = vec![0u8; self.ctx.read_buffer_size.max(512)];

        loop {
            let idle_deadline = self.idle.next_deadline();

            tokio::select! {
                read = self.stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        tracing::debug!("{} closed by peer", self.connection.id());
                        return Ok(());
                    }
                    self.idle.record_read(Instant::now());
                    self.decoder.extend(&buf[..n]);
                    while let Some(command) = self.decoder.decode_command()? {
                        self.on_command(command);
                    }
                }

                changed = self.written.changed() => match changed {
                    Ok(()) => {
                        let at = *self.written.borrow_and_update();
                        self.idle.record_write(at);
                    }
                    // Writer is done: closed locally or failed.
                    Err(_) => return Ok(()),
                },

                _ = idle_timer(idle_deadline) => {
                    match self.idle.poll(Instant::now()) {
                        Some(IdleState::ReaderIdle) => {
                            tracing::info!(
                                "{} read idle, closing ({})",
                                self.connection.id(),
                                self.connection.peer_addr()
                            );
                            self.ctx.lifecycle.publish_read_idle(&self.connection);
                            return Ok(());
                        }
                        Some(IdleState::WriterIdle) => {
                            self.ctx.lifecycle.publish_write_idle(&self.connection);
                            self.send_heartbeat()?;
                        }
                        None => {}
                    }
                }
            }
        }
    }

    fn on_command(&self, command: Box<dyn Command>) {
        let header = command.header();
        let command_id = header.command_id;

        if header.is_response() {
            match self.connection.pending().remove(command_id) {
                Some(promise) => {
                    if let Some(metrics) = &self.ctx.metrics {
                        metrics.responses_total.inc();
                        let elapsed = self.ctx.clock.now_millis() - promise.created_at();
                        metrics.request_duration.observe(elapsed.max(0) as f64 / 1000.0);
                    }
                    promise.set_response(Arc::from(command));
                }
                None => {
                    if let Some(metrics) = &self.ctx.metrics {
                        metrics.unmatched_responses_total.inc();
                    }
                    tracing::debug!(
                        "dropping response {} from {}: no pending request",
                        command_id,
                        self.connection.peer_addr()
                    );
                }
            }
        } else if header.command_type == self.ctx.heartbeat_command_type {
            tracing::trace!("heartbeat {} from {}", command_id, self.connection.peer_addr());
        } else {
            let ctx = RequestContext::new(
                self.connection.clone(),
                self.ctx.clock.clone(),
                self.ctx.metrics.clone(),
            );
            handler::dispatch(&self.ctx.handlers, ctx, command);
        }
    }

    fn send_heartbeat(&self) -> Result<(), NetError> {
        let heartbeat = Heartbeat::new(
            self.ctx.ids.next_id(),
            self.ctx.heartbeat_command_type,
            self.ctx.clock.now_millis(),
        );
        let bytes = self.ctx.encoder.encode(&heartbeat)?;
        // A closed queue means the writer is gone; the next select sees it.
        if self.connection.enqueue(bytes, WriteAction::None).is_err() {
            return Ok(());
        }

        if let Some(metrics) = &self.ctx.metrics {
            metrics.heartbeats_sent_total.inc();
        }
        tracing::trace!("heartbeat queued for {}", self.connection.peer_addr());
        Ok(())
    }

    async fn finish(mut self, result: Result<(), NetError>) {
        let connection = self.connection.clone();
        connection.shared.closed.store(true, Ordering::Release);

        self.stop.notify_one();
        let written = match self.writer.take() {
            Some(writer) => match writer.await {
                Ok(written) => written,
                Err(e) => {
                    tracing::warn!("{} writer task failed: {}", connection.id(), e);
                    Ok(())
                }
            },
            None => Ok(()),
        };
        let result = result.and(written);

        let failure = match &result {
            Ok(()) => NetError::ConnectionClosed,
            Err(e) => e.clone(),
        };
        for promise in connection.pending().drain() {
            promise.set_failure(failure.clone());
        }
        self.ctx.pending_connections.remove(connection.id());
        self.ctx.connections.remove(&connection.id());
        if self.origin == Origin::Accepted {
            self.ctx.accepted.fetch_sub(1, Ordering::AcqRel);
        }

        if let Some(metrics) = &self.ctx.metrics {
            metrics.connections_active.dec();
            metrics.pending_requests.set(self.ctx.pending_connections.pending_requests() as f64);
            if matches!(result, Err(NetError::Protocol(_))) {
                metrics.decode_errors_total.inc();
            }
        }

        if let Err(e) = &result {
            tracing::warn!("{} ({}) failed: {}", connection.id(), connection.peer_addr(), e);
            self.ctx.lifecycle.publish_exception(&connection, e);
        }
        tracing::debug!("{} closed", connection.id());
        self.ctx.lifecycle.publish_closed(&connection);
    }
}

async fn idle_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
