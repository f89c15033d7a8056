//! Service facade.
//!
//! [`NetService`] ties the engine together: it accepts and opens
//! connections, submits requests in one-way, async, or sync mode, and owns
//! the admission controller and the timeout sweeper.

use crate::admission::AdmissionController;
use crate::clock::{Clock, CommandIdGenerator, SystemClock};
use crate::config::Config;
use crate::connection::{Connection, ConnectionContext, Origin, WriteAction};
use crate::error::NetError;
use crate::executor::{self, Executor};
use crate::handler::{HandlerRegistry, RequestHandlerFactory};
use crate::lifecycle::{ChannelEvent, ChannelListener, LifecyclePublisher};
use crate::metrics::Metrics;
use crate::pending::PendingConnections;
use crate::promise::ResponsePromise;
use crate::sweeper::TimeoutSweeper;
use bytes::Bytes;
use cmdlink_protocol::{Command, CommandRegistry, Encoder, Header, RawCommand};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Runtime configuration of a [`NetService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Default request deadline.
    pub request_timeout: Duration,
    /// Close a connection after this long without reads.
    pub channel_read_timeout: Option<Duration>,
    /// Send a heartbeat after this long without writes.
    pub channel_write_timeout: Option<Duration>,
    /// Timeout sweeper period.
    pub request_timeout_detect_interval: Duration,
    pub heartbeat_command_type: u32,
    /// Maximum unresolved outbound requests (0 or less = unlimited).
    pub max_processing_requests: i64,
    pub max_frame_length: u32,
    /// Maximum concurrent accepted connections. Dialed connections do not count.
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ServiceConfig {
    fn from(config: &Config) -> Self {
        Self {
            request_timeout: config.engine.request_timeout(),
            channel_read_timeout: config.engine.channel_read_timeout(),
            channel_write_timeout: config.engine.channel_write_timeout(),
            request_timeout_detect_interval: config.engine.request_timeout_detect_interval(),
            heartbeat_command_type: config.engine.heartbeat_command_type,
            max_processing_requests: config.engine.max_processing_requests,
            max_frame_length: config.engine.max_frame_length,
            max_connections: config.network.max_connections,
            connect_timeout: config.network.connect_timeout(),
            read_buffer_size: config.network.read_buffer_size,
            event_channel_capacity: 1024,
        }
    }
}

impl ServiceConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.channel_read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.channel_write_timeout = timeout;
        self
    }

    pub fn with_detect_interval(mut self, interval: Duration) -> Self {
        self.request_timeout_detect_interval = interval;
        self
    }

    pub fn with_heartbeat_command_type(mut self, command_type: u32) -> Self {
        self.heartbeat_command_type = command_type;
        self
    }

    pub fn with_max_processing_requests(mut self, max: i64) -> Self {
        self.max_processing_requests = max;
        self
    }

    pub fn with_max_frame_length(mut self, max: u32) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// How a request is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendMode {
    OneWay,
    Async,
    Sync,
}

impl SendMode {
    fn as_str(&self) -> &'static str {
        match self {
            SendMode::OneWay => "oneway",
            SendMode::Async => "async",
            SendMode::Sync => "sync",
        }
    }
}

/// Builder for [`NetService`].
pub struct NetServiceBuilder {
    config: ServiceConfig,
    commands: CommandRegistry,
    handlers: Arc<dyn RequestHandlerFactory>,
    clock: Arc<dyn Clock>,
    ids: Arc<CommandIdGenerator>,
    listener_executor: Arc<dyn Executor>,
    metrics: Option<Arc<Metrics>>,
    listeners: Vec<Arc<dyn ChannelListener>>,
}

impl NetServiceBuilder {
    /// Commands this service can decode. The heartbeat type is added if missing.
    pub fn commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = commands;
        self
    }

    pub fn handlers(mut self, handlers: impl RequestHandlerFactory + 'static) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn handler_factory(mut self, handlers: Arc<dyn RequestHandlerFactory>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<CommandIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Executor for promise listeners and lifecycle callbacks.
    pub fn listener_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.listener_executor = executor;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ChannelListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> NetService {
        let config = self.config;

        let mut commands = self.commands;
        if !commands.contains(config.heartbeat_command_type) {
            commands = commands.with_heartbeat(config.heartbeat_command_type);
        }

        let lifecycle = Arc::new(LifecyclePublisher::new(
            config.event_channel_capacity,
            self.listener_executor.clone(),
        ));
        for listener in self.listeners {
            lifecycle.add_listener(listener);
        }

        let pending_connections = Arc::new(PendingConnections::new());
        let sweeper = Arc::new(TimeoutSweeper::new(
            pending_connections.clone(),
            self.clock.clone(),
            config.request_timeout_detect_interval,
            self.metrics.clone(),
        ));

        let context = Arc::new(ConnectionContext {
            commands: Arc::new(commands),
            handlers: self.handlers,
            lifecycle,
            pending_connections,
            connections: DashMap::new(),
            accepted: AtomicUsize::new(0),
            clock: self.clock,
            ids: self.ids,
            encoder: Encoder::new(config.max_frame_length),
            heartbeat_command_type: config.heartbeat_command_type,
            read_timeout: config.channel_read_timeout,
            write_timeout: config.channel_write_timeout,
            read_buffer_size: config.read_buffer_size,
            metrics: self.metrics,
        });

        let (shutdown_tx, _) = broadcast::channel(1);

        NetService {
            admission: AdmissionController::new(config.max_processing_requests),
            config,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            context,
            sweeper,
            sweeper_task: Mutex::new(None),
            shutdown_tx,
            listener_executor: self.listener_executor,
        }
    }
}

/// A cmdlink endpoint. Can listen, connect, or both; every connection can
/// carry requests in either direction.
pub struct NetService {
    config: ServiceConfig,
    running: AtomicBool,
    stopped: AtomicBool,
    admission: AdmissionController,
    context: Arc<ConnectionContext>,
    sweeper: Arc<TimeoutSweeper>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    listener_executor: Arc<dyn Executor>,
}

impl NetService {
    pub fn builder(config: ServiceConfig) -> NetServiceBuilder {
        NetServiceBuilder {
            config,
            commands: CommandRegistry::new(),
            handlers: Arc::new(HandlerRegistry::new()),
            clock: Arc::new(SystemClock),
            ids: Arc::new(CommandIdGenerator::new()),
            listener_executor: executor::inline(),
            metrics: None,
            listeners: Vec::new(),
        }
    }

    pub fn new(config: ServiceConfig, commands: CommandRegistry, handlers: HandlerRegistry) -> Self {
        Self::builder(config).commands(commands).handlers(handlers).build()
    }

    /// Starts the timeout sweeper and accepts sends. Must run inside a
    /// tokio runtime. A stopped service cannot be restarted.
    pub fn start(&self) -> Result<(), NetError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NetError::NotRunning);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(NetError::Config("start() requires a tokio runtime".to_string()));
            }
        };

        let sweeper = self.sweeper.clone();
        *self.sweeper_task.lock() = Some(handle.spawn(async move { sweeper.run().await }));

        tracing::info!(
            "Service started (request_timeout={:?}, max_processing_requests={})",
            self.config.request_timeout,
            self.config.max_processing_requests
        );
        Ok(())
    }

    /// Stops the sweeper and listeners and closes every connection.
    ///
    /// Pending requests resolve with [`NetError::ConnectionClosed`] as their
    /// connections close.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.sweeper.shutdown();
        self.sweeper_task.lock().take();
        let _ = self.shutdown_tx.send(());
        self.context.close_all();

        tracing::info!("Service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), NetError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NetError::NotRunning)
        }
    }

    /// Binds `addr` and accepts connections in the background until
    /// shutdown. Returns the bound address.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, NetError> {
        self.ensure_running()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        tokio::spawn(accept_loop(
            listener,
            self.context.clone(),
            self.shutdown_tx.subscribe(),
            self.config.max_connections,
        ));
        Ok(local_addr)
    }

    /// Accepts connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), NetError> {
        self.ensure_running()?;
        accept_loop(
            listener,
            self.context.clone(),
            self.shutdown_tx.subscribe(),
            self.config.max_connections,
        )
        .await;
        Ok(())
    }

    /// Opens a connection to `addr`.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection, NetError> {
        self.ensure_running()?;
        let stream = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(NetError::from(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, self.config.connect_timeout),
                )))
            }
        };
        let connection = self.context.spawn(stream, Origin::Dialed)?;
        tracing::debug!("Connected to {} ({})", addr, connection.id());
        Ok(connection)
    }

    /// A request header with a fresh id, stamped now.
    pub fn request_header(&self, command_type: u32) -> Header {
        Header::request(
            self.context.ids.next_id(),
            command_type,
            self.context.clock.now_millis(),
        )
    }

    /// A [`RawCommand`] request with a fresh header.
    pub fn raw_request(&self, command_type: u32, body: impl Into<Bytes>) -> RawCommand {
        RawCommand::new(self.request_header(command_type), body)
    }

    /// Sends a request that expects no response.
    ///
    /// The promise resolves once the frame is written, or with the failure
    /// that prevented it.
    pub fn send_oneway<C: Command>(
        &self,
        connection: &Connection,
        request: C,
    ) -> Result<Arc<ResponsePromise>, NetError> {
        self.submit(connection, Arc::new(request), None, SendMode::OneWay)
    }

    /// Sends a request and returns a promise for its response.
    ///
    /// `timeout` overrides the default request timeout. Failures after
    /// submission surface through the promise.
    pub fn send_async<C: Command>(
        &self,
        connection: &Connection,
        request: C,
        timeout: Option<Duration>,
    ) -> Result<Arc<ResponsePromise>, NetError> {
        self.submit(connection, Arc::new(request), timeout, SendMode::Async)
    }

    /// Sends a request and waits for its response.
    ///
    /// A response with a non-success status is returned as
    /// [`NetError::Remote`].
    pub async fn send_sync<C: Command>(
        &self,
        connection: &Connection,
        request: C,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Command>, NetError> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let promise = self.submit(connection, Arc::new(request), Some(timeout), SendMode::Sync)?;
        let _ = promise.wait_timeout(timeout).await;
        finish_sync(connection, &promise)
    }

    /// Like [`send_sync`](Self::send_sync) but blocks the calling thread.
    /// Must not be called from an async context.
    pub fn send_blocking<C: Command>(
        &self,
        connection: &Connection,
        request: C,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Command>, NetError> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let promise = self.submit(connection, Arc::new(request), Some(timeout), SendMode::Sync)?;
        let _ = promise.get(timeout);
        finish_sync(connection, &promise)
    }

    fn submit(
        &self,
        connection: &Connection,
        request: Arc<dyn Command>,
        timeout: Option<Duration>,
        mode: SendMode,
    ) -> Result<Arc<ResponsePromise>, NetError> {
        self.ensure_running()?;

        let header = request.header();
        if !header.is_request() {
            return Err(NetError::InvalidRequest(format!(
                "command {} is a {}, not a request",
                header.command_id, header.header_type
            )));
        }
        if header.command_type == self.config.heartbeat_command_type {
            return Err(NetError::InvalidRequest(format!(
                "command type {} is reserved for heartbeats",
                header.command_type
            )));
        }
        match mode {
            SendMode::OneWay if header.need_ack => {
                return Err(NetError::InvalidRequest(
                    "one-way request must not expect a response".to_string(),
                ))
            }
            SendMode::Async | SendMode::Sync if !header.need_ack => {
                return Err(NetError::InvalidRequest(
                    "request does not expect a response; send it one-way".to_string(),
                ))
            }
            _ => {}
        }

        let bytes = self.context.encoder.encode(request.as_ref())?;

        let permit = self.admission.try_acquire().map_err(|e| {
            if let Some(metrics) = &self.context.metrics {
                metrics.admission_rejections_total.inc();
            }
            tracing::debug!("Rejected request {}: {}", request.header().command_id, e);
            e
        })?;

        let promise = Arc::new(ResponsePromise::new(
            request,
            timeout.unwrap_or(self.config.request_timeout),
            self.context.clock.now_millis(),
            permit,
            self.listener_executor.clone(),
        ));

        let action = match mode {
            SendMode::OneWay => WriteAction::Resolve(promise.clone()),
            SendMode::Async | SendMode::Sync => WriteAction::Track(promise.clone()),
        };
        // A failed enqueue has already resolved the promise.
        let _ = connection.enqueue(bytes, action);

        if let Some(metrics) = &self.context.metrics {
            metrics.requests_total.with_label_values(&[mode.as_str()]).inc();
        }
        Ok(promise)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn lifecycle(&self) -> &Arc<LifecyclePublisher> {
        &self.context.lifecycle
    }

    /// Registers a lifecycle listener. Returns an id for
    /// [`remove_listener`](Self::remove_listener).
    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) -> u64 {
        self.context.lifecycle.add_listener(listener)
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        self.context.lifecycle.remove_listener(id)
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.context.lifecycle.subscribe()
    }

    pub fn sweeper(&self) -> &Arc<TimeoutSweeper> {
        &self.sweeper
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.context.clock
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.context.metrics.as_ref()
    }

    /// Number of open connections, inbound and outbound.
    pub fn connection_count(&self) -> usize {
        self.context.connection_count()
    }

    /// Number of open connections accepted by this service's listeners.
    /// `max_connections` applies to this count only.
    pub fn accepted_connection_count(&self) -> usize {
        self.context.accepted_count()
    }

    /// Number of connections with at least one request awaiting a response.
    pub fn pending_connection_count(&self) -> usize {
        self.context.pending_connections.len()
    }
}

impl Drop for NetService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolves a sync caller's promise with a timeout if nothing else did,
/// then maps the outcome to a response.
fn finish_sync(connection: &Connection, promise: &ResponsePromise) -> Result<Arc<dyn Command>, NetError> {
    if promise.set_failure(promise.timeout_error()) {
        connection.pending().remove(promise.command_id());
    }

    let response = promise
        .result()
        .unwrap_or_else(|| Err(promise.timeout_error()))?
        .ok_or_else(|| NetError::InvalidRequest("no response for an acknowledged request".to_string()))?;

    let header = response.header();
    if header.is_success() {
        Ok(response)
    } else {
        Err(NetError::Remote {
            status: header.status,
            message: header.error.clone().unwrap_or_default(),
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown: broadcast::Receiver<()>,
    max_connections: usize,
) {
    let local_addr = listener.local_addr().ok();
    tracing::info!("Listening on {:?}", local_addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if ctx.accepted_count() >= max_connections {
                            tracing::warn!("Max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        match ctx.spawn(stream, Origin::Accepted) {
                            Ok(connection) => {
                                tracing::debug!("Accepted {} from {}", connection.id(), addr);
                            }
                            Err(e) => tracing::warn!("Failed to set up connection from {}: {}", addr, e),
                        }
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Listener on {:?} shutting down", local_addr);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use cmdlink_protocol::{status, HeaderType};

    const ECHO: u32 = 1;

    fn config() -> ServiceConfig {
        ServiceConfig::default()
            .with_request_timeout(Duration::from_millis(200))
            .with_detect_interval(Duration::from_millis(20))
    }

    fn service(config: ServiceConfig) -> NetService {
        let service = NetService::new(config, CommandRegistry::new().with_raw(ECHO), HandlerRegistry::new());
        service.start().unwrap();
        service
    }

    #[test]
    fn test_service_config_from_config() {
        let mut config = Config::default();
        config.engine.channel_write_timeout_ms = 0;
        config.engine.max_processing_requests = 16;
        config.network.connect_timeout_ms = 750;

        let service_config = ServiceConfig::from(&config);
        assert_eq!(service_config.request_timeout, Duration::from_secs(30));
        assert!(service_config.channel_write_timeout.is_none());
        assert_eq!(service_config.max_processing_requests, 16);
        assert_eq!(service_config.connect_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_start_requires_runtime() {
        let service = NetService::new(ServiceConfig::default(), CommandRegistry::new(), HandlerRegistry::new());
        assert!(matches!(service.start(), Err(NetError::Config(_))));
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_not_running() {
        let service = NetService::new(config(), CommandRegistry::new(), HandlerRegistry::new());
        let (connection, _rx) = Connection::detached();
        let result = service.send_async(&connection, service.raw_request(ECHO, "x"), None);
        assert!(matches!(result, Err(NetError::NotRunning)));

        service.start().unwrap();
        service.shutdown();
        assert!(matches!(service.start(), Err(NetError::NotRunning)));
        assert!(matches!(
            service.connect("127.0.0.1:1".parse().unwrap()).await,
            Err(NetError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_request_validation() {
        let service = service(config());
        let (connection, _rx) = Connection::detached();

        let response = RawCommand::from_header(Header::response_to(&Header::request(1, ECHO, 0), 0));
        assert!(matches!(
            service.send_async(&connection, response, None),
            Err(NetError::InvalidRequest(_))
        ));

        let heartbeat = service.raw_request(0, "");
        assert!(matches!(
            service.send_async(&connection, heartbeat, None),
            Err(NetError::InvalidRequest(_))
        ));

        let acked = service.raw_request(ECHO, "x");
        assert!(matches!(
            service.send_oneway(&connection, acked),
            Err(NetError::InvalidRequest(_))
        ));

        let mut one_way = service.raw_request(ECHO, "x");
        one_way.header_mut().need_ack = false;
        assert!(matches!(
            service.send_async(&connection, one_way, None),
            Err(NetError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_async_send_queues_tracked_frame() {
        let service = service(config());
        let (connection, mut rx) = Connection::detached();

        let request = service.raw_request(ECHO, "hello");
        let id = request.header().command_id;
        let promise = service.send_async(&connection, request, None).unwrap();
        assert_eq!(promise.command_id(), id);
        assert_eq!(promise.timeout(), Duration::from_millis(200));

        match rx.try_recv().unwrap() {
            Outbound::Frame { on_written, .. } => {
                assert!(matches!(on_written, WriteAction::Track(ref p) if p.command_id() == id));
            }
            Outbound::Close => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn test_admission_rejects_and_recovers() {
        let service = service(config().with_max_processing_requests(2));
        let (connection, _rx) = Connection::detached();

        let first = service.send_async(&connection, service.raw_request(ECHO, "1"), None).unwrap();
        let _second = service.send_async(&connection, service.raw_request(ECHO, "2"), None).unwrap();
        let third = service.send_async(&connection, service.raw_request(ECHO, "3"), None);
        assert!(matches!(third, Err(NetError::TooManyRequests { max: 2 })));

        first.set_failure(NetError::ConnectionClosed);
        assert_eq!(service.admission().available(), Some(1));
        assert!(service.send_async(&connection, service.raw_request(ECHO, "4"), None).is_ok());
    }

    #[tokio::test]
    async fn test_closed_connection_resolves_promise() {
        let service = service(config());
        let (connection, _rx) = Connection::detached();
        connection.close();

        let promise = service.send_async(&connection, service.raw_request(ECHO, "x"), None).unwrap();
        assert!(matches!(promise.result(), Some(Err(NetError::ConnectionClosed))));
    }

    #[tokio::test]
    async fn test_sync_timeout_releases_permit() {
        let service = service(config().with_max_processing_requests(1));
        let (connection, _rx) = Connection::detached();

        let result = service
            .send_sync(&connection, service.raw_request(ECHO, "x"), Some(Duration::from_millis(30)))
            .await;
        assert!(matches!(result, Err(NetError::Timeout { .. })));
        assert_eq!(service.admission().available(), Some(1));
    }

    #[test]
    fn test_finish_sync_maps_remote_status() {
        let (connection, _rx) = Connection::detached();
        let request: Arc<dyn Command> = Arc::new(RawCommand::from_header(Header::request(5, ECHO, 0)));
        let promise = ResponsePromise::new(
            request,
            Duration::from_secs(1),
            0,
            crate::admission::AdmissionPermit::unbounded(),
            executor::inline(),
        );
        let mut header = Header::response_to(&Header::request(5, ECHO, 0), 0)
            .with_status(status::NO_HANDLER)
            .with_error("no handler");
        header.header_type = HeaderType::Response;
        promise.set_response(Arc::new(RawCommand::from_header(header)));

        match finish_sync(&connection, &promise) {
            Err(NetError::Remote { status: code, message }) => {
                assert_eq!(code, status::NO_HANDLER);
                assert_eq!(message, "no handler");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
