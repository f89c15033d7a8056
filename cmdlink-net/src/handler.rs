//! Request handling.
//!
//! Inbound requests are routed by command type to a [`RequestHandler`]. Each
//! handler may bring its own executor; otherwise it runs on the connection's
//! I/O task and must not block.

use crate::clock::Clock;
use crate::connection::Connection;
use crate::error::NetError;
use crate::executor::{self, Executor};
use crate::metrics::Metrics;
use cmdlink_protocol::{status, Command, Header, HeaderType, RawCommand};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a handler produces: a response, nothing, or a failure.
///
/// A failure is logged and no response is sent; the peer's request then
/// expires on its side.
pub type HandlerResult = Result<Option<Box<dyn Command>>, NetError>;

/// Handles requests of one or more command types.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, ctx: &RequestContext, request: Box<dyn Command>) -> HandlerResult;

    /// Executor to run on. `None` runs on the connection's I/O task.
    fn executor(&self) -> Option<Arc<dyn Executor>> {
        None
    }
}

/// Looks up the handler for a command type.
pub trait RequestHandlerFactory: Send + Sync {
    fn handler(&self, command_type: u32) -> Option<Arc<dyn RequestHandler>>;
}

/// Handlers keyed by command type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<u32, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, returning the one it replaced.
    pub fn register(
        &mut self,
        command_type: u32,
        handler: Arc<dyn RequestHandler>,
    ) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.insert(command_type, handler)
    }

    pub fn with(mut self, command_type: u32, handler: Arc<dyn RequestHandler>) -> Self {
        self.register(command_type, handler);
        self
    }

    pub fn contains(&self, command_type: u32) -> bool {
        self.handlers.contains_key(&command_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl RequestHandlerFactory for HandlerRegistry {
    fn handler(&self, command_type: u32) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(&command_type).cloned()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

/// Handler built from a closure.
pub struct FnHandler<F> {
    f: F,
    executor: Option<Arc<dyn Executor>>,
}

/// Wraps a closure as a [`RequestHandler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&RequestContext, Box<dyn Command>) -> HandlerResult + Send + Sync + 'static,
{
    FnHandler { f, executor: None }
}

impl<F> FnHandler<F> {
    /// Runs the closure on `executor` instead of the I/O task.
    pub fn on(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }
}

impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&RequestContext, Box<dyn Command>) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, ctx: &RequestContext, request: Box<dyn Command>) -> HandlerResult {
        (self.f)(ctx, request)
    }

    fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.executor.clone()
    }
}

/// Per-request state handed to a handler.
pub struct RequestContext {
    connection: Connection,
    clock: Arc<dyn Clock>,
    received_at: i64,
    metrics: Option<Arc<Metrics>>,
}

impl RequestContext {
    pub(crate) fn new(connection: Connection, clock: Arc<dyn Clock>, metrics: Option<Arc<Metrics>>) -> Self {
        let received_at = clock.now_millis();
        Self {
            connection,
            clock,
            received_at,
            metrics,
        }
    }

    /// The connection the request arrived on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Millisecond timestamp at which the request was decoded.
    pub fn received_at(&self) -> i64 {
        self.received_at
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// A successful response header for `request`, stamped now.
    pub fn response_header(&self, request: &Header) -> Header {
        Header::response_to(request, self.clock.now_millis())
    }

    /// A bodiless response reporting `status` and `message`.
    pub fn error_response(&self, request: &Header, status: i32, message: impl Into<String>) -> RawCommand {
        RawCommand::from_header(
            self.response_header(request)
                .with_status(status)
                .with_error(message),
        )
    }

    /// Writes `response` back to the peer, correlated with `request`.
    ///
    /// Responses to one-way requests are dropped.
    pub(crate) fn respond(&self, request: &Header, mut response: Box<dyn Command>) {
        if !request.need_ack {
            tracing::debug!(
                "dropping response to one-way request {} (type {})",
                request.command_id,
                request.command_type
            );
            return;
        }

        let header = response.header_mut();
        header.header_type = HeaderType::Response;
        header.command_id = request.command_id;
        header.need_ack = false;

        if let Err(e) = self.connection.send_response(response.as_ref()) {
            tracing::debug!(
                "failed to send response {} to {}: {}",
                request.command_id,
                self.connection.peer_addr(),
                e
            );
        }
    }
}

/// Routes one inbound request to its handler.
pub(crate) fn dispatch(
    handlers: &Arc<dyn RequestHandlerFactory>,
    ctx: RequestContext,
    request: Box<dyn Command>,
) {
    let header = request.header().clone();

    let Some(handler) = handlers.handler(header.command_type) else {
        tracing::warn!(
            "no handler for command type {} (request {} from {})",
            header.command_type,
            header.command_id,
            ctx.connection.peer_addr()
        );
        if header.need_ack {
            let response = ctx.error_response(
                &header,
                status::NO_HANDLER,
                format!("no handler for command type {}", header.command_type),
            );
            ctx.respond(&header, Box::new(response));
        }
        return;
    };

    let executor = handler.executor().unwrap_or_else(executor::inline);
    executor.execute(Box::new(move || match handler.handle(&ctx, request) {
        Ok(Some(response)) => ctx.respond(&header, response),
        Ok(None) => {
            if header.need_ack {
                tracing::warn!(
                    "handler for type {} returned no response to request {}",
                    header.command_type,
                    header.command_id
                );
            }
        }
        Err(e) => {
            if let Some(metrics) = &ctx.metrics {
                metrics.handler_errors_total.inc();
            }
            tracing::warn!(
                "handler for type {} failed on request {}: {}",
                header.command_type,
                header.command_id,
                e
            );
        }
    }));
}
