//! Built-in echo and delayed-echo commands.
//!
//! Served by the `cmdlink` binary and driven by `cmdlink-cli`.

use crate::error::NetError;
use crate::executor::Executor;
use crate::handler::{HandlerRegistry, HandlerResult, RequestContext, RequestHandler};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use cmdlink_protocol::{Command, CommandRegistry, RawCommand};
use std::sync::Arc;
use std::time::Duration;

/// Echoes the request body back.
pub const ECHO: u32 = 1;

/// Sleeps for the number of milliseconds in the first 8 body bytes, then
/// echoes the remaining bytes.
pub const DELAY: u32 = 2;

/// Longest delay honoured by [`DelayHandler`].
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Command registry for both built-in commands.
pub fn commands() -> CommandRegistry {
    CommandRegistry::new().with_raw(ECHO).with_raw(DELAY)
}

/// Handlers for both built-in commands. Delays run on `blocking`.
pub fn handlers(blocking: Arc<dyn Executor>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(ECHO, Arc::new(EchoHandler))
        .with(DELAY, Arc::new(DelayHandler::new(blocking)))
}

/// Body for a [`DELAY`] request.
pub fn delay_body(delay: Duration, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u64(delay.as_millis() as u64);
    buf.put_slice(payload);
    buf.freeze()
}

fn raw_body(request: &dyn Command) -> Result<Bytes, NetError> {
    request
        .downcast_ref::<RawCommand>()
        .map(|raw| raw.body().clone())
        .ok_or_else(|| NetError::Handler(format!("unexpected command type {}", request.command_type())))
}

#[derive(Debug, Default)]
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, ctx: &RequestContext, request: Box<dyn Command>) -> HandlerResult {
        let body = raw_body(request.as_ref())?;
        let response = RawCommand::new(ctx.response_header(request.header()), body);
        Ok(Some(Box::new(response)))
    }
}

pub struct DelayHandler {
    executor: Arc<dyn Executor>,
}

impl DelayHandler {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl RequestHandler for DelayHandler {
    fn handle(&self, ctx: &RequestContext, request: Box<dyn Command>) -> HandlerResult {
        let mut body = raw_body(request.as_ref())?;
        if body.remaining() < 8 {
            return Err(NetError::Handler("delay body shorter than 8 bytes".into()));
        }
        let delay = Duration::from_millis(body.get_u64()).min(MAX_DELAY);
        std::thread::sleep(delay);

        let response = RawCommand::new(ctx.response_header(request.header()), body);
        Ok(Some(Box::new(response)))
    }

    fn executor(&self) -> Option<Arc<dyn Executor>> {
        Some(self.executor.clone())
    }
}
