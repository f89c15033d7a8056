//! Response promises.
//!
//! A [`ResponsePromise`] is created for every outbound request and resolved
//! exactly once: by the matching response, by the write completing for a
//! one-way request, by the sweeper on expiry, or by the connection closing.
//! Whoever resolves first wins; later attempts are no-ops.

use crate::admission::AdmissionPermit;
use crate::error::NetError;
use crate::executor::Executor;
use cmdlink_protocol::Command;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Outcome of a request.
///
/// `Ok(Some(_))` carries the response; `Ok(None)` means a one-way request was
/// written.
pub type CallResult = Result<Option<Arc<dyn Command>>, NetError>;

type Listener = Box<dyn FnOnce(&CallResult) + Send + 'static>;

struct PromiseState {
    outcome: Option<CallResult>,
    listeners: Vec<Listener>,
}

/// Caller-side handle for one outbound request.
pub struct ResponsePromise {
    command_id: u32,
    request: Arc<dyn Command>,
    created_at: i64,
    timeout: Duration,
    /// Set once the request frame is fully written.
    sent: AtomicBool,
    state: Mutex<PromiseState>,
    resolved: Condvar,
    notify: Notify,
    permit: Mutex<AdmissionPermit>,
    executor: Arc<dyn Executor>,
}

impl ResponsePromise {
    pub fn new(
        request: Arc<dyn Command>,
        timeout: Duration,
        now_millis: i64,
        permit: AdmissionPermit,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            command_id: request.header().command_id,
            request,
            created_at: now_millis,
            timeout,
            sent: AtomicBool::new(false),
            state: Mutex::new(PromiseState {
                outcome: None,
                listeners: Vec::new(),
            }),
            resolved: Condvar::new(),
            notify: Notify::new(),
            permit: Mutex::new(permit),
            executor,
        }
    }

    pub fn command_id(&self) -> u32 {
        self.command_id
    }

    pub fn request(&self) -> &Arc<dyn Command> {
        &self.request
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Millisecond timestamp at which the request expires.
    pub fn deadline(&self) -> i64 {
        self.created_at
            .saturating_add(self.timeout.as_millis().min(i64::MAX as u128) as i64)
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.deadline()
    }

    /// Marks the request frame as written. Only sent requests can expire.
    pub fn mark_sent(&self) {
        self.sent.store(true, Ordering::Release);
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// The error to resolve with once the deadline has passed.
    pub fn timeout_error(&self) -> NetError {
        NetError::Timeout {
            command_id: self.command_id,
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Stores the outcome if none is stored yet.
    ///
    /// On the first call this releases the admission permit, wakes every
    /// waiter and hands the outcome to each listener on the executor. Returns
    /// whether this call resolved the promise.
    pub fn resolve(&self, result: CallResult) -> bool {
        let listeners = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(result.clone());
            std::mem::take(&mut state.listeners)
        };

        self.permit.lock().release();
        self.resolved.notify_all();
        self.notify.notify_waiters();

        for listener in listeners {
            let result = result.clone();
            self.executor.execute(Box::new(move || listener(&result)));
        }
        true
    }

    pub fn set_response(&self, response: Arc<dyn Command>) -> bool {
        self.resolve(Ok(Some(response)))
    }

    pub fn set_failure(&self, error: NetError) -> bool {
        self.resolve(Err(error))
    }

    /// Returns the outcome without waiting.
    pub fn result(&self) -> Option<CallResult> {
        self.state.lock().outcome.clone()
    }

    /// Registers a callback for the outcome.
    ///
    /// Runs on the executor once resolved, or right away when the promise is
    /// already resolved.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&CallResult) + Send + 'static,
    {
        let result = {
            let mut state = self.state.lock();
            match &state.outcome {
                Some(result) => result.clone(),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        self.executor.execute(Box::new(move || listener(&result)));
    }

    /// Blocks the calling thread until resolved or `timeout` elapses.
    ///
    /// Elapsing does not resolve the promise; it only stops waiting. Must not
    /// be called from an async context.
    pub fn get(&self, timeout: Duration) -> CallResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(result) = &state.outcome {
                return result.clone();
            }
            if self.resolved.wait_until(&mut state, deadline).timed_out() {
                return state
                    .outcome
                    .clone()
                    .unwrap_or_else(|| Err(self.timeout_error()));
            }
        }
    }

    /// Waits until resolved.
    pub async fn wait(&self) -> CallResult {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }

    /// Waits until resolved or `timeout` elapses, without resolving.
    pub async fn wait_timeout(&self, timeout: Duration) -> CallResult {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        }
    }
}

impl fmt::Debug for ResponsePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponsePromise")
            .field("command_id", &self.command_id)
            .field("deadline", &self.deadline())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::executor::InlineExecutor;
    use cmdlink_protocol::{Header, RawCommand};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(id: u32) -> Arc<dyn Command> {
        Arc::new(RawCommand::new(Header::request(id, 1, 0), "ping"))
    }

    fn response(id: u32) -> Arc<dyn Command> {
        let header = Header::response_to(&Header::request(id, 1, 0), 5);
        Arc::new(RawCommand::new(header, "pong"))
    }

    fn promise(id: u32) -> ResponsePromise {
        ResponsePromise::new(
            request(id),
            Duration::from_millis(100),
            1_000,
            AdmissionPermit::unbounded(),
            Arc::new(InlineExecutor),
        )
    }

    #[test]
    fn test_deadline() {
        let p = promise(1);
        assert_eq!(p.command_id(), 1);
        assert_eq!(p.deadline(), 1_100);
        assert!(!p.is_expired(1_099));
        assert!(p.is_expired(1_100));
    }

    #[test]
    fn test_first_resolution_wins() {
        let p = promise(1);
        assert!(p.set_response(response(1)));
        assert!(!p.set_failure(NetError::ConnectionClosed));
        assert!(!p.resolve(Err(p.timeout_error())));

        let result = p.result().unwrap().unwrap().unwrap();
        assert_eq!(result.command_id(), 1);
    }

    #[test]
    fn test_permit_released_once() {
        let admission = AdmissionController::new(1);
        let permit = admission.try_acquire().unwrap();
        let p = ResponsePromise::new(
            request(1),
            Duration::from_secs(1),
            0,
            permit,
            Arc::new(InlineExecutor),
        );
        assert_eq!(admission.available(), Some(0));

        p.set_failure(NetError::ConnectionClosed);
        assert_eq!(admission.available(), Some(1));

        p.set_response(response(1));
        drop(p);
        assert_eq!(admission.available(), Some(1));
    }

    #[test]
    fn test_listeners_run_once() {
        let p = promise(1);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            p.add_listener(move |result| {
                assert!(result.is_ok());
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        p.set_response(response(1));
        p.set_failure(NetError::ConnectionClosed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_listener_added_after_resolution_runs_immediately() {
        let p = promise(1);
        p.set_failure(NetError::ConnectionClosed);

        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        p.add_listener(move |result| {
            assert!(matches!(result, Err(NetError::ConnectionClosed)));
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_affect_others() {
        let p = promise(1);
        let calls = Arc::new(AtomicUsize::new(0));
        p.add_listener(|_| panic!("bad listener"));
        let c = calls.clone();
        p.add_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(p.set_response(response(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(p.is_done());
    }

    #[test]
    fn test_blocking_get_wakes_on_resolution() {
        let p = Arc::new(promise(7));
        let resolver = p.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            resolver.set_response(response(7));
        });

        let result = p.get(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(result.command_id(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_get_times_out_without_resolving() {
        let p = promise(3);
        let result = p.get(Duration::from_millis(10));
        assert!(matches!(result, Err(NetError::Timeout { command_id: 3, .. })));
        assert!(!p.is_done());
    }

    #[tokio::test]
    async fn test_async_wait() {
        let p = Arc::new(promise(9));
        let resolver = p.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.set_failure(NetError::ConnectionClosed);
        });

        let result = p.wait().await;
        assert!(matches!(result, Err(NetError::ConnectionClosed)));
    }

    #[test]
    fn test_wait_pending_until_resolved() {
        let p = promise(6);
        let mut wait = tokio_test::task::spawn(p.wait());
        tokio_test::assert_pending!(wait.poll());
        tokio_test::assert_pending!(wait.poll());

        p.set_response(response(6));
        assert!(wait.is_woken());
        let result = tokio_test::assert_ready!(wait.poll());
        assert_eq!(result.unwrap().unwrap().command_id(), 6);
    }

    #[tokio::test]
    async fn test_async_wait_already_resolved() {
        let p = promise(2);
        p.resolve(Ok(None));
        assert!(matches!(p.wait().await, Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_wait_timeout() {
        let p = promise(4);
        let result = p.wait_timeout(Duration::from_millis(50)).await;
        assert!(result.unwrap_err().is_timeout());
        assert!(!p.is_done());
    }
}
