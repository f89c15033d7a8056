//! Prometheus metrics for cmdlink services.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and a latency histogram
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request round-trip histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Prometheus metrics for a cmdlink service.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections established, inbound and outbound.
    pub connections_total: Counter,
    /// Currently open connections.
    pub connections_active: Gauge,
    /// Requests submitted by send mode.
    pub requests_total: CounterVec,
    /// Responses matched to a pending request.
    pub responses_total: Counter,
    /// Responses with no pending request, usually late after a timeout.
    pub unmatched_responses_total: Counter,
    /// Requests expired by the sweeper.
    pub timeouts_total: Counter,
    /// Requests refused by admission control.
    pub admission_rejections_total: Counter,
    pub heartbeats_sent_total: Counter,
    /// Connections closed on an undecodable frame.
    pub decode_errors_total: Counter,
    pub handler_errors_total: Counter,
    /// Requests written and awaiting a response.
    pub pending_requests: Gauge,
    /// Time from submission to matched response.
    pub request_duration: Histogram,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "cmdlink_connections_total",
            "Total number of connections established",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "cmdlink_connections_active",
            "Number of currently open connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Requests
        let requests_total = CounterVec::new(
            Opts::new("cmdlink_requests_total", "Total requests submitted by send mode"),
            &["mode"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let responses_total = Counter::with_opts(Opts::new(
            "cmdlink_responses_total",
            "Total responses matched to a pending request",
        ))?;
        registry.register(Box::new(responses_total.clone()))?;

        let unmatched_responses_total = Counter::with_opts(Opts::new(
            "cmdlink_unmatched_responses_total",
            "Total responses dropped for lack of a pending request",
        ))?;
        registry.register(Box::new(unmatched_responses_total.clone()))?;

        let timeouts_total = Counter::with_opts(Opts::new(
            "cmdlink_timeouts_total",
            "Total requests expired without a response",
        ))?;
        registry.register(Box::new(timeouts_total.clone()))?;

        let admission_rejections_total = Counter::with_opts(Opts::new(
            "cmdlink_admission_rejections_total",
            "Total requests refused because too many were in flight",
        ))?;
        registry.register(Box::new(admission_rejections_total.clone()))?;

        // Connection health
        let heartbeats_sent_total = Counter::with_opts(Opts::new(
            "cmdlink_heartbeats_sent_total",
            "Total heartbeats sent on write-idle connections",
        ))?;
        registry.register(Box::new(heartbeats_sent_total.clone()))?;

        let decode_errors_total = Counter::with_opts(Opts::new(
            "cmdlink_decode_errors_total",
            "Total connections closed on an undecodable frame",
        ))?;
        registry.register(Box::new(decode_errors_total.clone()))?;

        let handler_errors_total = Counter::with_opts(Opts::new(
            "cmdlink_handler_errors_total",
            "Total request handler failures",
        ))?;
        registry.register(Box::new(handler_errors_total.clone()))?;

        let pending_requests = Gauge::with_opts(Opts::new(
            "cmdlink_pending_requests",
            "Requests written and awaiting a response",
        ))?;
        registry.register(Box::new(pending_requests.clone()))?;

        // Latency
        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cmdlink_request_duration_seconds",
                "Time from request submission to matched response",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            responses_total,
            unmatched_responses_total,
            timeouts_total,
            admission_rejections_total,
            heartbeats_sent_total,
            decode_errors_total,
            handler_errors_total,
            pending_requests,
            request_duration,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => {
            let mut response = Response::new(Full::new(Bytes::from(metrics.encode())));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        "/health" | "/healthz" => Response::new(Full::new(Bytes::from("OK"))),
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("Not Found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}
