//! Command execution.

use crate::Commands;
use cmdlink_net::echo::{delay_body, DELAY, ECHO};
use cmdlink_net::{CallResult, Connection, NetError, NetService, ResponsePromise};
use cmdlink_protocol::RawCommand;
use colored::Colorize;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

type CliResult = Result<String, Box<dyn std::error::Error>>;

/// Executes a command and returns the formatted output.
pub async fn execute(
    service: &NetService,
    connection: &Connection,
    cmd: Commands,
    json: bool,
) -> CliResult {
    match cmd {
        Commands::Ping { count } => {
            let mut rtts = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let started = Instant::now();
                service
                    .send_sync(connection, service.raw_request(ECHO, ""), None)
                    .await?;
                rtts.push(started.elapsed());
            }

            if json {
                let rtt_us: Vec<u128> = rtts.iter().map(|d| d.as_micros()).collect();
                return Ok(serde_json::to_string(&serde_json::json!({
                    "server": connection.peer_addr().to_string(),
                    "rtt_us": rtt_us,
                }))?);
            }
            let lines: Vec<String> = rtts
                .iter()
                .map(|rtt| format!("{} from {} in {:?}", "PONG".green(), connection.peer_addr(), rtt))
                .collect();
            Ok(lines.join("\n"))
        }

        Commands::Echo { message, delay_ms } => {
            let request = match delay_ms {
                Some(ms) => service.raw_request(DELAY, delay_body(Duration::from_millis(ms), message.as_bytes())),
                None => service.raw_request(ECHO, message.into_bytes()),
            };
            let started = Instant::now();
            let response = service.send_sync(connection, request, None).await?;
            let elapsed = started.elapsed();

            let body = response
                .downcast_ref::<RawCommand>()
                .map(|raw| String::from_utf8_lossy(raw.body()).into_owned())
                .unwrap_or_default();

            if json {
                return Ok(serde_json::to_string(&serde_json::json!({
                    "command_id": response.command_id(),
                    "body": body,
                    "elapsed_us": elapsed.as_micros(),
                }))?);
            }
            Ok(format!("{} ({})", body, format!("{:?}", elapsed).dimmed()))
        }

        Commands::Flood {
            count,
            concurrency,
            size,
            delay_ms,
        } => {
            let summary = flood(service, connection, count, concurrency, size, delay_ms).await?;
            if json {
                return Ok(serde_json::to_string(&summary)?);
            }
            Ok(summary.render())
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct FloodSummary {
    sent: u64,
    succeeded: u64,
    failed: u64,
    timeouts: u64,
    rejected: u64,
    elapsed_ms: u128,
    requests_per_sec: f64,
    p50_us: u128,
    p99_us: u128,
    max_us: u128,
}

impl FloodSummary {
    fn record(&mut self, result: &CallResult) {
        match result {
            Ok(Some(response)) if response.header().is_success() => self.succeeded += 1,
            Err(e) if e.is_timeout() => self.timeouts += 1,
            _ => self.failed += 1,
        }
    }

    fn render(&self) -> String {
        let failed = if self.failed + self.timeouts > 0 {
            format!("{} failed, {} timed out", self.failed, self.timeouts).red().to_string()
        } else {
            "0 failed".green().to_string()
        };
        format!(
            "{} {} requests in {} ms ({:.0} req/s)\n  {} ok, {}, {} admission retries\n  latency p50={}us p99={}us max={}us",
            "Sent".bold(),
            self.sent,
            self.elapsed_ms,
            self.requests_per_sec,
            self.succeeded.to_string().green(),
            failed,
            self.rejected,
            self.p50_us,
            self.p99_us,
            self.max_us,
        )
    }
}

/// Sends `count` requests, keeping at most `concurrency` unresolved. When
/// admission rejects a send, waits for the oldest request and retries.
async fn flood(
    service: &NetService,
    connection: &Connection,
    count: u64,
    concurrency: i64,
    size: usize,
    delay_ms: u64,
) -> Result<FloodSummary, NetError> {
    let payload = vec![b'x'; size];
    let body = if delay_ms > 0 {
        delay_body(Duration::from_millis(delay_ms), &payload)
    } else {
        payload.into()
    };
    let command_type = if delay_ms > 0 { DELAY } else { ECHO };

    let (latency_tx, mut latency_rx) = mpsc::unbounded_channel::<Duration>();
    let mut in_flight: VecDeque<Arc<ResponsePromise>> = VecDeque::with_capacity(concurrency.max(1) as usize);
    let mut summary = FloodSummary::default();
    let started = Instant::now();

    while summary.sent < count {
        let request = service.raw_request(command_type, body.clone());
        match service.send_async(connection, request, None) {
            Ok(promise) => {
                let submitted = Instant::now();
                let tx = latency_tx.clone();
                promise.add_listener(move |_| {
                    let _ = tx.send(submitted.elapsed());
                });
                in_flight.push_back(promise);
                summary.sent += 1;
            }
            Err(NetError::TooManyRequests { .. }) => {
                summary.rejected += 1;
                match in_flight.pop_front() {
                    Some(oldest) => summary.record(&oldest.wait().await),
                    None => tokio::task::yield_now().await,
                }
            }
            Err(e) => return Err(e),
        }
    }
    while let Some(promise) = in_flight.pop_front() {
        summary.record(&promise.wait().await);
    }

    let elapsed = started.elapsed();
    drop(latency_tx);
    let mut latencies = Vec::with_capacity(summary.sent as usize);
    while let Some(latency) = latency_rx.recv().await {
        latencies.push(latency.as_micros());
    }
    latencies.sort_unstable();

    summary.elapsed_ms = elapsed.as_millis();
    summary.requests_per_sec = summary.sent as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    summary.p50_us = percentile(&latencies, 50);
    summary.p99_us = percentile(&latencies, 99);
    summary.max_us = latencies.last().copied().unwrap_or(0);
    Ok(summary)
}

fn percentile(sorted: &[u128], p: usize) -> u128 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = (sorted.len() * p / 100).min(sorted.len() - 1);
    sorted[idx]
}
