//! Worker tasks that execute scheduled HTTP requests.
//!
//! Each worker signals readiness before its first receive, pulls tasks from
//! the shared request channel, honors the task's ramp-up offset with an
//! absolute-deadline sleep, performs one cancellable HTTP exchange, and
//! pushes the outcome to the collector. The cancellation scope unblocks
//! every wait a worker can be parked in.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::request::RequestSpec;

/// One scheduled request slot.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    /// Position in the schedule, 0-based.
    pub sequence: u64,

    /// Release offset from test start under the configured ramp-up.
    pub start_offset: Duration,
}

/// Outcome of one HTTP exchange, consumed by the collector.
#[derive(Debug)]
pub struct RequestResult {
    pub sequence: u64,

    /// HTTP status, 0 when the transport failed before a status line.
    pub status_code: u16,

    pub duration_ms: u64,

    /// Milliseconds since test start, measured at completion.
    pub elapsed_ms: u64,

    pub request_size: u64,
    pub response_size: u64,

    /// Full response body; empty on network error.
    pub body: String,

    /// Transport error, when the exchange did not complete cleanly.
    pub error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

/// Shared state handed to each worker task.
pub struct WorkerContext {
    pub worker_id: u32,
    pub client: reqwest::Client,
    pub request: Arc<RequestSpec>,
    pub tasks: Arc<Mutex<mpsc::Receiver<Task>>>,
    pub results: mpsc::Sender<RequestResult>,
    pub ready: Arc<Semaphore>,
    pub cancel: CancellationToken,
    pub active_workers: Arc<AtomicI64>,
    pub test_start: Instant,
}

/// Runs one worker until the request channel closes or the scope cancels.
pub async fn run_worker(ctx: WorkerContext) {
    debug!(worker_id = ctx.worker_id, "Worker entering task loop");

    // The scheduler holds its first task until every worker has added its
    // readiness permit, so a fast scheduler cannot close the channel into
    // a pool that is not listening yet.
    ctx.ready.add_permits(1);

    loop {
        let task = {
            let mut tasks = ctx.tasks.lock().await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    debug!(worker_id = ctx.worker_id, "Worker cancelled while waiting for a task");
                    return;
                }
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => {
                        debug!(worker_id = ctx.worker_id, "Request channel closed, worker exiting");
                        return;
                    }
                },
            }
        };

        if !task.start_offset.is_zero() {
            let release_at = ctx.test_start + task.start_offset;
            // sleep_until returns immediately when the offset already passed,
            // so a slow worker catches up instead of stretching the ramp.
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    debug!(worker_id = ctx.worker_id, "Worker cancelled during ramp-up wait");
                    return;
                }
                _ = sleep_until(release_at) => {}
            }
        }

        ctx.active_workers.fetch_add(1, Ordering::SeqCst);
        let request_start = Instant::now();

        let exchange = execute_request(&ctx.client, &ctx.request, &ctx.cancel).await;

        let duration_ms = request_start.elapsed().as_millis() as u64;
        let elapsed_ms = ctx.test_start.elapsed().as_millis() as u64;
        ctx.active_workers.fetch_sub(1, Ordering::SeqCst);

        let result = RequestResult {
            sequence: task.sequence,
            status_code: exchange.status_code,
            duration_ms,
            elapsed_ms,
            request_size: ctx.request.body_size(),
            response_size: exchange.response_size,
            body: exchange.body,
            error: exchange.error,
            timestamp: Utc::now(),
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(worker_id = ctx.worker_id, sequence = task.sequence,
                       "Worker cancelled before delivering result");
                return;
            }
            sent = ctx.results.send(result) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

struct Exchange {
    status_code: u16,
    response_size: u64,
    body: String,
    error: Option<String>,
}

/// One HTTP round-trip with the scope as the request context. A transport
/// failure yields status 0; a body-read failure keeps the status and sets
/// the error.
async fn execute_request(
    client: &reqwest::Client,
    spec: &RequestSpec,
    cancel: &CancellationToken,
) -> Exchange {
    let round_trip = async {
        match build_request(client, spec).send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                match response.text().await {
                    Ok(body) => Exchange {
                        status_code,
                        response_size: body.len() as u64,
                        body,
                        error: None,
                    },
                    Err(e) => Exchange {
                        status_code,
                        response_size: 0,
                        body: String::new(),
                        error: Some(format!("Failed to read response body: {e}")),
                    },
                }
            }
            Err(e) => Exchange {
                status_code: 0,
                response_size: 0,
                body: String::new(),
                error: Some(e.to_string()),
            },
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Exchange {
            status_code: 0,
            response_size: 0,
            body: String::new(),
            error: Some("request aborted: execution cancelled".to_string()),
        },
        exchange = round_trip => exchange,
    }
}

fn build_request(client: &reqwest::Client, spec: &RequestSpec) -> reqwest::RequestBuilder {
    let mut builder = match spec.method.to_uppercase().as_str() {
        "GET" => client.get(&spec.url),
        "POST" => client.post(&spec.url),
        "PUT" => client.put(&spec.url),
        "DELETE" => client.delete(&spec.url),
        "PATCH" => client.patch(&spec.url),
        "HEAD" => client.head(&spec.url),
        "OPTIONS" => client.request(reqwest::Method::OPTIONS, &spec.url),
        method => match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => client.request(m, &spec.url),
            Err(_) => {
                error!(method = %method, "Unsupported HTTP method, falling back to GET");
                client.get(&spec.url)
            }
        },
    };

    for (name, value) in &spec.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &spec.body {
        builder = builder.body(body.clone());
    }

    builder
}
