//! Stress-test execution engine.
//!
//! The executor owns one run end to end: it validates the configuration,
//! creates the run record, builds the shared HTTP client, and coordinates
//! the scheduler, worker pool and collector over two bounded channels.
//! Cancellation from any source (user stop, test-duration deadline,
//! teardown) converges on a single scope token; termination classifies the
//! run and finalizes its summary exactly once.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{build_client, ClientError};
use crate::config::{ConfigError, StressConfig};
use crate::request::{RequestSpec, TlsConfig};
use crate::stats::{LoadStats, StatsSnapshot};
use crate::store::{Metric, Run, RunStatus, StoreManager};
use crate::validator::validate_response;
use crate::worker::{run_worker, RequestResult, Task, WorkerContext};

/// Metrics are flushed to the store in batches of this size.
const METRICS_BUFFER: usize = 100;

/// Everything the engine needs to run one stress test.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub config: StressConfig,
    pub request: RequestSpec,
    pub tls: Option<TlsConfig>,
}

/// Errors surfaced by executor construction and teardown.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create run record: {0}")]
    CreateRun(#[source] crate::store::StoreError),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] ClientError),

    #[error("Executor was already started")]
    AlreadyStarted,

    #[error("Workers did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Channels allocated at construction, consumed by `start`.
#[derive(Debug)]
struct Channels {
    task_tx: mpsc::Sender<Task>,
    task_rx: mpsc::Receiver<Task>,
    result_tx: mpsc::Sender<RequestResult>,
    result_rx: mpsc::Receiver<RequestResult>,
}

/// Handles of the spawned run, taken exactly once at teardown. Dropping the
/// held `result_tx` is the one and only close of the result channel: the
/// channel truly closes once the joined workers have dropped their clones,
/// so no send can ever follow the close.
#[derive(Debug)]
struct RunningState {
    scheduler: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    collector: JoinHandle<()>,
    deadline: Option<JoinHandle<()>>,
    result_tx: mpsc::Sender<RequestResult>,
}

/// Orchestrator for one stress-test run.
///
/// The executor exclusively owns its [`Run`] record while running; after
/// finalization the store is the source of truth. Many executors may
/// coexist when they use distinct store handles.
#[derive(Debug)]
pub struct StressExecutor {
    config: StressConfig,
    request: Arc<RequestSpec>,
    manager: Arc<StoreManager>,
    client: reqwest::Client,
    cancel: CancellationToken,
    stats: Arc<Mutex<LoadStats>>,
    active_workers: Arc<AtomicI64>,
    run: Mutex<Run>,
    pending: Mutex<Option<Channels>>,
    running: Mutex<Option<RunningState>>,
    test_start: Mutex<Option<Instant>>,
    finalized: AtomicBool,
}

impl StressExecutor {
    /// Validates the config, creates the `running` run record, and builds
    /// the shared HTTP client. Channel capacities are `2 x concurrent_conns`
    /// to give slack without unbounded memory.
    ///
    /// # Errors
    /// Any failure here is fatal and leaves no spawned work behind: an
    /// invalid config, a store that cannot create the run row, or TLS
    /// material that does not load.
    pub fn new(
        exec_config: ExecutionConfig,
        manager: Arc<StoreManager>,
    ) -> Result<Self, ExecError> {
        let ExecutionConfig {
            config,
            request,
            tls,
        } = exec_config;

        config.validate()?;

        let mut run = Run::for_config(&config);
        manager.create_run(&mut run).map_err(ExecError::CreateRun)?;

        let client = build_client(&config, tls.as_ref())?;

        let capacity = config.concurrent_conns as usize * 2;
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        Ok(Self {
            stats: Arc::new(Mutex::new(LoadStats::new(config.total_requests))),
            request: Arc::new(request),
            manager,
            client,
            cancel: CancellationToken::new(),
            active_workers: Arc::new(AtomicI64::new(0)),
            run: Mutex::new(run),
            pending: Mutex::new(Some(Channels {
                task_tx,
                task_rx,
                result_tx,
                result_rx,
            })),
            running: Mutex::new(None),
            test_start: Mutex::new(None),
            finalized: AtomicBool::new(false),
            config,
        })
    }

    /// Spawns the worker pool, collector, scheduler and optional deadline
    /// task. The scheduler releases no task until every worker has signaled
    /// readiness, so the request channel can never close into a pool that
    /// has not started listening.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// [`ExecError::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<(), ExecError> {
        let Channels {
            task_tx,
            task_rx,
            result_tx,
            result_rx,
        } = self
            .pending
            .lock()
            .unwrap()
            .take()
            .ok_or(ExecError::AlreadyStarted)?;

        let test_start = Instant::now();
        *self.test_start.lock().unwrap() = Some(test_start);

        let run_id = self.run.lock().unwrap().id;
        let worker_count = self.config.concurrent_conns;

        info!(
            run_id,
            workers = worker_count,
            total_requests = self.config.total_requests,
            ramp_up_secs = self.config.ramp_up_secs,
            duration_secs = self.config.duration_secs,
            "Starting stress test"
        );

        let ready = Arc::new(Semaphore::new(0));
        let tasks = Arc::new(tokio::sync::Mutex::new(task_rx));

        let mut workers = Vec::with_capacity(worker_count as usize);
        for worker_id in 0..worker_count {
            let ctx = WorkerContext {
                worker_id,
                client: self.client.clone(),
                request: self.request.clone(),
                tasks: tasks.clone(),
                results: result_tx.clone(),
                ready: ready.clone(),
                cancel: self.cancel.clone(),
                active_workers: self.active_workers.clone(),
                test_start,
            };
            workers.push(tokio::spawn(run_worker(ctx)));
        }

        let collector = tokio::spawn(run_collector(
            result_rx,
            self.request.clone(),
            self.stats.clone(),
            self.manager.clone(),
            run_id,
        ));

        let scheduler = tokio::spawn(run_scheduler(
            task_tx,
            ready,
            worker_count,
            self.config.total_requests,
            self.config.ramp_up(),
            self.stats.clone(),
            self.cancel.clone(),
        ));

        let deadline = self.config.test_duration().map(|duration| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {
                        info!(
                            duration_secs = duration.as_secs(),
                            "Test duration reached, cancelling execution"
                        );
                        cancel.cancel();
                    }
                }
            })
        });

        *self.running.lock().unwrap() = Some(RunningState {
            scheduler,
            workers,
            collector,
            deadline,
            result_tx,
        });

        Ok(())
    }

    /// Blocks until the run terminates, then classifies and finalizes it.
    ///
    /// Termination is reached when the scheduler has emitted its last task
    /// and the workers drained the channel, or when the scope cancels
    /// (deadline or user stop). Finalization happens after the collector's
    /// final flush, so the stored summary is consistent with the metrics.
    pub async fn wait(&self) -> Result<Run, ExecError> {
        self.teardown(None, None).await
    }

    /// Cancels the scope and finalizes the run as `cancelled`.
    pub async fn stop(&self) -> Result<Run, ExecError> {
        self.cancel.cancel();
        self.teardown(Some(RunStatus::Cancelled), None).await
    }

    /// Like [`stop`](Self::stop), but bounds the worker join. On expiry the
    /// stragglers are aborted, resources are still released and the run is
    /// still finalized, and the timeout is reported to the caller.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<Run, ExecError> {
        self.cancel.cancel();
        self.teardown(Some(RunStatus::Cancelled), Some(timeout)).await
    }

    async fn teardown(
        &self,
        override_status: Option<RunStatus>,
        join_timeout: Option<Duration>,
    ) -> Result<Run, ExecError> {
        let state = self.running.lock().unwrap().take();
        let Some(state) = state else {
            // Teardown already ran (or start was never called); report the
            // current record.
            return Ok(self.get_run());
        };
        let RunningState {
            scheduler,
            workers,
            collector,
            deadline,
            result_tx,
        } = state;

        let mut timed_out = false;
        let abort_handles: Vec<_> = workers.iter().map(|h| h.abort_handle()).collect();
        let scheduler_abort = scheduler.abort_handle();

        let join_workers = async {
            let _ = scheduler.await;
            for handle in workers {
                let _ = handle.await;
            }
        };

        match join_timeout {
            None => join_workers.await,
            Some(limit) => {
                if tokio::time::timeout(limit, join_workers).await.is_err() {
                    warn!(
                        timeout_ms = limit.as_millis() as u64,
                        "Workers did not finish in time, aborting"
                    );
                    scheduler_abort.abort();
                    for handle in &abort_handles {
                        handle.abort();
                    }
                    timed_out = true;
                }
            }
        }

        // One-shot close of the result channel: this sender and the joined
        // (or aborted) workers' clones are all of them.
        drop(result_tx);

        let _ = collector.await;

        let status = override_status.unwrap_or_else(|| self.classify());
        self.finalize(status).await;

        // Releases the deadline task when the run ended on its own.
        self.cancel.cancel();
        if let Some(handle) = deadline {
            let _ = handle.await;
        }

        if timed_out {
            // join_timeout is always Some on this path.
            return Err(ExecError::ShutdownTimeout(
                join_timeout.unwrap_or_default(),
            ));
        }
        Ok(self.get_run())
    }

    /// Terminal status per the completion rule: full completion wins;
    /// a cancelled scope counts as `completed` when a configured test
    /// duration has elapsed; anything else is `cancelled`.
    fn classify(&self) -> RunStatus {
        let (completed, target) = {
            let stats = self.stats.lock().unwrap();
            (stats.completed_requests, stats.total_requests)
        };
        if completed >= target {
            return RunStatus::Completed;
        }
        if self.cancel.is_cancelled() {
            if let Some(required) = self.config.test_duration() {
                let elapsed = self
                    .test_start
                    .lock()
                    .unwrap()
                    .map(|start| start.elapsed())
                    .unwrap_or_default();
                if elapsed >= required {
                    return RunStatus::Completed;
                }
            }
        }
        RunStatus::Cancelled
    }

    /// Writes the run summary exactly once. A store failure here is logged
    /// and swallowed; the in-memory record still carries the final state.
    async fn finalize(&self, status: RunStatus) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        let snapshot = {
            let stats = self.stats.lock().unwrap();
            let summary = stats.summarize();
            let mut run = self.run.lock().unwrap();
            run.status = status;
            run.completed_at = Some(Utc::now());
            run.total_sent = stats.requests_sent;
            run.total_completed = stats.completed_requests;
            run.total_errors = stats.error_count;
            run.total_validation_errors = stats.validation_error_count;
            run.avg_duration_ms = summary.avg_ms;
            run.min_duration_ms = summary.min_ms;
            run.max_duration_ms = summary.max_ms;
            run.p50_duration_ms = summary.p50_ms;
            run.p95_duration_ms = summary.p95_ms;
            run.p99_duration_ms = summary.p99_ms;
            run.clone()
        };

        info!(
            run_id = snapshot.id,
            status = status.as_str(),
            sent = snapshot.total_sent,
            completed = snapshot.total_completed,
            errors = snapshot.total_errors,
            validation_errors = snapshot.total_validation_errors,
            p95_ms = snapshot.p95_duration_ms,
            "Run finalized"
        );

        let manager = self.manager.clone();
        match tokio::task::spawn_blocking(move || manager.update_run(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to persist run summary"),
            Err(e) => error!(error = %e, "Run summary persistence task failed"),
        }
    }

    /// Value-copy statistics snapshot. `total_requests` is the configured
    /// target so callers can use it as the progress denominator.
    pub fn get_stats(&self) -> StatsSnapshot {
        let active = self.active_workers.load(Ordering::SeqCst);
        self.stats.lock().unwrap().snapshot(active)
    }

    /// Current run record (a clone; the executor stays the writer).
    pub fn get_run(&self) -> Run {
        self.run.lock().unwrap().clone()
    }

    /// True once the scope is cancelled, or every scheduled request has
    /// been observed by the collector.
    pub fn is_execution_complete(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        let stats = self.stats.lock().unwrap();
        stats.requests_sent > 0 && stats.completed_requests >= stats.requests_sent
    }
}

/// Awaits the readiness latch, then releases `total_requests` tasks with
/// their ramp-up offsets. Dropping the sender, on any exit path, is what
/// closes the request channel.
async fn run_scheduler(
    task_tx: mpsc::Sender<Task>,
    ready: Arc<Semaphore>,
    worker_count: u32,
    total_requests: u64,
    ramp_up: Duration,
    stats: Arc<Mutex<LoadStats>>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Scheduler cancelled before workers became ready");
            return;
        }
        acquired = ready.acquire_many(worker_count) => match acquired {
            Ok(permits) => permits.forget(),
            Err(_) => return,
        },
    }

    let per_task_delay = if ramp_up.is_zero() {
        Duration::ZERO
    } else {
        ramp_up / total_requests as u32
    };

    debug!(
        total_requests,
        per_task_delay_us = per_task_delay.as_micros() as u64,
        "Workers ready, scheduler releasing tasks"
    );

    for sequence in 0..total_requests {
        let task = Task {
            sequence,
            start_offset: per_task_delay * sequence as u32,
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(sequence, "Scheduler cancelled, closing request channel");
                return;
            }
            sent = task_tx.send(task) => {
                if sent.is_err() {
                    return;
                }
                stats.lock().unwrap().requests_sent += 1;
            }
        }
    }

    debug!(total_requests, "Scheduler emitted all tasks");
}

/// Consumes results until the channel closes: classifies each outcome,
/// updates the accumulator under the stats lock, and batch-persists
/// metrics. Store failures are logged and never stop the run.
async fn run_collector(
    mut results: mpsc::Receiver<RequestResult>,
    request: Arc<RequestSpec>,
    stats: Arc<Mutex<LoadStats>>,
    manager: Arc<StoreManager>,
    run_id: i64,
) {
    let mut buffer: Vec<Metric> = Vec::with_capacity(METRICS_BUFFER);

    while let Some(result) = results.recv().await {
        // Status >= 400 with a completed transport exchange is never a
        // network error; classification comes from the status predicate.
        let is_network_error = result.error.is_some() || result.status_code == 0;

        let validation_error = if is_network_error {
            None
        } else {
            validate_response(&request, result.status_code, &result.body)
                .err()
                .map(|failure| failure.to_string())
        };
        let is_validation_error = validation_error.is_some();

        stats
            .lock()
            .unwrap()
            .add_result(result.duration_ms, is_network_error, is_validation_error);

        buffer.push(Metric {
            id: 0,
            run_id,
            timestamp: result.timestamp,
            elapsed_ms: result.elapsed_ms,
            status_code: result.status_code,
            duration_ms: result.duration_ms,
            request_size: result.request_size,
            response_size: result.response_size,
            error_message: result.error,
            validation_error,
        });

        if buffer.len() >= METRICS_BUFFER {
            flush_metrics(&manager, &mut buffer).await;
        }
    }

    flush_metrics(&manager, &mut buffer).await;
    debug!(run_id, "Collector drained and flushed");
}

async fn flush_metrics(manager: &Arc<StoreManager>, buffer: &mut Vec<Metric>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len();
    let manager = manager.clone();
    match tokio::task::spawn_blocking(move || manager.save_metrics_batch(&batch)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, count, "Failed to persist metrics batch, run continues"),
        Err(e) => warn!(error = %e, count, "Metrics flush task failed, run continues"),
    }
}
