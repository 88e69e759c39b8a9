//! Worker pool supervisor -- spawns N workers on a queue, runs the shared
//! maintenance loops, and drains in-flight work on shutdown.
//!
//! A `CancellationToken` signals shutdown, an `mpsc` channel reports worker
//! completions back to the supervisor, and a bounded `tokio::select!` drain
//! loop gives in-flight attempts a grace period instead of killing them
//! outright.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::manager::QueueManager;
use crate::registry::TaskRegistry;
use crate::worker::{CycleOutcome, Worker};

/// Configuration for one worker pool instance, one per `taskq run-worker`
/// process invocation.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queue_name: String,
    pub worker_count: usize,
    /// Stop after this many tasks have been processed across the whole
    /// pool. `None` means run until shutdown is signalled.
    pub max_tasks: Option<u64>,
    pub poll_interval: Duration,
    /// A task stuck in `processing` longer than this is presumed
    /// abandoned by a dead worker. Checked every `5 * poll_interval`.
    pub processing_timeout: ChronoDuration,
    /// Grace period given to in-flight attempts when shutdown is signalled.
    pub shutdown_grace: Duration,
}

/// How the pool's run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolOutcome {
    /// `max_tasks` was reached.
    MaxTasksReached,
    /// Shutdown was requested and all in-flight attempts drained cleanly.
    ShutdownClean,
    /// Shutdown was requested but the grace period elapsed before every
    /// in-flight attempt finished.
    ShutdownForced,
    /// A worker hit a broker/store error it could not recover from; the
    /// whole pool is torn down so the process can exit non-zero and be
    /// restarted by whatever supervises it (init system, orchestrator).
    Fatal(String),
}

pub struct WorkerPoolSupervisor {
    config: PoolConfig,
    manager: Arc<QueueManager>,
    registry: Arc<TaskRegistry>,
}

impl WorkerPoolSupervisor {
    pub fn new(config: PoolConfig, manager: Arc<QueueManager>, registry: Arc<TaskRegistry>) -> Self {
        Self {
            config,
            manager,
            registry,
        }
    }

    /// Run the pool until `max_tasks` is reached or `shutdown` is
    /// cancelled. Spawns `worker_count` claim/dispatch loops plus the two
    /// maintenance loops (`promote_delayed` every `poll_interval`,
    /// `reclaim_stale` every `5 * poll_interval`).
    pub async fn run(&self, shutdown: CancellationToken) -> PoolOutcome {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(self.config.worker_count.max(1));
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(self.config.worker_count.max(1));
        let hostname = hostname_or_unknown();
        let pid = process::id();

        let mut handles = Vec::with_capacity(self.config.worker_count);
        for ordinal in 0..self.config.worker_count {
            let worker_id = format!("{hostname}:{pid}:{ordinal}");
            let worker = Worker::new(
                worker_id,
                self.config.queue_name.clone(),
                self.manager.clone(),
                self.registry.clone(),
            );
            let poll_interval = self.config.poll_interval;
            let token = shutdown.clone();
            let done_tx = done_tx.clone();
            let fatal_tx = fatal_tx.clone();

            handles.push(tokio::spawn(async move {
                // Broker/store errors are retried in place with backoff; a
                // short run of consecutive failures without a single
                // successful cycle in between is treated as unrecoverable.
                const MAX_CONSECUTIVE_ERRORS: u32 = 5;
                let mut consecutive_errors: u32 = 0;

                loop {
                    if token.is_cancelled() {
                        break;
                    }
                    match worker.run_once().await {
                        Ok(CycleOutcome::Ran) => {
                            consecutive_errors = 0;
                            if done_tx.send(()).await.is_err() {
                                break;
                            }
                        }
                        Ok(CycleOutcome::Idle) => {
                            consecutive_errors = 0;
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {}
                                _ = token.cancelled() => break,
                            }
                        }
                        Err(err) => {
                            consecutive_errors += 1;
                            warn!(
                                worker = %worker.worker_id,
                                error = %err,
                                attempt = consecutive_errors,
                                "broker/store error, retrying in place"
                            );
                            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                                error!(worker = %worker.worker_id, error = %err, "worker giving up after repeated errors");
                                let _ = fatal_tx.send(err.to_string()).await;
                                break;
                            }
                            let backoff = poll_interval.saturating_mul(consecutive_errors);
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = token.cancelled() => break,
                            }
                        }
                    }
                }
            }));
        }
        drop(done_tx);
        drop(fatal_tx);

        let maintenance_handle = self.spawn_maintenance(shutdown.clone());

        let mut completed: u64 = 0;
        let outcome = loop {
            tokio::select! {
                maybe = done_rx.recv() => {
                    match maybe {
                        Some(()) => {
                            completed += 1;
                            if let Some(max) = self.config.max_tasks {
                                if completed >= max {
                                    shutdown.cancel();
                                    break PoolOutcome::MaxTasksReached;
                                }
                            }
                        }
                        None => break PoolOutcome::ShutdownClean,
                    }
                }
                fatal = fatal_rx.recv() => {
                    if let Some(message) = fatal {
                        shutdown.cancel();
                        self.drain(handles, done_rx).await;
                        break PoolOutcome::Fatal(message);
                    }
                }
                _ = shutdown.cancelled() => {
                    break self.drain(handles, done_rx).await;
                }
            }
        };

        maintenance_handle.abort();
        outcome
    }

    async fn drain(
        &self,
        handles: Vec<tokio::task::JoinHandle<()>>,
        mut done_rx: mpsc::Receiver<()>,
    ) -> PoolOutcome {
        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            if handles.iter().all(|h| h.is_finished()) {
                return PoolOutcome::ShutdownClean;
            }
            tokio::select! {
                _ = done_rx.recv() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    for handle in &handles {
                        handle.abort();
                    }
                    return PoolOutcome::ShutdownForced;
                }
            }
        }
    }

    fn spawn_maintenance(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let queue_name = self.config.queue_name.clone();
        let poll_interval = self.config.poll_interval;
        let processing_timeout = self.config.processing_timeout;

        tokio::spawn(async move {
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => return,
                }
                ticks += 1;

                if let Err(err) = manager.promote_delayed(&queue_name).await {
                    error!(queue = %queue_name, error = %err, "promote_delayed failed");
                }

                if ticks % 5 == 0 {
                    match manager.reclaim_stale(&queue_name, processing_timeout).await {
                        Ok(count) if count > 0 => {
                            info!(queue = %queue_name, count, "reclaimed stale tasks");
                        }
                        Ok(_) => {}
                        Err(err) => error!(queue = %queue_name, error = %err, "reclaim_stale failed"),
                    }
                }
            }
        })
    }
}

fn hostname_or_unknown() -> String {
    hostname_from_env().unwrap_or_else(|| "unknown-host".to_owned())
}

fn hostname_from_env() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty())
}
