//! Dispatcher: the timer-driven event processor.
//!
//! **Core invariant: single-flight.** Each tick dequeues at most one job and
//! awaits its transfer (fallback included) before the next tick is taken, so
//! queue depth never turns into parallel transfers.
//!
//! Flow per tick:
//! 1. Stop flag check
//! 2. `queue.dequeue()` → nothing to do if empty
//! 3. `RulesEngine::evaluate()` → routing code
//! 4. `TransferExecutor::transfer()` → outcome, logged
//!
//! Job failures are logged and dropped; the loop keeps polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::pipeline::queue::ConcurrentQueue;
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::Job;
use crate::transfer::{TransferExecutor, TransferOutcome};

/// Default polling interval.
pub const DEFAULT_TICK: Duration = Duration::from_millis(200);

/// Running totals, shared with the handle.
#[derive(Debug, Default)]
pub struct DispatchStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl DispatchStats {
    /// Jobs taken off the queue and finished (any result).
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Acquire)
    }

    /// Jobs that ended in an error or a failed transfer.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    fn record(&self, success: bool) {
        if success {
            self.succeeded.fetch_add(1, Ordering::AcqRel);
        } else {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        self.processed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Owns the consumer side of the queue plus the read-only routing and
/// transfer configuration.
pub struct Dispatcher {
    queue: Arc<ConcurrentQueue<Job>>,
    rules: RulesEngine,
    executor: TransferExecutor,
    tick: Duration,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<ConcurrentQueue<Job>>,
        rules: RulesEngine,
        executor: TransferExecutor,
    ) -> Self {
        Self {
            queue,
            rules,
            executor,
            tick: DEFAULT_TICK,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Override the polling interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn queue(&self) -> Arc<ConcurrentQueue<Job>> {
        Arc::clone(&self.queue)
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Route and transfer one job to completion.
    pub async fn process(&self, job: &Job) -> Result<TransferOutcome, DispatchError> {
        let code = self.rules.evaluate(job);
        info!(
            name = %job.name,
            hash = %job.hash,
            location = %job.location,
            code = %code,
            "Processing job"
        );

        self.executor
            .transfer(code, &job.location)
            .await
            .map_err(|source| DispatchError::Transfer {
                name: job.name.clone(),
                source,
            })
    }

    /// Dequeue and process a single job. `None` when the queue was empty.
    pub async fn tick_once(&self) -> Option<Result<TransferOutcome, DispatchError>> {
        let job = self.queue.dequeue()?;
        let result = self.process(&job).await;

        match &result {
            Ok(outcome) if outcome.succeeded() => {
                info!(
                    name = %job.name,
                    mode = %outcome.mode,
                    attempts = outcome.attempts,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Transfer complete"
                );
            }
            Ok(outcome) => {
                warn!(
                    name = %job.name,
                    status = ?outcome.status,
                    stderr = %outcome.stderr.trim_end(),
                    "Transfer failed, dropping job"
                );
            }
            Err(e) => {
                error!(error = %e, "Job failed, dropping it");
            }
        }

        self.stats
            .record(matches!(&result, Ok(outcome) if outcome.succeeded()));
        debug!(remaining = self.queue.len(), "Tick finished");

        Some(result)
    }

    /// Spawn the polling loop.
    pub fn start(self) -> DispatcherHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let stats = Arc::clone(&self.stats);

        let handle = tokio::spawn(async move {
            info!(
                tick_ms = self.tick.as_millis() as u64,
                rules = self.rules.rules().len(),
                "Dispatcher started"
            );

            let mut ticker = tokio::time::interval(self.tick);
            // A slow transfer pushes later ticks back instead of bursting.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if shutdown.load(Ordering::Acquire) {
                    info!(pending = self.queue.len(), "Dispatcher shutting down");
                    return;
                }

                self.tick_once().await;
            }
        });

        DispatcherHandle {
            handle,
            shutdown: shutdown_flag,
            stats,
        }
    }
}

/// Handle to a running dispatcher.
pub struct DispatcherHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<DispatchStats>,
}

impl DispatcherHandle {
    /// Ask the loop to exit at its next tick. An in-flight transfer finishes first.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.stop();
        self.handle.await
    }
}
