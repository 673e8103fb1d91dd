//! Time-driven scheduler.
//!
//! A single cooperative tick loop: every tick it drains due jobs from the
//! in-memory queue (up to the concurrency cap), removes them before
//! execution so a job runs at most once per tick, executes them
//! concurrently, and waits for all of them before the next tick. Ticks
//! never overlap. Job failures re-enqueue with a computed backoff until
//! the job attempt budget runs out.
//!
//! The queue is process-local and volatile; crash recovery is the
//! orchestrator's `retry_pending` sweep over persisted state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use beacon_core::{BnResult, NotificationStatus};

use crate::backoff::{compute_delay, Backoff, RetryPolicy};
use crate::store::DeliveryStore;

#[derive(Debug, Clone, serde::Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub max_concurrent_jobs: usize,
    pub max_job_attempts: u32,
    /// Backoff policy for failed job executions.
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            max_concurrent_jobs: 20,
            max_job_attempts: 5,
            retry_policy: RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                exponent: 2.0,
                jitter: true,
                adaptive: false,
            },
        }
    }
}

/// Transient queue entry; lives only in this process.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub priority: i32,
}

/// What the scheduler drives on each due job; implemented by the
/// dispatch orchestrator.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, notification_id: Uuid) -> BnResult<()>;
}

/// Cumulative counters exposed for observability.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub queue_depth: usize,
    pub executed: u64,
    pub failed: u64,
    pub retried: u64,
    pub delayed: u64,
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<DeliveryStore>,
    runner: Arc<dyn JobRunner>,
    queue: Mutex<Vec<ScheduledJob>>,
    running: AtomicBool,
    executed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    delayed: AtomicU64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<DeliveryStore>, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            config,
            store,
            runner,
            queue: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
        }
    }

    /// Queue a notification for dispatch. Returns the job id.
    pub async fn enqueue(
        &self,
        notification_id: Uuid,
        run_at: Option<DateTime<Utc>>,
        priority: Option<i32>,
    ) -> Uuid {
        let job = ScheduledJob {
            id: Uuid::now_v7(),
            notification_id,
            run_at: run_at.unwrap_or_else(Utc::now),
            attempts: 0,
            priority: priority.unwrap_or(0),
        };
        let id = job.id;
        self.queue.lock().await.push(job);
        tracing::debug!(job_id = %id, notification_id = %notification_id, "job enqueued");
        id
    }

    /// Run the tick loop until `stop()` or a shutdown signal.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            tick_ms = self.config.tick_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            "scheduler started"
        );

        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.tick_interval_ms));
        interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.tick().await;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Prevent further ticks; the loop finishes its current tick first.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.is_running(),
            queue_depth: self.queue_depth().await,
            executed: self.executed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            delayed: self.delayed.load(Ordering::SeqCst),
        }
    }

    /// One tick: select due jobs up to the cap, remove them from the
    /// queue, execute concurrently, and wait for all of them.
    pub async fn tick(&self) {
        let now = Utc::now();
        let batch = {
            let mut queue = self.queue.lock().await;
            let mut due: Vec<ScheduledJob> = Vec::new();
            let mut rest: Vec<ScheduledJob> = Vec::new();
            for job in queue.drain(..) {
                if job.run_at <= now {
                    due.push(job);
                } else {
                    rest.push(job);
                }
            }
            // Highest priority first, then oldest run_at.
            due.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.run_at.cmp(&b.run_at)));

            if due.len() > self.config.max_concurrent_jobs {
                let overflow = due.split_off(self.config.max_concurrent_jobs);
                self.delayed.fetch_add(overflow.len() as u64, Ordering::SeqCst);
                rest.extend(overflow);
            }
            *queue = rest;
            due
        };

        if batch.is_empty() {
            return;
        }

        tracing::debug!(jobs = batch.len(), "tick executing due jobs");
        futures::future::join_all(batch.into_iter().map(|job| self.execute_job(job))).await;
    }

    async fn execute_job(&self, job: ScheduledJob) {
        let notification = match self.store.get_notification(job.notification_id).await {
            Ok(Some(n)) => n,
            Ok(None) => {
                tracing::warn!(
                    job_id = %job.id,
                    notification_id = %job.notification_id,
                    "job references missing notification, dropping"
                );
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "job load failed");
                self.reschedule(job).await;
                return;
            }
        };

        if notification.status != NotificationStatus::Pending {
            // Already resolved by another path; nothing to do.
            tracing::debug!(
                job_id = %job.id,
                status = %notification.status,
                "notification already resolved, skipping job"
            );
            return;
        }

        match self.runner.run(job.notification_id).await {
            Ok(()) => {
                self.executed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    notification_id = %job.notification_id,
                    error = %e,
                    "job execution failed"
                );
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.reschedule(job).await;
            }
        }
    }

    /// Failure handling: bump the attempt counter and re-enqueue with a
    /// computed delay, or mark the notification failed once the budget is
    /// spent.
    async fn reschedule(&self, mut job: ScheduledJob) {
        job.attempts += 1;

        let exhausted = job.attempts >= self.config.max_job_attempts;
        let backoff = if exhausted {
            Backoff::Abandon
        } else {
            compute_delay(job.attempts, &self.config.retry_policy, None)
        };

        match backoff {
            Backoff::Delay(delay_ms) => {
                job.run_at = Utc::now() + Duration::milliseconds(delay_ms as i64);
                tracing::info!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    delay_ms,
                    "job rescheduled"
                );
                self.queue.lock().await.push(job);
                self.retried.fetch_add(1, Ordering::SeqCst);
            }
            Backoff::Abandon => {
                tracing::error!(
                    job_id = %job.id,
                    notification_id = %job.notification_id,
                    attempts = job.attempts,
                    "job attempts exhausted, marking notification failed"
                );
                if let Err(e) = self
                    .store
                    .update_notification_status(job.notification_id, NotificationStatus::Failed)
                    .await
                {
                    tracing::error!(
                        notification_id = %job.notification_id,
                        error = %e,
                        "failed to mark notification failed"
                    );
                }
            }
        }
    }
}
