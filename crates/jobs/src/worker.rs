//! Background loops of a worker process.
//!
//! One consumer per declared queue (bounded by the queue's concurrency), one
//! stall monitor per queue, and optionally the scheduler tick loop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::SchedulerConfig;
use crate::execution::{ExecutionError, JobExecutionService};
use crate::processor::{JobProcessor, ProcessOutcome};
use crate::queue::{Delivery, FailOutcome, QueueError, SharedJobQueue, StallReport};
use crate::registry::{JobRegistry, RegisteredQueue};
use crate::scheduling::SchedulingJobService;

const MIN_LOOP_PERIOD: Duration = Duration::from_millis(10);

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Stale, locked, disabled, unknown or already finished items.
    pub jobs_skipped: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_stalled: u64,
    /// Handlers cancelled at their timeout, left for stall redelivery.
    pub jobs_timed_out: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control running workers.
///
/// Dropping the handle without calling [`JobsHandle::shutdown`] also stops
/// the loops, but does not wait for in-flight handlers.
#[derive(Debug)]
pub struct JobsHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl JobsHandle {
    /// Stop fetching and scheduling, then wait for in-flight handlers.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("job workers stopped");
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Drives the processor, the queues and the scheduler.
pub struct Worker {
    worker_id: String,
    registry: Arc<JobRegistry>,
    queue: SharedJobQueue,
    processor: JobProcessor,
    scheduler: SchedulingJobService,
    executions: JobExecutionService,
    config: SchedulerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        registry: Arc<JobRegistry>,
        queue: SharedJobQueue,
        processor: JobProcessor,
        scheduler: SchedulingJobService,
        executions: JobExecutionService,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            registry,
            queue,
            processor,
            scheduler,
            executions,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Spawn consumers and stall monitors for every queue, plus the scheduler
    /// when `run_scheduler` is set.
    pub fn spawn(self, run_scheduler: bool) -> JobsHandle {
        let (shutdown, _) = watch::channel(false);
        let worker = Arc::new(self);
        let span = info_span!("worker", worker_id = %worker.worker_id);
        let mut tasks = Vec::new();

        for queue in worker.registry.queues() {
            tasks.push(tokio::spawn(
                worker
                    .clone()
                    .consume(queue.clone(), shutdown.subscribe())
                    .instrument(span.clone()),
            ));
            tasks.push(tokio::spawn(
                worker
                    .clone()
                    .monitor_stalls(queue.clone(), shutdown.subscribe())
                    .instrument(span.clone()),
            ));
        }
        if run_scheduler {
            tasks.push(tokio::spawn(
                worker
                    .clone()
                    .run_scheduler(shutdown.subscribe())
                    .instrument(span.clone()),
            ));
        }

        info!(
            worker_id = %worker.worker_id,
            queues = worker.registry.queues().len(),
            run_scheduler,
            "job workers started"
        );
        JobsHandle {
            shutdown,
            tasks,
            stats: worker.stats.clone(),
            started: Instant::now(),
        }
    }

    async fn consume(self: Arc<Self>, queue: RegisteredQueue, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(queue.options.concurrency));
        let mut in_flight = JoinSet::new();
        info!(queue = %queue.name, concurrency = queue.options.concurrency, "consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            let fetched = tokio::select! {
                fetched = self.queue.fetch(&queue.name, self.config.fetch_wait()) => fetched,
                _ = shutdown.changed() => break,
            };
            while in_flight.try_join_next().is_some() {}

            match fetched {
                Ok(Some(delivery)) => {
                    let worker = self.clone();
                    in_flight.spawn(async move {
                        worker.handle_delivery(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %queue.name, error = %e, "failed to fetch from queue");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.fetch_wait()) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        debug!(queue = %queue.name, in_flight = in_flight.len(), "draining consumer");
        while in_flight.join_next().await.is_some() {}
        info!(queue = %queue.name, "consumer stopped");
    }

    /// Process one delivery and settle it with the queue.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        self.update_stats(|s| s.current_running += 1);

        match self.processor.process(&delivery).await {
            Ok(outcome) => {
                self.settle(&delivery, &outcome).await;
                self.update_stats(|s| match outcome {
                    ProcessOutcome::Completed => s.jobs_succeeded += 1,
                    ProcessOutcome::TimedOut => s.jobs_timed_out += 1,
                    _ => s.jobs_skipped += 1,
                });
            }
            Err(err) => {
                let message = err.to_string();
                self.update_stats(|s| s.jobs_failed += 1);
                match self.queue.fail(&delivery, &message).await {
                    Ok(FailOutcome::Retrying { attempt, delay }) => {
                        info!(
                            job = %delivery.item.job_name,
                            execution_id = %delivery.item.id,
                            attempt,
                            ?delay,
                            "job will be retried"
                        );
                    }
                    Ok(FailOutcome::Exhausted { attempts }) => {
                        warn!(
                            job = %delivery.item.job_name,
                            execution_id = %delivery.item.id,
                            attempts,
                            "retries exhausted, moved to failed set"
                        );
                        self.update_stats(|s| s.jobs_dead_lettered += 1);
                        if let Err(e) = self.executions.record_exhausted(delivery.item.id, &message).await {
                            error!(execution_id = %delivery.item.id, error = %e, "failed to record exhausted execution");
                        }
                    }
                    Err(e) => {
                        error!(execution_id = %delivery.item.id, error = %e, "failed to report failure to queue");
                    }
                }
            }
        }

        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
        });
    }

    /// Acknowledge a delivery the processor is done with.
    ///
    /// Triggered runs skipped on lock contention are postponed by the retry
    /// base delay instead; system runs are left to the next boundary. A timed
    /// out delivery is not touched, so its lease runs out and it stalls.
    async fn settle(&self, delivery: &Delivery, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::TimedOut => {}
            ProcessOutcome::SkippedLocked if !self.is_system(delivery) => {
                if let Err(e) = self.queue.postpone(delivery, delivery.retry.base_delay).await {
                    warn!(
                        execution_id = %delivery.item.id,
                        error = %e,
                        "failed to postpone contended job, it is redelivered once its lease expires"
                    );
                }
            }
            _ => {
                if let Err(e) = self.queue.complete(delivery).await {
                    error!(execution_id = %delivery.item.id, error = %e, "failed to acknowledge delivery");
                }
            }
        }
    }

    fn is_system(&self, delivery: &Delivery) -> bool {
        self.registry
            .get(&delivery.item.job_name)
            .is_some_and(|job| job.is_system())
    }

    async fn monitor_stalls(self: Arc<Self>, queue: RegisteredQueue, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(queue.options.stalled_interval.max(MIN_LOOP_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.check_stalled(&queue.name).await {
                error!(queue = %queue.name, error = %e, "stall check failed");
            }
        }
    }

    /// Reclaim stalled deliveries of `queue` and record their executions.
    pub async fn check_stalled(&self, queue: &str) -> Result<StallReport, QueueError> {
        let report = self.queue.reclaim_stalled(queue).await?;

        for item in &report.redelivered {
            warn!(job = %item.job_name, execution_id = %item.id, "delivery stalled, redelivering");
            match self.executions.record_stalled(item.id).await {
                Ok(()) | Err(ExecutionError::NotFound(_)) => {}
                Err(ExecutionError::AlreadyFinished { .. }) => {
                    debug!(execution_id = %item.id, "stalled delivery already finished");
                }
                Err(e) => error!(execution_id = %item.id, error = %e, "failed to record stalled execution"),
            }
        }
        for item in &report.exhausted {
            error!(job = %item.job_name, execution_id = %item.id, "job stalled more than allowable limit");
            if let Err(e) = self.executions.record_stall_limit_reached(item.id).await {
                if !matches!(e, ExecutionError::NotFound(_)) {
                    error!(execution_id = %item.id, error = %e, "failed to record stall limit");
                }
            }
        }

        let stalled = (report.redelivered.len() + report.exhausted.len()) as u64;
        let exhausted = report.exhausted.len() as u64;
        self.update_stats(|s| {
            s.jobs_stalled += stalled;
            s.jobs_dead_lettered += exhausted;
        });
        Ok(report)
    }

    async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval().max(MIN_LOOP_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_interval = ?self.config.tick_interval(), "scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.scheduler.tick().await {
                error!(error = %e, "scheduler tick failed");
            }
        }
        info!("scheduler stopped");
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.lock().unwrap();
        f(&mut stats);
    }
}
