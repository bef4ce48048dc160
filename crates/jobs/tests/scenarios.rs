//! End-to-end scenarios over the in-memory collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};

use platform_core::{ManualClock, SharedClock, SystemClock};
use platform_jobs::{
    ConfigError, Delivery, EnqueueOptions, EnqueueOutcome, ExecutionStatus, FailOutcome,
    InMemoryJobQueue, InMemoryJobStore, InMemoryLockProvider, JobConfig, JobContext, JobHandler,
    JobQueue, Jobs, JobsConfig, LockProvider, QueueConfig, QueueError, QueueItem, QueueOptions,
    RetryPolicy, ScheduleSpec, SharedJobQueue, StallReport, TriggerRequest, register_queues,
};

const NO_WAIT: Duration = Duration::ZERO;

struct Harness {
    clock: ManualClock,
    store: Arc<InMemoryJobStore>,
    locks: Arc<InMemoryLockProvider>,
    queue: Arc<InMemoryJobQueue>,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());
        Self {
            store: Arc::new(InMemoryJobStore::new()),
            locks: Arc::new(InMemoryLockProvider::with_clock(shared.clone())),
            queue: Arc::new(InMemoryJobQueue::with_clock(shared)),
            clock,
        }
    }

    fn shared_clock(&self) -> SharedClock {
        Arc::new(self.clock.clone())
    }

    async fn jobs(&self, config: JobsConfig, calls: Arc<AtomicU32>, fail_first: u32) -> Jobs {
        self.jobs_on(self.queue.clone(), config, calls, fail_first).await
    }

    async fn jobs_on(
        &self,
        queue: SharedJobQueue,
        config: JobsConfig,
        calls: Arc<AtomicU32>,
        fail_first: u32,
    ) -> Jobs {
        let mut builder = Jobs::builder(config.clone())
            .store(self.store.clone())
            .locks(self.locks.clone())
            .queue(queue)
            .clock(self.shared_clock());
        for job in config.all_jobs() {
            builder = builder.handler(job.name.clone(), counting(calls.clone(), fail_first));
        }
        let jobs = builder.build().await.unwrap();
        jobs.initialize().await.unwrap();
        jobs
    }
}

struct Counting {
    calls: Arc<AtomicU32>,
    fail_first: u32,
}

#[async_trait::async_trait]
impl JobHandler for Counting {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        anyhow::ensure!(
            call > self.fail_first,
            "attempt {} of {} failed",
            ctx.attempt,
            ctx.job_name
        );
        Ok(())
    }
}

fn counting(calls: Arc<AtomicU32>, fail_first: u32) -> Counting {
    Counting { calls, fail_first }
}

/// Sleeps far past any test timeout on its first call, succeeds afterwards.
struct HangsOnce {
    calls: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl JobHandler for HangsOnce {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}

/// In-memory queue whose `postpone` always fails.
struct UnreachableOnPostpone(Arc<InMemoryJobQueue>);

#[async_trait::async_trait]
impl JobQueue for UnreachableOnPostpone {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), QueueError> {
        self.0.declare_queue(name, options).await
    }

    async fn enqueue(
        &self,
        queue: &str,
        item: QueueItem,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        self.0.enqueue(queue, item, options).await
    }

    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.0.fetch(queue, wait).await
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.0.heartbeat(delivery).await
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.0.complete(delivery).await
    }

    async fn postpone(&self, _delivery: &Delivery, _delay: Duration) -> Result<(), QueueError> {
        Err(QueueError::Connection("connection reset by peer".into()))
    }

    async fn fail(&self, delivery: &Delivery, error: &str) -> Result<FailOutcome, QueueError> {
        self.0.fail(delivery, error).await
    }

    async fn reclaim_stalled(&self, queue: &str) -> Result<StallReport, QueueError> {
        self.0.reclaim_stalled(queue).await
    }
}

fn system_config(every_secs: u64) -> JobsConfig {
    JobsConfig {
        queues: vec![QueueConfig::new("maintenance")],
        system_jobs: vec![
            JobConfig::new("cleanup", "maintenance")
                .with_schedule(ScheduleSpec::EverySecs(every_secs))
                .singleton(),
        ],
        ..Default::default()
    }
}

fn triggered_config() -> JobsConfig {
    JobsConfig {
        queues: vec![QueueConfig::new("work")],
        jobs: vec![
            JobConfig::new("flaky", "work").with_retry(RetryPolicy::fixed(3, Duration::from_secs(1))),
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn two_schedulers_at_one_boundary_enqueue_once() {
    // Each replica keeps its own view of the job rows; only the queue is shared.
    let harness = Harness::new();
    let replica = Harness {
        clock: harness.clock.clone(),
        store: Arc::new(InMemoryJobStore::new()),
        locks: harness.locks.clone(),
        queue: harness.queue.clone(),
    };
    let calls = Arc::new(AtomicU32::new(0));
    let a = harness.jobs(system_config(60), calls.clone(), 0).await;
    let b = replica.jobs(system_config(60), calls, 0).await;

    harness.clock.advance(chrono::Duration::seconds(45));
    let (first, second) = tokio::join!(a.scheduler().tick(), b.scheduler().tick());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.enqueued + second.enqueued, 1);
    assert_eq!(first.collapsed + second.collapsed, 1);
    assert_eq!(harness.queue.waiting_len("maintenance"), 1);
}

#[tokio::test]
async fn failure_then_success_completes_with_two_attempts() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let jobs = harness.jobs(triggered_config(), calls.clone(), 1).await;
    let worker = jobs.worker();

    let EnqueueOutcome::Enqueued(id) = jobs.trigger(TriggerRequest::new("flaky")).await.unwrap() else {
        panic!("trigger collapsed");
    };

    let first = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    worker.handle_delivery(first).await;
    assert!(harness.queue.fetch("work", NO_WAIT).await.unwrap().is_none());

    harness.clock.advance(chrono::Duration::seconds(1));
    let second = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    assert_eq!(second.item.id, id);
    worker.handle_delivery(second).await;

    let execution = jobs.executions().get(id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.attempts, 2);
    assert!(execution.finished_at.unwrap() >= execution.started_at.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = worker.stats();
    assert_eq!(stats.jobs_failed, 1);
    assert_eq!(stats.jobs_succeeded, 1);
}

#[tokio::test]
async fn exhausted_retries_end_in_failed_set() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let jobs = harness.jobs(triggered_config(), calls, u32::MAX).await;
    let worker = jobs.worker();

    let EnqueueOutcome::Enqueued(id) = jobs.trigger(TriggerRequest::new("flaky")).await.unwrap() else {
        panic!("trigger collapsed");
    };
    for _ in 0..3 {
        let delivery = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
        worker.handle_delivery(delivery).await;
        harness.clock.advance(chrono::Duration::seconds(1));
    }

    let execution = jobs.executions().get(id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.attempts, 3);
    assert!(execution.is_finished());
    assert_eq!(harness.queue.failed("work").len(), 1);
    assert_eq!(worker.stats().jobs_dead_lettered, 1);
}

#[tokio::test]
async fn crashed_lock_holder_is_reclaimed_after_ttl() {
    let harness = Harness::new();
    let ttl = Duration::from_secs(5);

    let crashed = harness.locks.acquire("job-lock:cleanup", ttl).await.unwrap();
    assert!(crashed.is_some());
    assert!(harness.locks.acquire("job-lock:cleanup", ttl).await.unwrap().is_none());

    harness.clock.advance(chrono::Duration::seconds(5));
    assert!(harness.locks.acquire("job-lock:cleanup", ttl).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_have_exactly_one_winner() {
    let locks = Arc::new(InMemoryLockProvider::new());
    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("job-lock:cleanup", Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn stale_items_are_discarded_after_redeploy() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let before = harness.jobs(system_config(60), calls.clone(), 0).await;

    harness.clock.advance(chrono::Duration::seconds(45));
    assert_eq!(before.scheduler().tick().await.unwrap().enqueued, 1);
    let queued = harness.queue.fetch("maintenance", NO_WAIT).await.unwrap().unwrap();

    // Redeploy with a new schedule: the version moves on.
    let after = harness.jobs(system_config(30), calls.clone(), 0).await;
    assert_eq!(after.versions().get_version("cleanup").await.unwrap(), 2);
    assert!(!after.versions().is_current("cleanup", queued.item.job_version).await.unwrap());

    let worker = after.worker();
    worker.handle_delivery(queued.clone()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!harness.locks.is_held("job-lock:cleanup"));
    assert_eq!(harness.queue.active_len("maintenance"), 0);
    let execution = after.executions().get(queued.item.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(worker.stats().jobs_skipped, 1);
}

#[tokio::test]
async fn stalled_delivery_is_recorded_and_redelivered() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let jobs = harness.jobs(triggered_config(), calls.clone(), 0).await;
    let worker = jobs.worker();

    let EnqueueOutcome::Enqueued(id) = jobs.trigger(TriggerRequest::new("flaky")).await.unwrap() else {
        panic!("trigger collapsed");
    };
    // Fetched by a worker that dies before reporting.
    let lost = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    jobs.executions().record_start("flaky", lost.item.job_version, id).await.unwrap();

    harness.clock.advance(chrono::Duration::seconds(31));
    let report = worker.check_stalled("work").await.unwrap();
    assert_eq!(report.redelivered.len(), 1);
    assert_eq!(
        jobs.executions().get(id).await.unwrap().unwrap().status,
        ExecutionStatus::Stalled
    );

    let redelivered = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    assert_eq!(redelivered.stalled_count, 1);
    worker.handle_delivery(redelivered).await;

    let execution = jobs.executions().get(id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timed_out_handler_stalls_without_using_an_attempt() {
    let harness = Harness::new();
    let config = JobsConfig {
        queues: vec![QueueConfig::new("work")],
        jobs: vec![
            JobConfig::new("slow", "work")
                .with_retry(RetryPolicy::fixed(2, Duration::from_secs(1)))
                .with_timeout(Duration::from_millis(20)),
        ],
        ..Default::default()
    };
    let calls = Arc::new(AtomicU32::new(0));
    let jobs = Jobs::builder(config)
        .store(harness.store.clone())
        .locks(harness.locks.clone())
        .queue(harness.queue.clone())
        .clock(harness.shared_clock())
        .handler("slow", HangsOnce { calls: calls.clone() })
        .build()
        .await
        .unwrap();
    jobs.initialize().await.unwrap();
    let worker = jobs.worker();

    let EnqueueOutcome::Enqueued(id) = jobs.trigger(TriggerRequest::new("slow")).await.unwrap() else {
        panic!("trigger collapsed");
    };
    let first = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    worker.handle_delivery(first).await;

    assert_eq!(worker.stats().jobs_timed_out, 1);
    assert_eq!(worker.stats().jobs_failed, 0);
    assert_eq!(harness.queue.active_len("work"), 1);
    assert!(harness.queue.failed("work").is_empty());

    harness.clock.advance(chrono::Duration::seconds(31));
    let report = worker.check_stalled("work").await.unwrap();
    assert_eq!(report.redelivered.len(), 1);
    assert_eq!(
        jobs.executions().get(id).await.unwrap().unwrap().status,
        ExecutionStatus::Stalled
    );

    let redelivered = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    assert_eq!(redelivered.stalled_count, 1);
    assert_eq!(redelivered.attempt, 1);
    worker.handle_delivery(redelivered).await;

    let execution = jobs.executions().get(id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

fn contended_config() -> JobsConfig {
    JobsConfig {
        queues: vec![QueueConfig::new("work")],
        jobs: vec![
            JobConfig::new("report", "work")
                .with_retry(RetryPolicy::fixed(3, Duration::from_secs(1)))
                .singleton(),
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn contended_trigger_is_postponed_with_its_dedup_key() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let jobs = harness.jobs(contended_config(), calls.clone(), 0).await;
    let worker = jobs.worker();
    let held = harness
        .locks
        .acquire("job-lock:report", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let request = TriggerRequest::new("report").dedup_key("report-7");
    let EnqueueOutcome::Enqueued(id) = jobs.trigger(request).await.unwrap() else {
        panic!("trigger collapsed");
    };
    let contended = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    worker.handle_delivery(contended).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.queue.active_len("work"), 0);
    assert_eq!(harness.queue.waiting_len("work"), 1);

    harness.locks.release(&held).await.unwrap();
    harness.clock.advance(chrono::Duration::seconds(1));
    let again = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    assert_eq!(again.item.id, id);
    assert_eq!(again.item.dedup_key.as_deref(), Some("report-7"));
    assert_eq!(again.attempt, 1);
    worker.handle_delivery(again).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let execution = jobs.executions().get(id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.correlation_key.as_deref(), Some("report-7"));
}

#[tokio::test]
async fn contended_trigger_survives_a_failed_postpone() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let queue = Arc::new(UnreachableOnPostpone(harness.queue.clone()));
    let jobs = harness.jobs_on(queue, contended_config(), calls.clone(), 0).await;
    let worker = jobs.worker();
    let held = harness
        .locks
        .acquire("job-lock:report", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let EnqueueOutcome::Enqueued(id) = jobs.trigger(TriggerRequest::new("report")).await.unwrap() else {
        panic!("trigger collapsed");
    };
    let contended = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    worker.handle_delivery(contended).await;

    // Still leased: nothing acknowledged the item.
    assert_eq!(harness.queue.active_len("work"), 1);

    harness.locks.release(&held).await.unwrap();
    harness.clock.advance(chrono::Duration::seconds(31));
    assert_eq!(worker.check_stalled("work").await.unwrap().redelivered.len(), 1);

    let again = harness.queue.fetch("work", NO_WAIT).await.unwrap().unwrap();
    assert_eq!(again.item.id, id);
    worker.handle_delivery(again).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        jobs.executions().get(id).await.unwrap().unwrap().status,
        ExecutionStatus::Completed
    );
}

#[tokio::test]
async fn triggers_respect_dedup_keys_and_disabled_jobs() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let jobs = harness.jobs(triggered_config(), calls.clone(), 0).await;

    let request = TriggerRequest::new("flaky")
        .payload(serde_json::json!({"invoice": 42}))
        .dedup_key("invoice-42");
    assert!(matches!(
        jobs.trigger(request.clone()).await.unwrap(),
        EnqueueOutcome::Enqueued(_)
    ));
    assert!(matches!(
        jobs.trigger(request).await.unwrap(),
        EnqueueOutcome::Duplicate { .. }
    ));
    assert!(jobs.trigger(TriggerRequest::new("ghost")).await.is_err());

    let mut config = triggered_config();
    config.jobs[0].enabled = false;
    let disabled = harness.jobs(config, calls, 0).await;
    assert!(disabled.trigger(TriggerRequest::new("flaky")).await.is_err());
}

#[tokio::test]
async fn running_workers_process_and_shut_down() {
    let mut config = triggered_config();
    config.scheduler.fetch_wait_ms = 20;
    let calls = Arc::new(AtomicU32::new(0));
    let jobs = Jobs::builder(config)
        .handler("flaky", counting(calls.clone(), 0))
        .clock(SystemClock::shared())
        .build()
        .await
        .unwrap();
    jobs.initialize().await.unwrap();
    let handle = jobs.start(true);

    let EnqueueOutcome::Enqueued(id) = jobs.trigger(TriggerRequest::new("flaky")).await.unwrap() else {
        panic!("trigger collapsed");
    };

    let stats = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = handle.stats();
            if stats.jobs_processed == 1 {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    handle.shutdown().await;

    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let execution = jobs.executions().get(id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.finished_at.unwrap() >= execution.started_at.unwrap());
}

#[test]
fn queue_registration_is_idempotent_and_strict() {
    let config = triggered_config();
    assert_eq!(register_queues(&config), register_queues(&config));
    assert!(register_queues(&config).is_ok());

    let mut idle = config;
    idle.queues.push(QueueConfig::new("idle"));
    assert_eq!(
        register_queues(&idle),
        Err(ConfigError::QueueWithoutJobs("idle".into()))
    );
}
