//! Queue/transport abstraction.
//!
//! Delivery is at-least-once. A fetched item is leased to the fetching worker
//! until it is completed, failed, postponed, or its lease runs out without
//! heartbeat, in which case [`JobQueue::reclaim_stalled`] hands it out again.
//! Only failures use up attempts; stall redeliveries and postponements repeat
//! the attempt that was interrupted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use platform_core::{ExecutionId, SharedClock, SystemClock, add_std};

use crate::config::QueueConfig;
use crate::types::{QueueItem, RetryPolicy, STALL_LIMIT_ERROR};

/// Longest uninterrupted sleep inside a blocking fetch.
const POLL_SLICE: Duration = Duration::from_millis(25);

/// Per-queue transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    pub concurrency: usize,
    pub max_stalled_count: u32,
    pub stalled_interval: Duration,
    pub dedup_window: Duration,
}

impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_stalled_count: config.max_stalled_count,
            stalled_interval: config.stalled_interval(),
            dedup_window: config.dedup_window(),
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&QueueConfig::new(""))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    /// Collapses enqueues carrying the same key within the dedup window.
    pub dedup_key: Option<String>,
    pub delay: Option<Duration>,
    /// Native retry/backoff applied by the queue on [`JobQueue::fail`].
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(ExecutionId),
    /// Another enqueue with the same key won.
    Duplicate { dedup_key: String },
}

/// A leased item.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    /// Identifies this lease; stale receipts are rejected.
    pub receipt: String,
    pub item: QueueItem,
    /// 1-indexed attempt number. Failed attempts count, stalls do not.
    pub attempt: u32,
    pub stalled_count: u32,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another attempt after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Moved to the failed set.
    Exhausted { attempts: u32 },
}

/// Result of one stall scan.
#[derive(Debug, Clone, Default)]
pub struct StallReport {
    /// Put back for redelivery.
    pub redelivered: Vec<QueueItem>,
    /// Stalled more often than allowed and moved to the failed set.
    pub exhausted: Vec<QueueItem>,
}

impl StallReport {
    pub fn is_empty(&self) -> bool {
        self.redelivered.is_empty() && self.exhausted.is_empty()
    }
}

/// An item that will not be delivered again.
#[derive(Debug, Clone)]
pub struct FailedItem {
    pub item: QueueItem,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create the queue if needed. Idempotent.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), QueueError>;

    async fn enqueue(
        &self,
        queue: &str,
        item: QueueItem,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the next available item, waiting up to `wait` for one.
    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Renew the lease of an in-flight delivery.
    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Acknowledge. Idempotent; a lease that moved to another worker is
    /// left alone and reported as [`QueueError::LeaseLost`].
    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hand a leased item back for redelivery after `delay`, unchanged and
    /// without using up an attempt.
    async fn postpone(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Report a failed attempt and let the retry policy decide.
    async fn fail(&self, delivery: &Delivery, error: &str) -> Result<FailOutcome, QueueError>;

    /// Redeliver items whose lease ran out.
    async fn reclaim_stalled(&self, queue: &str) -> Result<StallReport, QueueError>;
}

pub type SharedJobQueue = Arc<dyn JobQueue>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("delivery lease lost: {0}")]
    LeaseLost(ExecutionId),
}

#[derive(Debug)]
enum EntryState {
    Waiting {
        available_at: DateTime<Utc>,
    },
    Active {
        receipt: String,
        lease_until: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct Entry {
    item: QueueItem,
    retry: RetryPolicy,
    /// Attempts used up by failures.
    failures: u32,
    stalled_count: u32,
    state: EntryState,
}

impl Entry {
    fn holds(&self, receipt: &str) -> bool {
        matches!(&self.state, EntryState::Active { receipt: r, .. } if r == receipt)
    }
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    entries: HashMap<ExecutionId, Entry>,
    /// Waiting entries in delivery order.
    order: VecDeque<ExecutionId>,
    dedup: HashMap<String, DateTime<Utc>>,
    failed: Vec<FailedItem>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            entries: HashMap::new(),
            order: VecDeque::new(),
            dedup: HashMap::new(),
            failed: Vec::new(),
        }
    }

    fn lease_next(&mut self, queue: &str, now: DateTime<Utc>) -> Option<Delivery> {
        let position = self.order.iter().position(|id| {
            matches!(
                self.entries.get(id).map(|e| &e.state),
                Some(EntryState::Waiting { available_at }) if *available_at <= now
            )
        })?;
        let id = self.order.remove(position)?;
        let entry = self.entries.get_mut(&id)?;

        let receipt = Uuid::now_v7().to_string();
        entry.state = EntryState::Active {
            receipt: receipt.clone(),
            lease_until: add_std(now, self.options.stalled_interval),
        };

        Some(Delivery {
            queue: queue.to_string(),
            receipt,
            item: entry.item.clone(),
            attempt: entry.failures + 1,
            stalled_count: entry.stalled_count,
            retry: entry.retry.clone(),
        })
    }

    fn held_entry(&mut self, delivery: &Delivery) -> Result<&mut Entry, QueueError> {
        match self.entries.get_mut(&delivery.item.id) {
            Some(entry) if entry.holds(&delivery.receipt) => Ok(entry),
            _ => Err(QueueError::LeaseLost(delivery.item.id)),
        }
    }
}

/// Single-process queue for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    clock: SharedClock,
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Items waiting for delivery (delayed ones included).
    pub fn waiting_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map_or(0, |state| state.order.len())
    }

    /// Items currently leased to a worker.
    pub fn active_len(&self, queue: &str) -> usize {
        self.queues.lock().unwrap().get(queue).map_or(0, |state| {
            state
                .entries
                .values()
                .filter(|e| matches!(e.state, EntryState::Active { .. }))
                .count()
        })
    }

    pub fn failed(&self, queue: &str) -> Vec<FailedItem> {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|state| state.failed.clone())
            .unwrap_or_default()
    }

    fn with_queue<T>(
        &self,
        queue: &str,
        f: impl FnOnce(&mut QueueState) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        f(state)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().unwrap();
        match queues.get_mut(name) {
            Some(state) => state.options = options,
            None => {
                queues.insert(name.to_string(), QueueState::new(options));
            }
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        queue: &str,
        mut item: QueueItem,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let now = self.clock.now();
        let outcome = self.with_queue(queue, |state| {
            if let Some(key) = &options.dedup_key {
                if state.dedup.get(key).is_some_and(|until| *until > now) {
                    return Ok(EnqueueOutcome::Duplicate {
                        dedup_key: key.clone(),
                    });
                }
                state
                    .dedup
                    .insert(key.clone(), add_std(now, state.options.dedup_window));
            }
            state.dedup.retain(|_, until| *until > now);

            item.dedup_key = options.dedup_key.clone();
            let id = item.id;
            let available_at = add_std(now, options.delay.unwrap_or_default());
            state.entries.insert(
                id,
                Entry {
                    item,
                    retry: options.retry.clone(),
                    failures: 0,
                    stalled_count: 0,
                    state: EntryState::Waiting { available_at },
                },
            );
            state.order.push_back(id);
            Ok(EnqueueOutcome::Enqueued(id))
        })?;

        if matches!(outcome, EnqueueOutcome::Enqueued(_)) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let now = self.clock.now();
            if let Some(delivery) = self.with_queue(queue, |state| Ok(state.lease_next(queue, now)))? {
                return Ok(Some(delivery));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Delayed items become due on the clock, not on a notification.
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining.min(POLL_SLICE)) => {}
            }
        }
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let now = self.clock.now();
        self.with_queue(&delivery.queue, |state| {
            let lease = add_std(now, state.options.stalled_interval);
            let entry = state.held_entry(delivery)?;
            entry.state = EntryState::Active {
                receipt: delivery.receipt.clone(),
                lease_until: lease,
            };
            Ok(())
        })
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.with_queue(&delivery.queue, |state| {
            if !state.entries.contains_key(&delivery.item.id) {
                return Ok(());
            }
            state.held_entry(delivery)?;
            state.entries.remove(&delivery.item.id);
            state.order.retain(|id| *id != delivery.item.id);
            Ok(())
        })
    }

    async fn postpone(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let now = self.clock.now();
        self.with_queue(&delivery.queue, |state| {
            let entry = state.held_entry(delivery)?;
            entry.state = EntryState::Waiting {
                available_at: add_std(now, delay),
            };
            state.order.push_back(delivery.item.id);
            Ok(())
        })?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, error: &str) -> Result<FailOutcome, QueueError> {
        let now = self.clock.now();
        let outcome = self.with_queue(&delivery.queue, |state| {
            let id = delivery.item.id;
            let entry = state.held_entry(delivery)?;
            entry.failures += 1;
            let attempts = entry.failures;

            if entry.retry.should_retry(attempts) {
                let delay = entry.retry.delay_for_attempt(attempts);
                entry.state = EntryState::Waiting {
                    available_at: add_std(now, delay),
                };
                state.order.push_back(id);
                return Ok(FailOutcome::Retrying {
                    attempt: attempts,
                    delay,
                });
            }

            if let Some(entry) = state.entries.remove(&id) {
                state.failed.push(FailedItem {
                    item: entry.item,
                    error: error.to_string(),
                    attempts,
                    failed_at: now,
                });
            }
            Ok(FailOutcome::Exhausted { attempts })
        })?;

        if matches!(outcome, FailOutcome::Retrying { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn reclaim_stalled(&self, queue: &str) -> Result<StallReport, QueueError> {
        let now = self.clock.now();
        let report = self.with_queue(queue, |state| {
            let mut report = StallReport::default();
            let stalled: Vec<ExecutionId> = state
                .entries
                .iter()
                .filter(|(_, e)| {
                    matches!(e.state, EntryState::Active { lease_until, .. } if lease_until <= now)
                })
                .map(|(id, _)| *id)
                .collect();

            for id in stalled {
                let Some(entry) = state.entries.get_mut(&id) else {
                    continue;
                };
                entry.stalled_count += 1;
                if entry.stalled_count > state.options.max_stalled_count {
                    if let Some(entry) = state.entries.remove(&id) {
                        report.exhausted.push(entry.item.clone());
                        state.failed.push(FailedItem {
                            item: entry.item,
                            error: STALL_LIMIT_ERROR.to_string(),
                            attempts: entry.failures + 1,
                            failed_at: now,
                        });
                    }
                } else {
                    entry.state = EntryState::Waiting { available_at: now };
                    report.redelivered.push(entry.item.clone());
                    state.order.push_front(id);
                }
            }
            Ok(report)
        })?;

        if !report.redelivered.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(report)
    }
}
