//! In-memory message queue.

use super::{Delivery, FailOutcome, MessageQueue, QueueCounts, Submission, SubmitOptions};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Where an entry currently sits in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

#[derive(Debug)]
enum EntryState {
    Waiting,
    Delayed { until: Instant },
    Active { lease_until: Instant },
    Completed,
    Failed,
}

#[derive(Debug)]
struct Entry {
    job: Job,
    options: SubmitOptions,
    state: EntryState,
    attempts_made: u32,
    token: u64,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<JobId, Entry>,
    waiting: VecDeque<JobId>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    next_token: u64,
    closed: bool,
}

/// In-memory queue (for testing and single-process deployments).
///
/// Bookkeeping is serialized behind one mutex, so each entry has at most one
/// lease holder at a time.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    /// Create a queue with a 30 second visibility timeout.
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            visibility_timeout,
        }
    }

    /// Current position of a retained entry.
    pub fn status_of(&self, job_id: &JobId) -> Option<EntryStatus> {
        let inner = self.inner.lock();
        inner.entries.get(job_id).map(|entry| match entry.state {
            EntryState::Waiting => EntryStatus::Waiting,
            EntryState::Delayed { .. } => EntryStatus::Delayed,
            EntryState::Active { .. } => EntryStatus::Active,
            EntryState::Completed => EntryStatus::Completed,
            EntryState::Failed => EntryStatus::Failed,
        })
    }

    /// Last failure message recorded for an entry.
    pub fn last_error(&self, job_id: &JobId) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(job_id)
            .and_then(|entry| entry.last_error.clone())
    }

    fn promote_delayed(inner: &mut Inner, now: Instant) {
        let mut due: Vec<(Instant, JobId)> = inner
            .entries
            .iter()
            .filter_map(|(id, entry)| match entry.state {
                EntryState::Delayed { until } if until <= now => Some((until, id.clone())),
                _ => None,
            })
            .collect();
        due.sort();

        for (_, id) in due {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.state = EntryState::Waiting;
                inner.waiting.push_back(id);
            }
        }
    }

    fn check_open(inner: &Inner) -> QueueResult<()> {
        if inner.closed {
            return Err(QueueError::Broker("queue is closed".to_string()));
        }
        Ok(())
    }

    /// Fetch the entry leased under `delivery`, rejecting stale tokens.
    fn leased<'a>(inner: &'a mut Inner, delivery: &Delivery) -> QueueResult<&'a mut Entry> {
        match inner.entries.get_mut(&delivery.job.id) {
            Some(entry)
                if entry.token == delivery.token
                    && matches!(entry.state, EntryState::Active { .. }) =>
            {
                Ok(entry)
            }
            _ => Err(QueueError::StaleDelivery(delivery.job.id.clone())),
        }
    }

    fn trim(inner: &mut Inner, failed: bool, keep: usize) {
        let list = if failed {
            &mut inner.failed
        } else {
            &mut inner.completed
        };
        while list.len() > keep {
            if let Some(id) = list.pop_front() {
                inner.entries.remove(&id);
            }
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn submit(&self, job: Job, options: &SubmitOptions) -> QueueResult<Submission> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;

        if inner.entries.contains_key(&job.id) {
            debug!(job_id = %job.id, "Duplicate submission ignored");
            return Ok(Submission::Duplicate);
        }

        let id = job.id.clone();
        inner.entries.insert(
            id.clone(),
            Entry {
                job,
                options: options.clone(),
                state: EntryState::Waiting,
                attempts_made: 0,
                token: 0,
                last_error: None,
            },
        );
        inner.waiting.push_back(id);
        Ok(Submission::Accepted)
    }

    async fn reserve(&self) -> QueueResult<Option<Delivery>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        Self::promote_delayed(&mut inner, now);

        while let Some(id) = inner.waiting.pop_front() {
            inner.next_token += 1;
            let token = inner.next_token;
            let lease_until = now + self.visibility_timeout;

            let Some(entry) = inner.entries.get_mut(&id) else {
                continue;
            };
            if !matches!(entry.state, EntryState::Waiting) {
                continue;
            }

            entry.state = EntryState::Active { lease_until };
            entry.token = token;

            let mut job = entry.job.clone();
            job.attempt_count = entry.attempts_made;
            return Ok(Some(Delivery {
                job,
                attempt: entry.attempts_made + 1,
                token,
            }));
        }

        Ok(None)
    }

    async fn acknowledge(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        let entry = Self::leased(&mut inner, delivery)?;
        entry.state = EntryState::Completed;
        let keep = entry.options.keep_completed;

        inner.completed.push_back(delivery.job.id.clone());
        Self::trim(&mut inner, false, keep);
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, error: &str) -> QueueResult<FailOutcome> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = Self::leased(&mut inner, delivery)?;

        entry.attempts_made += 1;
        entry.last_error = Some(error.to_string());

        if entry.attempts_made < entry.options.max_attempts {
            let delay = entry.options.backoff.delay(entry.attempts_made);
            entry.state = EntryState::Delayed { until: now + delay };
            return Ok(FailOutcome::Retrying { delay });
        }

        entry.state = EntryState::Failed;
        let keep = entry.options.keep_failed;
        inner.failed.push_back(delivery.job.id.clone());
        if let Some(keep) = keep {
            Self::trim(&mut inner, true, keep);
        }
        Ok(FailOutcome::Exhausted)
    }

    async fn recover_stalled(&self) -> QueueResult<usize> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let stalled: Vec<JobId> = inner
            .entries
            .iter()
            .filter_map(|(id, entry)| match entry.state {
                EntryState::Active { lease_until } if lease_until <= now => Some(id.clone()),
                _ => None,
            })
            .collect();

        for id in &stalled {
            if let Some(entry) = inner.entries.get_mut(id) {
                warn!(job_id = %id, "Job stalled, returning to queue");
                entry.state = EntryState::Waiting;
            }
            inner.waiting.push_back(id.clone());
        }

        Ok(stalled.len())
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let inner = self.inner.lock();
        let mut counts = QueueCounts::default();
        for entry in inner.entries.values() {
            match entry.state {
                EntryState::Waiting => counts.waiting += 1,
                EntryState::Delayed { .. } => counts.delayed += 1,
                EntryState::Active { .. } => counts.active += 1,
                EntryState::Completed => counts.completed += 1,
                EntryState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn close(&self) -> QueueResult<()> {
        self.inner.lock().closed = true;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
