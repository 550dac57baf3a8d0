//! Message queue contract and backends.
//!
//! - **Memory**: single-process queue guarded by a mutex (tests, development)
//! - **Redis**: durable queue for multi-instance deployments

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryQueue;
#[cfg(feature = "redis")]
pub use redis::RedisQueue;

use crate::error::QueueResult;
use crate::job::Job;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between redeliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay after the first failed attempt
    pub base: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before redelivering a job whose `failed_attempts`-th attempt just
    /// failed: `base * 2^(failed_attempts - 1)`, capped at `max`.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Options attached to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Attempt limit
    pub max_attempts: u32,
    /// Backoff between attempts
    pub backoff: Backoff,
    /// How many completed jobs to retain
    pub keep_completed: usize,
    /// How many failed jobs to retain (`None` = all)
    pub keep_failed: Option<usize>,
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A new entry was admitted
    Accepted,
    /// An entry with the same unique key already exists; nothing was added
    Duplicate,
}

/// A job handed to exactly one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    /// 1-based attempt number, as tracked by the queue
    pub attempt: u32,
    /// Lease token; only the current holder may settle the delivery
    pub token: u64,
}

/// What the queue did with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for redelivery after `delay`
    Retrying { delay: Duration },
    /// Attempts exhausted; the entry is retained as failed
    Exhausted,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Ready to be reserved
    pub waiting: u64,
    /// Waiting for a backoff delay to elapse
    pub delayed: u64,
    /// Leased by a consumer
    pub active: u64,
    /// Retained completed entries
    pub completed: u64,
    /// Retained failed entries
    pub failed: u64,
}

/// Durable at-least-once queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Submit a job keyed by its id.
    async fn submit(&self, job: Job, options: &SubmitOptions) -> QueueResult<Submission>;

    /// Lease the next ready job, if any.
    async fn reserve(&self) -> QueueResult<Option<Delivery>>;

    /// Mark a delivery as done; it is never redelivered.
    async fn acknowledge(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Record a failed attempt and apply the backoff policy.
    async fn fail(&self, delivery: &Delivery, error: &str) -> QueueResult<FailOutcome>;

    /// Return deliveries whose lease expired to the waiting state.
    async fn recover_stalled(&self) -> QueueResult<usize>;

    /// Get queue statistics.
    async fn counts(&self) -> QueueResult<QueueCounts>;

    /// Release resources; further calls may fail.
    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }

    /// Backend name for logging.
    fn backend(&self) -> &'static str;
}
