//! Job log store contract and backends.
//!
//! The job log is the durable audit trail: one record per job, keyed by job
//! id, moved through the status state machine by the queue service and the
//! worker. Every backend enforces the transitions allowed by
//! [`JobStatus::can_transition_to`].

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryJobLogStore;
#[cfg(feature = "redis")]
pub use redis::RedisJobLogStore;

use crate::error::StoreResult;
use crate::job::{JobId, JobLogRecord, JobStatus, JobType, StatusUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable record store keyed by job id.
#[async_trait]
pub trait JobLogStore: Send + Sync {
    /// Look up a record.
    async fn find(&self, job_id: &JobId) -> StoreResult<Option<JobLogRecord>>;

    /// Write a record, replacing any record with the same job id.
    async fn insert(&self, record: JobLogRecord) -> StoreResult<()>;

    /// Apply a status transition and return the updated record.
    ///
    /// Fails with `StoreError::NotFound` when no record exists and with
    /// `StoreError::InvalidTransition` when the state machine forbids the move.
    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> StoreResult<JobLogRecord>;

    /// Count records for a subject and job type created at or after `since`.
    async fn count_since(
        &self,
        subject_id: &str,
        job_type: JobType,
        since: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Records in `status`, newest first by creation time.
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> StoreResult<Vec<JobLogRecord>>;

    /// Backend name for logging.
    fn backend(&self) -> &'static str;
}
