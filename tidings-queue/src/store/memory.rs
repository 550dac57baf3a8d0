//! In-memory job log store.

use super::JobLogStore;
use crate::error::{StoreError, StoreResult};
use crate::job::{JobId, JobLogRecord, JobStatus, JobType, StatusUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

struct Stored {
    // Insertion order, breaks ties between identical creation times
    seq: u64,
    record: JobLogRecord,
}

#[derive(Default)]
struct Inner {
    records: HashMap<JobId, Stored>,
    next_seq: u64,
}

/// Job log kept in process memory.
///
/// Suitable for tests and single-process deployments; records are lost on
/// restart.
#[derive(Default)]
pub struct MemoryJobLogStore {
    inner: RwLock<Inner>,
}

impl MemoryJobLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobLogStore for MemoryJobLogStore {
    async fn find(&self, job_id: &JobId) -> StoreResult<Option<JobLogRecord>> {
        Ok(self
            .inner
            .read()
            .records
            .get(job_id)
            .map(|stored| stored.record.clone()))
    }

    async fn insert(&self, record: JobLogRecord) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner
            .records
            .insert(record.job_id.clone(), Stored { seq, record });
        Ok(())
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> StoreResult<JobLogRecord> {
        let mut inner = self.inner.write();
        let stored = inner
            .records
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;

        stored.record.apply(update)?;
        Ok(stored.record.clone())
    }

    async fn count_since(
        &self,
        subject_id: &str,
        job_type: JobType,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let inner = self.inner.read();
        let count = inner
            .records
            .values()
            .filter(|stored| {
                let record = &stored.record;
                record.subject_id == subject_id
                    && record.job_type == job_type
                    && record.created_at >= since
            })
            .count();
        Ok(count as u64)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> StoreResult<Vec<JobLogRecord>> {
        let inner = self.inner.read();
        let mut matching: Vec<&Stored> = inner
            .records
            .values()
            .filter(|stored| stored.record.status == status)
            .collect();

        matching.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then(b.seq.cmp(&a.seq))
        });

        Ok(matching
            .into_iter()
            .take(limit)
            .map(|stored| stored.record.clone())
            .collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
