//! Redis-backed job log store.

use super::JobLogStore;
use crate::config::TidingsConfig;
use crate::error::{StoreError, StoreResult};
use crate::job::{JobId, JobLogRecord, JobStatus, JobType, StatusUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use tracing::info;

/// Job log persisted in Redis.
///
/// Layout under `{prefix}:joblog`:
/// - `record:{id}`: the record as JSON
/// - `subject:{type}:{subject}`: sorted set of job ids scored by creation millis
/// - `status:{status}`: sorted set of job ids scored by creation millis
#[derive(Clone)]
pub struct RedisJobLogStore {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisJobLogStore {
    /// Connect using the configured Redis URL and key prefix.
    pub async fn connect(config: &TidingsConfig) -> StoreResult<Self> {
        Self::new(&config.redis_url, &config.key_prefix).await
    }

    pub async fn new(redis_url: &str, key_prefix: &str) -> StoreResult<Self> {
        info!("Initializing Redis job log store");

        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            prefix: format!("{}:joblog", key_prefix),
        })
    }

    fn record_key(&self, job_id: &str) -> String {
        format!("{}:record:{}", self.prefix, job_id)
    }

    fn subject_key(&self, job_type: JobType, subject_id: &str) -> String {
        format!("{}:subject:{}:{}", self.prefix, job_type, subject_id)
    }

    fn status_key(&self, status: JobStatus) -> String {
        format!("{}:status:{}", self.prefix, status)
    }

    async fn load(
        &self,
        conn: &mut ConnectionManager,
        job_id: &str,
    ) -> StoreResult<Option<JobLogRecord>> {
        let json: Option<String> = conn.get(self.record_key(job_id)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, conn: &mut ConnectionManager, record: &JobLogRecord) -> StoreResult<()> {
        let json = serde_json::to_string(record)?;
        let _: () = conn.set(self.record_key(record.job_id.as_str()), json).await?;
        Ok(())
    }

    /// Delete every key belonging to this store.
    pub async fn clear(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(format!("{}:*", self.prefix)).await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobLogStore for RedisJobLogStore {
    async fn find(&self, job_id: &JobId) -> StoreResult<Option<JobLogRecord>> {
        let mut conn = self.connection.clone();
        self.load(&mut conn, job_id.as_str()).await
    }

    async fn insert(&self, record: JobLogRecord) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let id = record.job_id.as_str();
        let score = record.created_at.timestamp_millis();

        // Upsert: drop the previous status index entry first
        if let Some(previous) = self.load(&mut conn, id).await? {
            let _: () = conn.zrem(self.status_key(previous.status), id).await?;
        }

        self.save(&mut conn, &record).await?;
        let _: () = conn
            .zadd(self.subject_key(record.job_type, &record.subject_id), id, score)
            .await?;
        let _: () = conn.zadd(self.status_key(record.status), id, score).await?;
        Ok(())
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> StoreResult<JobLogRecord> {
        let mut conn = self.connection.clone();
        let id = job_id.as_str();
        let mut record = self
            .load(&mut conn, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;

        let previous = record.status;
        record.apply(update)?;
        self.save(&mut conn, &record).await?;

        if previous != record.status {
            let score = record.created_at.timestamp_millis();
            let _: () = conn.zrem(self.status_key(previous), id).await?;
            let _: () = conn.zadd(self.status_key(record.status), id, score).await?;
        }
        Ok(record)
    }

    async fn count_since(
        &self,
        subject_id: &str,
        job_type: JobType,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        let count: u64 = conn
            .zcount(
                self.subject_key(job_type, subject_id),
                since.timestamp_millis(),
                "+inf",
            )
            .await?;
        Ok(count)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> StoreResult<Vec<JobLogRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrevrange(self.status_key(status), 0, limit as isize - 1)
            .await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(&mut conn, &id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
