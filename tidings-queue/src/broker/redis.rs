//! Redis-backed message queue.
//!
//! Every lease transition runs as a single Lua script, so a delivery is
//! settled, recovered or handed out again atomically.

use super::{Delivery, FailOutcome, MessageQueue, QueueCounts, Submission, SubmitOptions};
use crate::config::TidingsConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId};
use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Client, Script, ScriptInvocation, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key suffixes passed to every script, in `KEYS[1..]` order.
const SCRIPT_KEYS: [&str; 7] = [
    "wait", "delayed", "active", "completed", "failed", "leases", "states",
];

// KEYS: see SCRIPT_KEYS. ARGV: id, entry json, job key.
const SUBMIT: &str = r#"
if redis.call('SET', ARGV[3], ARGV[2], 'NX') then
    redis.call('HSET', KEYS[7], ARGV[1], 'waiting')
    redis.call('RPUSH', KEYS[1], ARGV[1])
    return 1
end
return 0
"#;

// ARGV: now ms, lease deadline ms, job key prefix.
const RESERVE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('HSET', KEYS[7], id, 'waiting')
    redis.call('RPUSH', KEYS[1], id)
end
while true do
    local id = redis.call('LPOP', KEYS[1])
    if not id then
        return false
    end
    local entry = redis.call('GET', ARGV[3] .. id)
    if entry and redis.call('HGET', KEYS[7], id) == 'waiting' then
        local token = redis.call('HINCRBY', KEYS[6], id, 1)
        redis.call('ZADD', KEYS[3], ARGV[2], id)
        redis.call('HSET', KEYS[7], id, 'active')
        return {entry, token}
    end
end
"#;

// ARGV: id, token, keep completed, job key prefix.
const ACKNOWLEDGE: &str = r#"
if redis.call('HGET', KEYS[7], ARGV[1]) ~= 'active'
    or redis.call('HGET', KEYS[6], ARGV[1]) ~= ARGV[2] then
    return -1
end
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('HSET', KEYS[7], ARGV[1], 'completed')
redis.call('LPUSH', KEYS[4], ARGV[1])
local keep = tonumber(ARGV[3])
local evicted = redis.call('LRANGE', KEYS[4], keep, -1)
if keep == 0 then
    redis.call('DEL', KEYS[4])
else
    redis.call('LTRIM', KEYS[4], 0, keep - 1)
end
for _, id in ipairs(evicted) do
    redis.call('DEL', ARGV[4] .. id)
    redis.call('HDEL', KEYS[6], id)
    redis.call('HDEL', KEYS[7], id)
end
return #evicted
"#;

// ARGV: id, token, entry json, 'retry' | 'exhausted', score, keep failed
// (negative keeps all), job key prefix.
const FAIL: &str = r#"
if redis.call('HGET', KEYS[7], ARGV[1]) ~= 'active'
    or redis.call('HGET', KEYS[6], ARGV[1]) ~= ARGV[2] then
    return -1
end
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('SET', ARGV[7] .. ARGV[1], ARGV[3])
if ARGV[4] == 'retry' then
    redis.call('ZADD', KEYS[2], ARGV[5], ARGV[1])
    redis.call('HSET', KEYS[7], ARGV[1], 'delayed')
    return 0
end
redis.call('ZADD', KEYS[5], ARGV[5], ARGV[1])
redis.call('HSET', KEYS[7], ARGV[1], 'failed')
local keep = tonumber(ARGV[6])
if keep >= 0 then
    local size = redis.call('ZCARD', KEYS[5])
    if size > keep then
        local popped = redis.call('ZPOPMIN', KEYS[5], size - keep)
        for i = 1, #popped, 2 do
            redis.call('DEL', ARGV[7] .. popped[i])
            redis.call('HDEL', KEYS[6], popped[i])
            redis.call('HDEL', KEYS[7], popped[i])
        end
    end
end
return 0
"#;

// ARGV: now ms.
const RECOVER: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[3], id)
    redis.call('HSET', KEYS[7], id, 'waiting')
    redis.call('RPUSH', KEYS[1], id)
end
return #ids
"#;

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    job: Job,
    options: SubmitOptions,
    attempts_made: u32,
    last_error: Option<String>,
}

/// Message queue backed by Redis.
///
/// Keys live under `{prefix}:queue:{name}`: `job:{id}` holds the entry,
/// `wait` is a list, `delayed`/`active`/`failed` are sorted sets scored by
/// ready time, lease deadline and failure time, `completed` is a capped list.
/// The `leases` hash holds each entry's current lease token and `states`
/// its position (`waiting`, `active`, `delayed`, `completed`, `failed`);
/// only `waiting` entries are ever leased.
#[derive(Clone)]
pub struct RedisQueue {
    connection: ConnectionManager,
    prefix: String,
    visibility_timeout: Duration,
}

impl RedisQueue {
    /// Connect using the queue settings from the configuration.
    pub async fn connect(config: &TidingsConfig) -> QueueResult<Self> {
        Self::new(
            &config.redis_url,
            &config.key_prefix,
            &config.queue_name,
            config.worker.visibility_timeout(),
        )
        .await
    }

    pub async fn new(
        redis_url: &str,
        key_prefix: &str,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> QueueResult<Self> {
        info!(queue = %queue_name, "Initializing Redis message queue");

        let client = Client::open(redis_url).map_err(|e| QueueError::Broker(e.to_string()))?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            prefix: format!("{}:queue:{}", key_prefix, queue_name),
            visibility_timeout,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn job_key_prefix(&self) -> String {
        self.key("job:")
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}{}", self.job_key_prefix(), id)
    }

    /// Prepare `script` with the queue keys bound.
    fn invocation<'a>(&self, script: &'a Script) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for suffix in SCRIPT_KEYS {
            invocation.key(self.key(suffix));
        }
        invocation
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn submit(&self, job: Job, options: &SubmitOptions) -> QueueResult<Submission> {
        let mut conn = self.connection.clone();
        let id = job.id.to_string();

        let entry = StoredEntry {
            job,
            options: options.clone(),
            attempts_made: 0,
            last_error: None,
        };
        let json = serde_json::to_string(&entry)?;

        let script = Script::new(SUBMIT);
        let created: i64 = self
            .invocation(&script)
            .arg(&id)
            .arg(json)
            .arg(self.job_key(&id))
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            debug!(job_id = %id, "Duplicate submission ignored");
            return Ok(Submission::Duplicate);
        }
        Ok(Submission::Accepted)
    }

    async fn reserve(&self) -> QueueResult<Option<Delivery>> {
        let mut conn = self.connection.clone();
        let now_ms = Utc::now().timestamp_millis();
        let lease_until = now_ms + self.visibility_timeout.as_millis() as i64;

        let script = Script::new(RESERVE);
        let leased: Option<(String, u64)> = self
            .invocation(&script)
            .arg(now_ms)
            .arg(lease_until)
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await?;

        let Some((json, token)) = leased else {
            return Ok(None);
        };
        let entry: StoredEntry = serde_json::from_str(&json)?;

        let mut job = entry.job;
        job.attempt_count = entry.attempts_made;
        Ok(Some(Delivery {
            job,
            attempt: entry.attempts_made + 1,
            token,
        }))
    }

    async fn acknowledge(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let keep = load_options(&mut conn, &self.job_key(delivery.job.id.as_str()))
            .await?
            .map(|options| options.keep_completed)
            .ok_or_else(|| QueueError::StaleDelivery(delivery.job.id.clone()))?;

        let script = Script::new(ACKNOWLEDGE);
        let evicted: i64 = self
            .invocation(&script)
            .arg(delivery.job.id.as_str())
            .arg(delivery.token)
            .arg(keep)
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await?;

        if evicted < 0 {
            return Err(QueueError::StaleDelivery(delivery.job.id.clone()));
        }
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, error: &str) -> QueueResult<FailOutcome> {
        let mut conn = self.connection.clone();
        let id = delivery.job.id.as_str();
        let now_ms = Utc::now().timestamp_millis();

        let json: Option<String> = conn.get(self.job_key(id)).await?;
        let Some(json) = json else {
            return Err(QueueError::StaleDelivery(delivery.job.id.clone()));
        };
        let mut entry: StoredEntry = serde_json::from_str(&json)?;

        // Only the lease holder may write the entry; the script re-checks the
        // token before anything is stored.
        entry.attempts_made += 1;
        entry.last_error = Some(error.to_string());

        let (outcome, kind, score) = if entry.attempts_made < entry.options.max_attempts {
            let delay = entry.options.backoff.delay(entry.attempts_made);
            let ready_at = now_ms + delay.as_millis() as i64;
            (FailOutcome::Retrying { delay }, "retry", ready_at)
        } else {
            (FailOutcome::Exhausted, "exhausted", now_ms)
        };
        let keep_failed = entry
            .options
            .keep_failed
            .map(|keep| keep as i64)
            .unwrap_or(-1);

        let script = Script::new(FAIL);
        let status: i64 = self
            .invocation(&script)
            .arg(id)
            .arg(delivery.token)
            .arg(serde_json::to_string(&entry)?)
            .arg(kind)
            .arg(score)
            .arg(keep_failed)
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await?;

        if status < 0 {
            return Err(QueueError::StaleDelivery(delivery.job.id.clone()));
        }
        Ok(outcome)
    }

    async fn recover_stalled(&self) -> QueueResult<usize> {
        let mut conn = self.connection.clone();
        let now_ms = Utc::now().timestamp_millis();

        let script = Script::new(RECOVER);
        let recovered: usize = self
            .invocation(&script)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        if recovered > 0 {
            warn!(count = recovered, "Stalled jobs returned to queue");
        }
        Ok(recovered)
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let mut conn = self.connection.clone();
        Ok(QueueCounts {
            waiting: conn.llen(self.key("wait")).await?,
            delayed: conn.zcard(self.key("delayed")).await?,
            active: conn.zcard(self.key("active")).await?,
            completed: conn.llen(self.key("completed")).await?,
            failed: conn.zcard(self.key("failed")).await?,
        })
    }

    async fn close(&self) -> QueueResult<()> {
        info!(prefix = %self.prefix, "Redis message queue closed");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

async fn load_options(conn: &mut ConnectionManager, job_key: &str) -> QueueResult<Option<SubmitOptions>> {
    let json: Option<String> = conn.get(job_key).await?;
    match json {
        Some(json) => Ok(Some(serde_json::from_str::<StoredEntry>(&json)?.options)),
        None => Ok(None),
    }
}

impl RedisQueue {
    /// Delete every key belonging to this queue.
    pub async fn clear(&self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}:*", self.prefix);
        let keys: Vec<String> = conn.keys(&pattern).await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }

    /// Whether an entry exists for this job id.
    pub async fn contains(&self, job_id: &JobId) -> QueueResult<bool> {
        let mut conn = self.connection.clone();
        Ok(conn.exists(self.job_key(job_id.as_str())).await?)
    }
}
