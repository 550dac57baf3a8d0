//! Queue service: the gatekeeper between enqueue requests and the queue.
//!
//! Every request is validated, checked against the job log for an already
//! delivered job with the same id, rate limited per subject, submitted to the
//! message queue and finally recorded as `enqueued`. Reads of the job log
//! fail open and the final audit write is best-effort: the queue submission
//! alone guarantees the job will be processed.

use crate::broker::{MessageQueue, QueueCounts, Submission};
use crate::config::{RateLimitConfig, RetryPolicy, TidingsConfig};
use crate::error::{QueueError, QueueResult};
use crate::job::{
    CustomMessage, Job, JobId, JobLogRecord, JobStatus, JobType, NotificationPayload, Recipient,
    SignInDetails,
};
use crate::observer::{JobEvent, JobObserver, ObserverSet};
use crate::store::JobLogStore;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound for dead-letter listings.
pub const MAX_DEAD_LETTER_LIMIT: usize = 100;

fn unknown() -> String {
    "unknown".to_string()
}

/// Request to notify a user about a sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInRequest {
    pub subject_id: String,
    pub recipient_contact: String,
    pub display_name: String,
    #[serde(default = "unknown")]
    pub event_provider: String,
    #[serde(default = "unknown")]
    pub origin_address: String,
    #[serde(default = "unknown")]
    pub client_descriptor: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl SignInRequest {
    pub fn new(
        subject_id: impl Into<String>,
        recipient_contact: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            recipient_contact: recipient_contact.into(),
            display_name: display_name.into(),
            event_provider: unknown(),
            origin_address: unknown(),
            client_descriptor: unknown(),
            job_id: None,
            timestamp: None,
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.event_provider = provider.into();
        self
    }

    pub fn origin_address(mut self, address: impl Into<String>) -> Self {
        self.origin_address = address.into();
        self
    }

    pub fn client_descriptor(mut self, descriptor: impl Into<String>) -> Self {
        self.client_descriptor = descriptor.into();
        self
    }

    /// Use a caller-supplied job id instead of deriving one.
    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }
}

/// Request to send an operator-authored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomRequest {
    pub subject_id: String,
    pub recipient_contact: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl CustomRequest {
    pub fn new(
        subject_id: impl Into<String>,
        recipient_contact: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            recipient_contact: recipient_contact.into(),
            display_name: None,
            subject: subject.into(),
            body: body.into(),
            job_id: None,
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Anything the queue service accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueRequest {
    SignIn(SignInRequest),
    Custom(CustomRequest),
}

impl From<SignInRequest> for EnqueueRequest {
    fn from(request: SignInRequest) -> Self {
        EnqueueRequest::SignIn(request)
    }
}

impl From<CustomRequest> for EnqueueRequest {
    fn from(request: CustomRequest) -> Self {
        EnqueueRequest::Custom(request)
    }
}

impl EnqueueRequest {
    pub fn subject_id(&self) -> &str {
        match self {
            EnqueueRequest::SignIn(r) => &r.subject_id,
            EnqueueRequest::Custom(r) => &r.subject_id,
        }
    }

    /// Validate the request and build the job it describes.
    pub fn into_job(self, now: DateTime<Utc>, max_attempts: u32) -> QueueResult<Job> {
        let job_type = JobType::SignInNotification;
        require("subjectId", self.subject_id())?;

        let (job_id, subject_id, payload) = match self {
            EnqueueRequest::SignIn(r) => {
                validate_contact(&r.recipient_contact)?;
                let payload = NotificationPayload::Structured(SignInDetails {
                    recipient: Recipient::new(r.recipient_contact, r.display_name),
                    provider: r.event_provider,
                    origin_address: r.origin_address,
                    client_descriptor: r.client_descriptor,
                    occurred_at: r.timestamp.unwrap_or(now),
                });
                (r.job_id, r.subject_id, payload)
            }
            EnqueueRequest::Custom(r) => {
                validate_contact(&r.recipient_contact)?;
                require("subject", &r.subject)?;
                require("body", &r.body)?;
                let name = r
                    .display_name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| r.recipient_contact.clone());
                let payload = NotificationPayload::Custom(CustomMessage {
                    recipient: Recipient::new(r.recipient_contact, name),
                    subject: r.subject,
                    body: r.body,
                });
                (r.job_id, r.subject_id, payload)
            }
        };

        let id = match job_id {
            Some(id) => {
                let id = JobId::from(id);
                if id.is_empty() {
                    return Err(QueueError::Validation("jobId must not be empty".into()));
                }
                id
            }
            None => JobId::derive(job_type, &subject_id, now),
        };

        Ok(Job::new(id, job_type, subject_id, payload)
            .with_max_attempts(max_attempts)
            .with_created_at(now))
    }
}

fn require(field: &str, value: &str) -> QueueResult<()> {
    if value.trim().is_empty() {
        return Err(QueueError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

fn validate_contact(contact: &str) -> QueueResult<()> {
    require("recipientContact", contact)?;
    if !is_valid_email(contact) {
        return Err(QueueError::Validation(format!(
            "recipientContact is not a valid email address: {}",
            contact
        )));
    }
    Ok(())
}

/// `local@domain`, one `@`, both sides non-empty, no whitespace.
pub fn is_valid_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

/// Outcome of an accepted enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
    /// The queue already held a job with this id; nothing new was admitted
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

/// Admits jobs into the message queue.
pub struct QueueService {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn JobLogStore>,
    retry: RetryPolicy,
    rate_limit: RateLimitConfig,
    observers: ObserverSet,
}

impl QueueService {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn JobLogStore>,
        config: &TidingsConfig,
    ) -> Self {
        Self {
            queue,
            store,
            retry: config.retry.clone(),
            rate_limit: config.rate_limit.clone(),
            observers: ObserverSet::default(),
        }
    }

    /// Register an observer for `enqueued` transitions.
    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validate, deduplicate, rate limit and submit a job.
    pub async fn enqueue(&self, request: impl Into<EnqueueRequest>) -> QueueResult<EnqueueReceipt> {
        let now = Utc::now();
        let job = request.into().into_job(now, self.retry.max_attempts)?;

        if self.is_processed(&job.id).await {
            debug!(job_id = %job.id, "Job already processed, rejecting");
            return Err(QueueError::AlreadyProcessed(job.id));
        }

        let recent = self.count_recent(&job, now).await;
        if recent >= self.rate_limit.max_jobs {
            warn!(
                subject_id = %job.subject_id,
                recent,
                limit = self.rate_limit.max_jobs,
                "Rate limit exceeded"
            );
            return Err(QueueError::RateLimitExceeded {
                subject_id: job.subject_id,
                limit: self.rate_limit.max_jobs,
                window: self.rate_limit.window(),
            });
        }

        let submission = self
            .queue
            .submit(job.clone(), &self.retry.submit_options())
            .await
            .map_err(|e| match e {
                QueueError::Broker(_) => e,
                other => QueueError::Broker(other.to_string()),
            })?;

        if submission == Submission::Duplicate {
            let status = match self.store.find(&job.id).await {
                Ok(Some(record)) => record.status,
                _ => JobStatus::Enqueued,
            };
            info!(job_id = %job.id, status = %status, "Job already queued");
            return Ok(EnqueueReceipt {
                job_id: job.id,
                status,
                duplicate: true,
            });
        }

        if let Err(e) = self.store.insert(JobLogRecord::enqueued(&job)).await {
            warn!(
                job_id = %job.id,
                error = %e,
                "Job queued but audit record could not be written"
            );
        }

        self.observers
            .emit(JobEvent::new(&job, JobStatus::Enqueued, 0));
        info!(
            job_id = %job.id,
            subject_id = %job.subject_id,
            job_type = %job.job_type,
            "Job enqueued"
        );

        Ok(EnqueueReceipt {
            job_id: job.id,
            status: JobStatus::Enqueued,
            duplicate: false,
        })
    }

    /// Enqueue on behalf of an action that must never fail because of it.
    pub async fn enqueue_quietly(
        &self,
        request: impl Into<EnqueueRequest>,
    ) -> Option<EnqueueReceipt> {
        let request = request.into();
        let subject_id = request.subject_id().to_string();

        match self.enqueue(request).await {
            Ok(receipt) => Some(receipt),
            Err(QueueError::AlreadyProcessed(job_id)) => {
                debug!(job_id = %job_id, "Notification already delivered");
                None
            }
            Err(e) => {
                warn!(subject_id = %subject_id, error = %e, "Failed to enqueue notification");
                None
            }
        }
    }

    /// Look up the audit record for a job.
    pub async fn get_status(&self, job_id: &JobId) -> QueueResult<JobLogRecord> {
        self.store
            .find(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))
    }

    /// Most recent dead-lettered jobs, newest first.
    pub async fn list_dead_lettered(&self, limit: usize) -> QueueResult<Vec<JobLogRecord>> {
        let limit = limit.clamp(1, MAX_DEAD_LETTER_LIMIT);
        Ok(self.store.list_by_status(JobStatus::Dlq, limit).await?)
    }

    /// Current queue statistics.
    pub async fn queue_counts(&self) -> QueueResult<QueueCounts> {
        self.queue.counts().await
    }

    async fn is_processed(&self, job_id: &JobId) -> bool {
        match self.store.find(job_id).await {
            Ok(record) => record.is_some_and(|r| r.status == JobStatus::Completed),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Idempotency check failed, assuming not processed");
                false
            }
        }
    }

    async fn count_recent(&self, job: &Job, now: DateTime<Utc>) -> u64 {
        let since = TimeDelta::from_std(self.rate_limit.window())
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        match self
            .store
            .count_since(&job.subject_id, job.job_type, since)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(subject_id = %job.subject_id, error = %e, "Rate limit check failed, allowing");
                0
            }
        }
    }
}
