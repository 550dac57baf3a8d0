//! Job definition, payload variants and the job log state machine.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Job unique identifier.
///
/// Used both as the queue-level unique key and the job log primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derive an id as `{prefix}-{subject}-{millis}-{random}`.
    pub fn derive(job_type: JobType, subject_id: &str, at: DateTime<Utc>) -> Self {
        let random = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}-{}-{}",
            job_type.id_prefix(),
            subject_id,
            at.timestamp_millis(),
            &random[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kinds of jobs handled by the queue. The wire name doubles as the queue name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JobType {
    /// Notify a user that their account was signed into.
    #[default]
    #[serde(rename = "user.signin.notification")]
    SignInNotification,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::SignInNotification => "user.signin.notification",
        }
    }

    /// Prefix used when deriving job ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            JobType::SignInNotification => "signin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user.signin.notification" => Some(JobType::SignInNotification),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status tracked in the job log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted into the queue, not yet picked up
    Enqueued,
    /// A delivery attempt is in flight
    Processing,
    /// Delivered
    Completed,
    /// Last attempt failed, a redelivery is scheduled
    Failed,
    /// Attempts exhausted, kept for manual inspection
    Dlq,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Enqueued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Dlq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Enqueued => "enqueued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dlq => "dlq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dlq)
    }

    /// Whether entering this status stamps `processed_at`.
    pub fn stamps_processed_at(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dlq
        )
    }

    /// Forward-only state machine. `failed -> processing` is the retry edge,
    /// `processing -> processing` covers a stalled attempt being redelivered,
    /// and outcomes may skip a lost `processing` write. `completed` and `dlq`
    /// are final.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Enqueued | Failed => matches!(next, Processing | Completed | Failed | Dlq),
            Processing => true,
            Completed | Dlq => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the notification goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub name: String,
}

impl Recipient {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
        }
    }
}

/// Attributes of the sign-in event that triggered the notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInDetails {
    pub recipient: Recipient,
    pub provider: String,
    pub origin_address: String,
    pub client_descriptor: String,
    pub occurred_at: DateTime<Utc>,
}

/// Operator-authored message delivered verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomMessage {
    pub recipient: Recipient,
    pub subject: String,
    pub body: String,
}

/// Job payload, decided once at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationPayload {
    /// Content synthesized from event fields
    Structured(SignInDetails),
    /// Subject and body supplied by the caller
    Custom(CustomMessage),
}

impl NotificationPayload {
    pub fn recipient(&self) -> &Recipient {
        match self {
            NotificationPayload::Structured(details) => &details.recipient,
            NotificationPayload::Custom(message) => &message.recipient,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, NotificationPayload::Custom(_))
    }
}

/// A job to be processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Job type, also the queue name
    pub job_type: JobType,

    /// Entity the job concerns (the user who signed in)
    pub subject_id: String,

    /// Notification payload
    pub payload: NotificationPayload,

    /// Delivery attempts started so far
    pub attempt_count: u32,

    /// Maximum number of delivery attempts
    pub max_attempts: u32,

    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job.
    pub fn new(
        id: JobId,
        job_type: JobType,
        subject_id: impl Into<String>,
        payload: NotificationPayload,
    ) -> Self {
        Self {
            id,
            job_type,
            subject_id: subject_id.into(),
            payload,
            attempt_count: 0,
            max_attempts: 5,
            created_at: Utc::now(),
        }
    }

    /// Set max attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether a failure on `attempt` is the final one.
    pub fn is_final_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Durable audit record, one per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLogRecord {
    pub job_id: JobId,
    pub job_type: JobType,
    pub subject_id: String,
    pub status: JobStatus,
    pub payload: NotificationPayload,
    /// Failed delivery attempts
    pub attempt_count: u32,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl JobLogRecord {
    /// Record written when a job is admitted.
    pub fn enqueued(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            subject_id: job.subject_id.clone(),
            status: JobStatus::Enqueued,
            payload: job.payload.clone(),
            attempt_count: 0,
            error: None,
            stack_trace: None,
            created_at: job.created_at,
            processed_at: None,
        }
    }

    /// Apply a status update, enforcing the state machine.
    pub fn apply(&mut self, update: &StatusUpdate) -> StoreResult<()> {
        if !self.status.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: update.status,
            });
        }

        self.status = update.status;
        if let Some(attempts) = update.attempt_count {
            self.attempt_count = attempts;
        }
        match update.status {
            JobStatus::Failed | JobStatus::Dlq => {
                self.error = update.error.clone();
                self.stack_trace = update.stack_trace.clone();
            }
            JobStatus::Completed => {
                self.error = None;
                self.stack_trace = None;
            }
            _ => {}
        }
        if update.status.stamps_processed_at() {
            self.processed_at = Some(update.at);
        }
        Ok(())
    }
}

/// A single status transition written by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub attempt_count: Option<u32>,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    fn new(status: JobStatus) -> Self {
        Self {
            status,
            attempt_count: None,
            error: None,
            stack_trace: None,
            at: Utc::now(),
        }
    }

    /// Attempt `attempt` has started; `attempt - 1` attempts failed before it.
    pub fn processing(attempt: u32) -> Self {
        Self {
            attempt_count: Some(attempt.saturating_sub(1)),
            ..Self::new(JobStatus::Processing)
        }
    }

    pub fn completed() -> Self {
        Self::new(JobStatus::Completed)
    }

    pub fn failed(attempt: u32, error: impl Into<String>) -> Self {
        Self {
            attempt_count: Some(attempt),
            error: Some(error.into()),
            ..Self::new(JobStatus::Failed)
        }
    }

    pub fn dead_lettered(attempt: u32, error: impl Into<String>, stack_trace: String) -> Self {
        Self {
            attempt_count: Some(attempt),
            error: Some(error.into()),
            stack_trace: Some(stack_trace),
            ..Self::new(JobStatus::Dlq)
        }
    }
}
