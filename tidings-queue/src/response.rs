//! JSON shapes returned to the API layer.

use crate::error::QueueError;
use crate::job::{JobId, JobLogRecord, JobStatus, JobType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status lookup response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub error: Option<String>,
}

impl From<&JobLogRecord> for JobStatusView {
    fn from(record: &JobLogRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            job_type: record.job_type,
            status: record.status,
            created_at: record.created_at,
            processed_at: record.processed_at,
            attempt_count: record.attempt_count,
            error: record.error.clone(),
        }
    }
}

impl From<JobLogRecord> for JobStatusView {
    fn from(record: JobLogRecord) -> Self {
        Self::from(&record)
    }
}

/// Error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl ErrorBody {
    /// Build the body for an error; internal failures are not described.
    pub fn from_error(err: &QueueError) -> Self {
        let error = if err.status_code() == 500 {
            "Internal server error".to_string()
        } else {
            err.to_string()
        };
        Self {
            error,
            code: err.code().to_string(),
        }
    }
}

impl From<&QueueError> for ErrorBody {
    fn from(err: &QueueError) -> Self {
        Self::from_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, NotificationPayload, Recipient, CustomMessage};

    #[test]
    fn test_status_view_shape() {
        let job = Job::new(
            JobId::from("j1"),
            JobType::SignInNotification,
            "u1",
            NotificationPayload::Custom(CustomMessage {
                recipient: Recipient::new("a@b.c", "A"),
                subject: "s".into(),
                body: "b".into(),
            }),
        );
        let view = JobStatusView::from(JobLogRecord::enqueued(&job));
        let json = serde_json::to_value(&view).unwrap();

        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["type"], "user.signin.notification");
        assert_eq!(json["status"], "enqueued");
        assert_eq!(json["attemptCount"], 0);
        assert!(json["processedAt"].is_null());
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_error_body_hides_internal_details() {
        let body = ErrorBody::from(&QueueError::Broker("redis at 10.0.0.5 refused".into()));
        assert_eq!(body.error, "Internal server error");
        assert_eq!(body.code, "internal_error");

        let body = ErrorBody::from(&QueueError::NotFound(JobId::from("j1")));
        assert_eq!(body.error, "Job not found: j1");
        assert_eq!(body.code, "not_found");
    }
}
