//! Job lifecycle observers.
//!
//! The queue service and the worker emit a [`JobEvent`] at every status
//! transition. Observers are registered explicitly and called inline, so they
//! should return quickly.

use crate::job::{Job, JobId, JobStatus, JobType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

/// A single status transition.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub job_type: JobType,
    pub subject_id: String,
    pub status: JobStatus,
    /// Attempt number the transition belongs to (0 for `enqueued`)
    pub attempt: u32,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job: &Job, status: JobStatus, attempt: u32) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            subject_id: job.subject_id.clone(),
            status,
            attempt,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Callback invoked on job transitions.
pub trait JobObserver: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

/// Registered observers, called in registration order.
#[derive(Clone, Default)]
pub(crate) struct ObserverSet(Vec<Arc<dyn JobObserver>>);

impl ObserverSet {
    pub(crate) fn push(&mut self, observer: Arc<dyn JobObserver>) {
        self.0.push(observer);
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        for observer in &self.0 {
            observer.on_event(&event);
        }
    }
}

/// Observer that writes every transition to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl JobObserver for TracingObserver {
    fn on_event(&self, event: &JobEvent) {
        match event.status {
            JobStatus::Failed => warn!(
                job_id = %event.job_id,
                job_type = %event.job_type,
                attempt = event.attempt,
                error = event.error.as_deref().unwrap_or_default(),
                "Job attempt failed"
            ),
            JobStatus::Dlq => error!(
                job_id = %event.job_id,
                job_type = %event.job_type,
                attempt = event.attempt,
                error = event.error.as_deref().unwrap_or_default(),
                "Job moved to dead letter"
            ),
            status => info!(
                job_id = %event.job_id,
                job_type = %event.job_type,
                attempt = event.attempt,
                status = %status,
                "Job status changed"
            ),
        }
    }
}

/// Per-status transition counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub enqueued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dlq: u64,
}

/// Observer that counts transitions by status.
#[derive(Debug, Default)]
pub struct EventCounter {
    counts: [AtomicU64; 5],
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(status: JobStatus) -> usize {
        match status {
            JobStatus::Enqueued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
            JobStatus::Dlq => 4,
        }
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        self.counts[Self::slot(status)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> EventCounts {
        EventCounts {
            enqueued: self.get(JobStatus::Enqueued),
            processing: self.get(JobStatus::Processing),
            completed: self.get(JobStatus::Completed),
            failed: self.get(JobStatus::Failed),
            dlq: self.get(JobStatus::Dlq),
        }
    }
}

impl JobObserver for EventCounter {
    fn on_event(&self, event: &JobEvent) {
        self.counts[Self::slot(event.status)].fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CustomMessage, NotificationPayload, Recipient};

    fn job() -> Job {
        Job::new(
            JobId::from("j1"),
            JobType::SignInNotification,
            "u1",
            NotificationPayload::Custom(CustomMessage {
                recipient: Recipient::new("a@b.c", "A"),
                subject: "s".into(),
                body: "b".into(),
            }),
        )
    }

    #[test]
    fn test_counter_snapshot() {
        let counter = EventCounter::new();
        let job = job();

        counter.on_event(&JobEvent::new(&job, JobStatus::Enqueued, 0));
        counter.on_event(&JobEvent::new(&job, JobStatus::Processing, 1));
        counter.on_event(&JobEvent::new(&job, JobStatus::Failed, 1).with_error("x"));
        counter.on_event(&JobEvent::new(&job, JobStatus::Processing, 2));

        let snapshot = counter.snapshot();
        assert_eq!(snapshot.enqueued, 1);
        assert_eq!(snapshot.processing, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.completed, 0);
        assert_eq!(counter.get(JobStatus::Dlq), 0);
    }

    #[test]
    fn test_event_carries_job_fields() {
        let event = JobEvent::new(&job(), JobStatus::Dlq, 5).with_error("boom");
        assert_eq!(event.job_id.as_str(), "j1");
        assert_eq!(event.subject_id, "u1");
        assert_eq!(event.error.as_deref(), Some("boom"));
    }
}
