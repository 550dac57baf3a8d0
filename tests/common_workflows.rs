//! Integration tests for common tidings workflows.
//!
//! These tests go through the facade crate the way an application would:
//! decode a request body, enqueue it, let a worker deliver it, then look the
//! job up again.

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tidings::*;

/// Channel that keeps everything it was asked to send.
#[derive(Default)]
struct Outbox(Mutex<Vec<NotificationContent>>);

#[async_trait]
impl DeliveryChannel for Outbox {
    async fn send(&self, content: &NotificationContent) -> Result<(), DeliveryError> {
        self.0.lock().push(content.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "outbox"
    }
}

struct App {
    service: QueueService,
    worker: Worker,
    outbox: Arc<Outbox>,
}

fn app(config: &TidingsConfig) -> App {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryJobLogStore::new());
    let outbox = Arc::new(Outbox::default());

    App {
        service: QueueService::new(queue.clone(), store.clone(), config),
        worker: Worker::new(
            queue,
            store,
            ContentGenerator::new().unwrap(),
            outbox.clone(),
            &config.worker,
        ),
        outbox,
    }
}

// =============================================================================
// Sign-in notifications
// =============================================================================

#[tokio::test]
async fn test_sign_in_request_from_json_is_delivered() {
    let app = app(&TidingsConfig::default());

    let request: SignInRequest = serde_json::from_value(serde_json::json!({
        "subjectId": "user-42",
        "recipientContact": "jane@example.com",
        "displayName": "Jane",
        "eventProvider": "github",
        "jobId": "signin-user-42-1",
        "timestamp": "2024-03-05T14:07:00Z"
    }))
    .unwrap();
    assert_eq!(request.origin_address, "unknown");

    let receipt = app.service.enqueue(request).await.unwrap();
    assert_eq!(receipt.job_id.as_str(), "signin-user-42-1");
    assert_eq!(receipt.status, JobStatus::Enqueued);

    let outcome = app.worker.run_once().await.unwrap();
    assert_eq!(outcome, Some(AttemptOutcome::Completed { attempt: 1 }));

    let sent = app.outbox.0.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "New sign-in to your account");
    assert_eq!(sent[0].recipient.email, "jane@example.com");
    assert!(sent[0].body_text.contains("Provider: github"));
    assert!(sent[0].body_text.contains("March 5, 2024 14:07 UTC"));
    assert!(sent[0].body_html.is_some());
}

#[tokio::test]
async fn test_status_view_after_delivery() {
    let app = app(&TidingsConfig::default());
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();

    let receipt = app
        .service
        .enqueue(SignInRequest::new("u1", "jane@example.com", "Jane").timestamp(at))
        .await
        .unwrap();
    app.worker.run_once().await.unwrap();

    let record = app.service.get_status(&receipt.job_id).await.unwrap();
    let view = serde_json::to_value(JobStatusView::from(record)).unwrap();

    assert_eq!(view["jobId"], receipt.job_id.as_str());
    assert_eq!(view["type"], "user.signin.notification");
    assert_eq!(view["status"], "completed");
    assert_eq!(view["attemptCount"], 0);
    assert!(view["processedAt"].is_string());
}

// =============================================================================
// Custom messages
// =============================================================================

#[tokio::test]
async fn test_custom_message_is_sent_verbatim() {
    let app = app(&TidingsConfig::default());

    app.service
        .enqueue(
            CustomRequest::new(
                "u7",
                "ops@example.com",
                "Maintenance tonight",
                "Sign-in will be unavailable from 22:00 UTC.",
            )
            .display_name("Ops"),
        )
        .await
        .unwrap();
    app.worker.run_once().await.unwrap();

    let sent = app.outbox.0.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Maintenance tonight");
    assert_eq!(sent[0].body_text, "Sign-in will be unavailable from 22:00 UTC.");
    assert_eq!(sent[0].recipient.name, "Ops");
    assert!(sent[0].body_html.is_none());
}

// =============================================================================
// Validation and configuration
// =============================================================================

#[tokio::test]
async fn test_invalid_contact_is_rejected_with_400() {
    let app = app(&TidingsConfig::default());

    let err = app
        .service
        .enqueue(SignInRequest::new("u1", "not-an-address", "Jane"))
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 400);
    let body = ErrorBody::from(&err);
    assert_eq!(body.code, err.code());
    assert!(app.worker.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_config_from_toml_drives_rate_limit() {
    let config = TidingsConfig::from_toml_str(
        r#"
        queue_name = "user.signin.notification"

        [rate_limit]
        max_jobs = 2
        window_secs = 60
        "#,
    )
    .unwrap();
    config.validate().unwrap();
    assert_eq!(config.retry.max_attempts, 5);

    let app = app(&config);
    for _ in 0..2 {
        app.service
            .enqueue(SignInRequest::new("u1", "jane@example.com", "Jane"))
            .await
            .unwrap();
    }

    let err = app
        .service
        .enqueue(SignInRequest::new("u1", "jane@example.com", "Jane"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = TidingsConfig::from_json_str(r#"{ "retry": { "max_attempts": 0 } }"#).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}
