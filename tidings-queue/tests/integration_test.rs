//! Integration tests for tidings-queue

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tidings_queue::*;

/// Channel that fails the first `failures` sends, then succeeds.
struct ScriptedChannel {
    failures: u32,
    calls: AtomicU32,
}

impl ScriptedChannel {
    fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    async fn send(&self, _content: &NotificationContent) -> Result<(), DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(DeliveryError::Transport("connection reset".into()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Observer that keeps every transition in order.
#[derive(Default)]
struct Transitions(Mutex<Vec<(JobId, JobStatus)>>);

impl Transitions {
    fn for_job(&self, job_id: &JobId) -> Vec<JobStatus> {
        self.0
            .lock()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

impl JobObserver for Transitions {
    fn on_event(&self, event: &JobEvent) {
        self.0.lock().push((event.job_id.clone(), event.status));
    }
}

struct Harness {
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryJobLogStore>,
    channel: Arc<ScriptedChannel>,
    transitions: Arc<Transitions>,
    service: QueueService,
    worker: Arc<Worker>,
}

fn harness_with(config: TidingsConfig, channel: ScriptedChannel) -> Harness {
    let queue = Arc::new(MemoryQueue::with_visibility_timeout(
        config.worker.visibility_timeout(),
    ));
    let store = Arc::new(MemoryJobLogStore::new());
    let channel = Arc::new(channel);
    let transitions = Arc::new(Transitions::default());

    let service = QueueService::new(queue.clone(), store.clone(), &config)
        .with_observer(transitions.clone());
    let worker = Worker::new(
        queue.clone(),
        store.clone(),
        ContentGenerator::new().unwrap(),
        channel.clone(),
        &config.worker,
    )
    .with_observer(transitions.clone());

    Harness {
        queue,
        store,
        channel,
        transitions,
        service,
        worker: Arc::new(worker),
    }
}

fn harness(channel: ScriptedChannel) -> Harness {
    harness_with(TidingsConfig::default(), channel)
}

fn sign_in(subject: &str) -> SignInRequest {
    SignInRequest::new(subject, "jane@example.com", "Jane")
        .provider("github")
        .origin_address("203.0.113.7")
        .client_descriptor("Mozilla/5.0 (X11; Linux x86_64)")
}

/// Run the worker until the queue has nothing ready, advancing the paused
/// clock over every backoff delay.
async fn drain(worker: &Worker) -> Vec<AttemptOutcome> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = worker.run_once().await.unwrap() {
        if let AttemptOutcome::Retrying { delay, .. } = outcome {
            tokio::time::advance(delay + Duration::from_millis(1)).await;
        }
        outcomes.push(outcome);
    }
    outcomes
}

#[tokio::test(start_paused = true)]
async fn test_success_path_is_terminal() {
    let h = harness(ScriptedChannel::failing(0));
    let receipt = h.service.enqueue(sign_in("u1")).await.unwrap();

    let outcomes = drain(&h.worker).await;
    assert_eq!(outcomes, vec![AttemptOutcome::Completed { attempt: 1 }]);
    assert_eq!(
        h.transitions.for_job(&receipt.job_id),
        vec![JobStatus::Enqueued, JobStatus::Processing, JobStatus::Completed]
    );

    // Never redelivered, even after lease expiry and a stall sweep
    tokio::time::advance(Duration::from_secs(3600)).await;
    assert_eq!(h.queue.recover_stalled().await.unwrap(), 0);
    assert_eq!(h.worker.run_once().await.unwrap(), None);
    assert_eq!(h.channel.calls(), 1);

    let view = JobStatusView::from(h.service.get_status(&receipt.job_id).await.unwrap());
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.attempt_count, 0);
    assert!(view.processed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_completed_job_is_not_admitted_again() {
    let h = harness(ScriptedChannel::failing(0));
    let request = sign_in("u1").job_id("signin-u1-1000-abc");

    h.service.enqueue(request.clone()).await.unwrap();
    drain(&h.worker).await;

    let err = h.service.enqueue(request).await.unwrap_err();
    assert!(matches!(err, QueueError::AlreadyProcessed(_)));
    assert_eq!(err.status_code(), 409);

    let counts = h.queue.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting + counts.delayed + counts.active, 0);
    assert_eq!(h.channel.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_enqueue_before_processing() {
    let h = harness(ScriptedChannel::failing(0));
    let request = sign_in("u1").job_id("signin-u1-1000-abc");

    let first = h.service.enqueue(request.clone()).await.unwrap();
    let second = h.service.enqueue(request.clone()).await.unwrap();
    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(second.status, JobStatus::Enqueued);
    assert_eq!(h.queue.counts().await.unwrap().waiting, 1);

    let outcomes = drain(&h.worker).await;
    assert_eq!(outcomes.len(), 1);

    assert!(matches!(
        h.service.enqueue(request).await,
        Err(QueueError::AlreadyProcessed(_))
    ));
    assert_eq!(h.channel.calls(), 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_rate_limit_per_subject() {
    let h = harness(ScriptedChannel::failing(0));

    for _ in 0..10 {
        h.service.enqueue(sign_in("u1")).await.unwrap();
    }

    let err = h.service.enqueue(sign_in("u1")).await.unwrap_err();
    match &err {
        QueueError::RateLimitExceeded {
            subject_id, limit, ..
        } => {
            assert_eq!(subject_id, "u1");
            assert_eq!(*limit, 10);
        }
        other => panic!("expected rate limit error, got {other:?}"),
    }
    assert_eq!(err.status_code(), 429);

    // Other subjects are unaffected
    h.service.enqueue(sign_in("u2")).await.unwrap();
    assert_eq!(h.queue.counts().await.unwrap().waiting, 11);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_dead_letters() {
    let h = harness(ScriptedChannel::always_failing());
    let receipt = h.service.enqueue(sign_in("u1")).await.unwrap();

    let outcomes = drain(&h.worker).await;
    assert_eq!(outcomes.len(), 5);
    for (i, outcome) in outcomes[..4].iter().enumerate() {
        assert!(
            matches!(outcome, AttemptOutcome::Retrying { attempt, .. } if *attempt == i as u32 + 1)
        );
    }
    assert_eq!(outcomes[4], AttemptOutcome::DeadLettered { attempt: 5 });

    let mut expected = vec![JobStatus::Enqueued];
    for _ in 0..4 {
        expected.extend([JobStatus::Processing, JobStatus::Failed]);
    }
    expected.extend([JobStatus::Processing, JobStatus::Dlq]);
    assert_eq!(h.transitions.for_job(&receipt.job_id), expected);

    let record = h.service.get_status(&receipt.job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Dlq);
    assert_eq!(record.attempt_count, 5);
    assert_eq!(record.error.as_deref(), Some("Transport error: connection reset"));
    assert!(record.stack_trace.is_some());

    // Never reappears
    tokio::time::advance(Duration::from_secs(7200)).await;
    assert_eq!(h.queue.recover_stalled().await.unwrap(), 0);
    assert_eq!(h.worker.run_once().await.unwrap(), None);
    assert_eq!(h.queue.counts().await.unwrap().failed, 1);
    assert_eq!(h.channel.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_four_failures_then_success() {
    let h = harness(ScriptedChannel::failing(4));
    let receipt = h
        .service
        .enqueue(sign_in("u1").job_id("signin-u1-1000-abc"))
        .await
        .unwrap();

    let outcomes = drain(&h.worker).await;
    assert_eq!(outcomes.last(), Some(&AttemptOutcome::Completed { attempt: 5 }));

    let delays: Vec<Duration> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            AttemptOutcome::Retrying { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(16),
        ]
    );

    let record = h.service.get_status(&receipt.job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempt_count, 4);
    assert!(record.error.is_none());
}

#[test]
fn test_backoff_non_decreasing() {
    let backoff = RetryPolicy::default().backoff();
    let max_attempts = RetryPolicy::default().max_attempts;

    let delays: Vec<Duration> = (1..max_attempts).map(|n| backoff.delay(n)).collect();
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(delays[0], Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_listing_newest_first() {
    let mut config = TidingsConfig::default();
    config.retry.max_attempts = 1;
    let h = harness_with(config, ScriptedChannel::always_failing());

    let mut ids = Vec::new();
    for subject in ["u1", "u2", "u3"] {
        ids.push(h.service.enqueue(sign_in(subject)).await.unwrap().job_id);
    }

    let outcomes = drain(&h.worker).await;
    assert!(
        outcomes
            .iter()
            .all(|outcome| matches!(outcome, AttemptOutcome::DeadLettered { attempt: 1 }))
    );

    let listed = h.service.list_dead_lettered(100).await.unwrap();
    let listed_ids: Vec<JobId> = listed.into_iter().map(|r| r.job_id).collect();
    ids.reverse();
    assert_eq!(listed_ids, ids);

    let newest_two = h.service.list_dead_lettered(2).await.unwrap();
    assert_eq!(newest_two.len(), 2);
    assert_eq!(newest_two[0].job_id, ids[0]);
}

#[tokio::test]
async fn test_dead_letter_limit_is_clamped() {
    let h = harness(ScriptedChannel::failing(0));
    assert!(h.service.list_dead_lettered(0).await.unwrap().is_empty());
    assert!(h.service.list_dead_lettered(10_000).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_delivery_is_redelivered_without_consuming_attempt() {
    let h = harness(ScriptedChannel::failing(0));
    let receipt = h.service.enqueue(sign_in("u1")).await.unwrap();

    // A consumer takes the job and disappears
    let abandoned = h.queue.reserve().await.unwrap().unwrap();
    assert_eq!(abandoned.attempt, 1);
    assert_eq!(h.worker.run_once().await.unwrap(), None);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(h.queue.recover_stalled().await.unwrap(), 1);

    assert_eq!(
        h.worker.run_once().await.unwrap(),
        Some(AttemptOutcome::Completed { attempt: 1 })
    );

    // The old lease can no longer settle the job
    assert!(matches!(
        h.queue.acknowledge(&abandoned).await,
        Err(QueueError::StaleDelivery(_))
    ));
    let record = h.service.get_status(&receipt.job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_stale_failure_does_not_dead_letter_redelivered_job() {
    let mut config = TidingsConfig::default();
    config.retry.max_attempts = 1;
    config.worker.visibility_timeout_secs = 1;
    let h = harness_with(config.clone(), ScriptedChannel::failing(0));
    let stale_worker = Worker::new(
        h.queue.clone(),
        h.store.clone(),
        ContentGenerator::new().unwrap(),
        Arc::new(ScriptedChannel::always_failing()),
        &config.worker,
    );
    let receipt = h.service.enqueue(sign_in("u1")).await.unwrap();

    let first = h.queue.reserve().await.unwrap().unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(h.queue.recover_stalled().await.unwrap(), 1);
    let second = h.queue.reserve().await.unwrap().unwrap();

    // The expired holder fails after the job was handed out again
    assert!(matches!(
        stale_worker.handle(first).await,
        Err(QueueError::StaleDelivery(_))
    ));
    assert_eq!(
        h.worker.handle(second).await.unwrap(),
        AttemptOutcome::Completed { attempt: 1 }
    );

    let record = h.service.get_status(&receipt.job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(h.service.list_dead_lettered(10).await.unwrap().is_empty());

    let counts = h.queue.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 0);
    assert_eq!(
        h.transitions.for_job(&receipt.job_id),
        vec![JobStatus::Enqueued, JobStatus::Processing, JobStatus::Completed]
    );
}

/// Job log whose first status update is lost.
struct LossyStore {
    inner: MemoryJobLogStore,
    dropped: AtomicBool,
}

impl LossyStore {
    fn new() -> Self {
        Self {
            inner: MemoryJobLogStore::new(),
            dropped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl JobLogStore for LossyStore {
    async fn find(&self, job_id: &JobId) -> StoreResult<Option<JobLogRecord>> {
        self.inner.find(job_id).await
    }

    async fn insert(&self, record: JobLogRecord) -> StoreResult<()> {
        self.inner.insert(record).await
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> StoreResult<JobLogRecord> {
        if !self.dropped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset".into()));
        }
        self.inner.update_status(job_id, update).await
    }

    async fn count_since(
        &self,
        subject_id: &str,
        job_type: JobType,
        since: chrono::DateTime<chrono::Utc>,
    ) -> StoreResult<u64> {
        self.inner.count_since(subject_id, job_type, since).await
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> StoreResult<Vec<JobLogRecord>> {
        self.inner.list_by_status(status, limit).await
    }

    fn backend(&self) -> &'static str {
        "lossy"
    }
}

async fn run_with_lossy_store(
    max_attempts: u32,
    channel: ScriptedChannel,
) -> (Option<AttemptOutcome>, JobLogRecord, Arc<LossyStore>) {
    let mut config = TidingsConfig::default();
    config.retry.max_attempts = max_attempts;
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(LossyStore::new());
    let service = QueueService::new(queue.clone(), store.clone(), &config);
    let worker = Worker::new(
        queue,
        store.clone(),
        ContentGenerator::new().unwrap(),
        Arc::new(channel),
        &config.worker,
    );

    let receipt = service.enqueue(sign_in("u1")).await.unwrap();
    let outcome = worker.run_once().await.unwrap();
    let record = service.get_status(&receipt.job_id).await.unwrap();
    (outcome, record, store)
}

#[tokio::test]
async fn test_lost_processing_write_still_records_completion() {
    let (outcome, record, _) = run_with_lossy_store(5, ScriptedChannel::failing(0)).await;

    assert_eq!(outcome, Some(AttemptOutcome::Completed { attempt: 1 }));
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.processed_at.is_some());
}

#[tokio::test]
async fn test_lost_processing_write_still_dead_letters() {
    let (outcome, record, store) =
        run_with_lossy_store(1, ScriptedChannel::always_failing()).await;

    assert_eq!(outcome, Some(AttemptOutcome::DeadLettered { attempt: 1 }));
    assert_eq!(record.status, JobStatus::Dlq);
    assert_eq!(store.list_by_status(JobStatus::Dlq, 10).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_pool_processes_and_shuts_down() {
    let h = harness(ScriptedChannel::failing(0));
    let counter = Arc::new(EventCounter::new());
    let worker = Arc::new(
        Worker::new(
            h.queue.clone(),
            h.store.clone(),
            ContentGenerator::new().unwrap(),
            h.channel.clone(),
            &WorkerConfig::default(),
        )
        .with_observer(counter.clone())
        .with_concurrency(2),
    );

    for subject in ["u1", "u2", "u3"] {
        h.service.enqueue(sign_in(subject)).await.unwrap();
    }

    let handle = worker.clone().start().unwrap();
    for _ in 0..50 {
        if counter.snapshot().completed == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    handle.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(counter.snapshot().completed, 3);
    assert!(!worker.is_running());
    assert!(matches!(
        h.service.enqueue(sign_in("u9")).await,
        Err(QueueError::Broker(_))
    ));
}

#[tokio::test]
async fn test_enqueue_quietly_never_fails() {
    let h = harness(ScriptedChannel::failing(0));
    for _ in 0..10 {
        assert!(h.service.enqueue_quietly(sign_in("u1")).await.is_some());
    }
    assert!(h.service.enqueue_quietly(sign_in("u1")).await.is_none());
}

#[tokio::test]
async fn test_error_bodies() {
    let h = harness(ScriptedChannel::failing(0));
    let err = h
        .service
        .enqueue(SignInRequest::new("u1", "", "Jane"))
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 400);
    assert!(err.is_caller_reportable());
    let body = ErrorBody::from(&err);
    assert_eq!(body.code, "validation_error");
}
