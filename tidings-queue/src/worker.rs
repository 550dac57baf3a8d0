//! Worker: consumes deliveries and drives the job state machine.

use crate::broker::{Delivery, FailOutcome, MessageQueue};
use crate::config::WorkerConfig;
use crate::content::ContentGenerator;
use crate::delivery::DeliveryChannel;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobStatus, StatusUpdate};
use crate::observer::{JobEvent, JobObserver, ObserverSet};
use crate::store::JobLogStore;
use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened to a delivery after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Delivered and acknowledged
    Completed { attempt: u32 },
    /// Failed; the queue redelivers after `delay`
    Retrying { attempt: u32, delay: Duration },
    /// Failed on the final attempt
    DeadLettered { attempt: u32 },
}

/// Consumer of the message queue.
pub struct Worker {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn JobLogStore>,
    generator: ContentGenerator,
    channel: Arc<dyn DeliveryChannel>,
    config: WorkerConfig,
    observers: ObserverSet,
    running: AtomicBool,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn JobLogStore>,
        generator: ContentGenerator,
        channel: Arc<dyn DeliveryChannel>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            generator,
            channel,
            config: config.clone(),
            observers: ObserverSet::default(),
            running: AtomicBool::new(false),
        }
    }

    /// Register an observer for every transition the worker records.
    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Override the number of consumer tasks.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency.max(1);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one delivery attempt and record its outcome in the job log.
    ///
    /// Returns `TransientDelivery` when attempts remain and `ExhaustedRetries`
    /// when `attempt` was the last one. The queue is not touched.
    pub async fn process(&self, job: &Job, attempt: u32) -> QueueResult<()> {
        let started = Instant::now();
        match self.attempt(job, attempt).await {
            Ok(()) => {
                self.completed(job, attempt, started).await;
                Ok(())
            }
            Err(failure) if job.is_final_attempt(attempt) => {
                Err(self.dead_lettered(job, attempt, failure, started).await)
            }
            Err(failure) => Err(self.failed(job, attempt, failure, started).await),
        }
    }

    /// Process a delivery and settle it with the queue.
    ///
    /// The outcome is written to the job log only once the queue accepts the
    /// settlement; a delivery whose lease was lost fails with `StaleDelivery`
    /// and leaves the log to the current holder.
    pub async fn handle(&self, delivery: Delivery) -> QueueResult<AttemptOutcome> {
        let job = &delivery.job;
        let attempt = delivery.attempt;
        let started = Instant::now();

        let failure = match self.attempt(job, attempt).await {
            Ok(()) => {
                self.queue.acknowledge(&delivery).await?;
                self.completed(job, attempt, started).await;
                return Ok(AttemptOutcome::Completed { attempt });
            }
            Err(failure) => failure,
        };

        let outcome = self.queue.fail(&delivery, &failure.message).await?;
        match outcome {
            FailOutcome::Retrying { delay } => {
                self.failed(job, attempt, failure, started).await;
                debug!(
                    job_id = %job.id,
                    delay_ms = delay.as_millis() as u64,
                    "Redelivery scheduled"
                );
                Ok(AttemptOutcome::Retrying { attempt, delay })
            }
            FailOutcome::Exhausted => {
                self.dead_lettered(job, attempt, failure, started).await;
                Ok(AttemptOutcome::DeadLettered { attempt })
            }
        }
    }

    /// Record `processing`, render the content and hand it to the channel.
    async fn attempt(&self, job: &Job, attempt: u32) -> Result<(), Failure> {
        debug!(
            job_id = %job.id,
            attempt,
            max_attempts = job.max_attempts,
            channel = self.channel.name(),
            "Processing job"
        );

        self.record(job, StatusUpdate::processing(attempt)).await;
        self.observers
            .emit(JobEvent::new(job, JobStatus::Processing, attempt));

        let content = self
            .generator
            .generate(&job.payload)
            .map_err(|e| Failure::capture(&e))?;

        if let Err(e) = self.channel.send(&content).await {
            debug!(job_id = %job.id, retryable = e.is_retryable(), "Delivery channel failed");
            return Err(Failure::capture(&e));
        }
        Ok(())
    }

    async fn completed(&self, job: &Job, attempt: u32, started: Instant) {
        self.record(job, StatusUpdate::completed()).await;
        self.observers
            .emit(JobEvent::new(job, JobStatus::Completed, attempt));
        info!(
            job_id = %job.id,
            attempt,
            duration_ms = started.elapsed().as_millis() as u64,
            "Job completed"
        );
    }

    async fn failed(&self, job: &Job, attempt: u32, failure: Failure, started: Instant) -> QueueError {
        warn!(
            job_id = %job.id,
            attempt,
            duration_ms = started.elapsed().as_millis() as u64,
            error = %failure.message,
            "Job attempt failed, will retry"
        );
        self.record(job, StatusUpdate::failed(attempt, &failure.message))
            .await;
        self.observers
            .emit(JobEvent::new(job, JobStatus::Failed, attempt).with_error(&failure.message));
        QueueError::TransientDelivery {
            attempt,
            message: failure.message,
        }
    }

    async fn dead_lettered(
        &self,
        job: &Job,
        attempt: u32,
        failure: Failure,
        started: Instant,
    ) -> QueueError {
        error!(
            job_id = %job.id,
            attempt,
            duration_ms = started.elapsed().as_millis() as u64,
            error = %failure.message,
            "Job exhausted all attempts, moving to dead letter"
        );
        self.record(
            job,
            StatusUpdate::dead_lettered(attempt, &failure.message, failure.stack),
        )
        .await;
        self.observers
            .emit(JobEvent::new(job, JobStatus::Dlq, attempt).with_error(&failure.message));
        QueueError::ExhaustedRetries {
            attempts: attempt,
            message: failure.message,
        }
    }

    /// Reserve and handle a single delivery, if one is ready.
    pub async fn run_once(&self) -> QueueResult<Option<AttemptOutcome>> {
        match self.queue.reserve().await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Spawn the consumer tasks and the stall sweeper.
    pub fn start(self: Arc<Self>) -> QueueResult<WorkerHandle> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::WorkerAlreadyRunning);
        }

        info!(
            concurrency = self.config.concurrency,
            queue = self.queue.backend(),
            store = self.store.backend(),
            channel = self.channel.name(),
            "Starting worker"
        );

        let (shutdown, _) = watch::channel(false);
        let consumers = (0..self.config.concurrency)
            .map(|index| tokio::spawn(self.clone().consume(index, shutdown.subscribe())))
            .collect();
        let sweeper = tokio::spawn(self.clone().sweep(shutdown.subscribe()));

        Ok(WorkerHandle {
            worker: self,
            shutdown,
            consumers,
            sweeper,
        })
    }

    async fn consume(self: Arc<Self>, index: usize, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = self.config.poll_interval();

        while !*shutdown.borrow() {
            match self.queue.reserve().await {
                Ok(Some(delivery)) => {
                    let job_id = delivery.job.id.clone();
                    if let Err(e) = self.handle(delivery).await {
                        error!(consumer = index, job_id = %job_id, error = %e, "Failed to settle delivery");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(consumer = index, error = %e, "Failed to reserve job"),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(consumer = index, "Consumer stopped");
    }

    async fn sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.stall_check_interval());
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.recover_stalled().await {
                        error!(error = %e, "Stall check failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn record(&self, job: &Job, update: StatusUpdate) {
        if let Err(e) = self.store.update_status(&job.id, &update).await {
            warn!(
                job_id = %job.id,
                status = %update.status,
                error = %e,
                "Failed to write job log"
            );
        }
    }
}

/// A failed attempt, reduced to owned text before anything is awaited.
struct Failure {
    message: String,
    stack: String,
}

impl Failure {
    fn capture(err: &(dyn StdError + 'static)) -> Self {
        Self {
            message: err.to_string(),
            stack: error_chain(err),
        }
    }
}

/// Error message followed by its source chain.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str("\ncaused by: ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

/// Handle to a running worker.
pub struct WorkerHandle {
    worker: Arc<Worker>,
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Stop taking deliveries, wait up to `timeout` for in-flight attempts,
    /// abort whatever is left and close the queue.
    pub async fn shutdown(self, timeout: Duration) -> QueueResult<()> {
        info!(timeout_secs = timeout.as_secs(), "Shutting down worker");
        // Receivers may already be gone
        let _ = self.shutdown.send(true);

        let mut consumers = self.consumers;
        let drained = tokio::time::timeout(timeout, async {
            for consumer in consumers.iter_mut() {
                let _ = consumer.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!("In-flight jobs did not finish in time, aborting");
            for consumer in &consumers {
                consumer.abort();
            }
        }
        self.sweeper.abort();

        self.worker.running.store(false, Ordering::SeqCst);
        self.worker.queue.close().await?;
        info!("Worker stopped");
        Ok(())
    }
}
