//! Background notification jobs with idempotent enqueue, rate limiting,
//! retries and dead-lettering.
//!
//! Provides:
//! - 🛂 A queue service that validates, deduplicates and rate limits requests
//! - 📦 Message queue and job log backends (in-memory and Redis)
//! - 🔄 Exponential backoff between delivery attempts
//! - 💀 Dead-lettering once attempts are exhausted
//! - 👷 A worker pool with stall recovery and graceful shutdown
//! - 📣 Observers for every job status transition
//!
//! ## Quick Start - Enqueue
//!
//! ```
//! use std::sync::Arc;
//! use tidings_queue::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> QueueResult<()> {
//! let config = TidingsConfig::default();
//! let queue = Arc::new(MemoryQueue::new());
//! let store = Arc::new(MemoryJobLogStore::new());
//! let service = QueueService::new(queue, store, &config);
//!
//! let receipt = service
//!     .enqueue(
//!         SignInRequest::new("u1", "jane@example.com", "Jane")
//!             .provider("github")
//!             .origin_address("203.0.113.7"),
//!     )
//!     .await?;
//!
//! assert_eq!(receipt.status, JobStatus::Enqueued);
//! # Ok(())
//! # }
//! ```
//!
//! ## Processing
//!
//! ```
//! use std::sync::Arc;
//! use tidings_queue::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> QueueResult<()> {
//! let config = TidingsConfig::default();
//! let queue = Arc::new(MemoryQueue::new());
//! let store = Arc::new(MemoryJobLogStore::new());
//! let service = QueueService::new(queue.clone(), store.clone(), &config);
//! let worker = Worker::new(
//!     queue,
//!     store,
//!     ContentGenerator::new()?,
//!     Arc::new(LogChannel::new()),
//!     &config.worker,
//! );
//!
//! let receipt = service
//!     .enqueue(CustomRequest::new("u1", "ops@example.com", "Maintenance", "Tonight at 22:00"))
//!     .await?;
//! worker.run_once().await?;
//!
//! let record = service.get_status(&receipt.job_id).await?;
//! assert_eq!(record.status, JobStatus::Completed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Redis
//!
//! With the `redis` feature, [`RedisQueue`] and [`RedisJobLogStore`] provide
//! durable backends shared by several worker processes:
//!
//! ```no_run
//! # #[cfg(feature = "redis")]
//! # async fn example() -> tidings_queue::QueueResult<()> {
//! use tidings_queue::{RedisJobLogStore, RedisQueue, TidingsConfig};
//!
//! let config = TidingsConfig::from_env()?;
//! let queue = RedisQueue::connect(&config).await?;
//! let store = RedisJobLogStore::connect(&config).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod content;
pub mod delivery;
pub mod error;
pub mod job;
pub mod observer;
pub mod response;
pub mod service;
pub mod store;
pub mod worker;

pub use broker::{
    Backoff, Delivery, FailOutcome, MemoryQueue, MessageQueue, QueueCounts, Submission,
    SubmitOptions,
};
#[cfg(feature = "redis")]
pub use broker::RedisQueue;
pub use config::{RateLimitConfig, RetryPolicy, TidingsConfig, WorkerConfig};
pub use content::{ContentGenerator, NotificationContent};
pub use delivery::{DeliveryChannel, LogChannel, mask_email};
#[cfg(feature = "smtp")]
pub use delivery::{SmtpChannel, SmtpSecurity, SmtpSettings};
pub use error::{ConfigError, DeliveryError, QueueError, QueueResult, StoreError, StoreResult};
pub use job::{
    CustomMessage, Job, JobId, JobLogRecord, JobStatus, JobType, NotificationPayload, Recipient,
    SignInDetails, StatusUpdate,
};
pub use observer::{EventCounter, EventCounts, JobEvent, JobObserver, TracingObserver};
pub use response::{ErrorBody, JobStatusView};
pub use service::{CustomRequest, EnqueueReceipt, EnqueueRequest, QueueService, SignInRequest};
pub use store::{JobLogStore, MemoryJobLogStore};
#[cfg(feature = "redis")]
pub use store::RedisJobLogStore;
pub use worker::{AttemptOutcome, Worker, WorkerHandle};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broker::{MemoryQueue, MessageQueue};
    pub use crate::config::TidingsConfig;
    pub use crate::content::ContentGenerator;
    pub use crate::delivery::{DeliveryChannel, LogChannel};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::job::{Job, JobId, JobLogRecord, JobStatus};
    pub use crate::observer::{EventCounter, JobObserver, TracingObserver};
    pub use crate::service::{CustomRequest, EnqueueReceipt, QueueService, SignInRequest};
    pub use crate::store::{JobLogStore, MemoryJobLogStore};
    pub use crate::worker::{AttemptOutcome, Worker, WorkerHandle};
}
