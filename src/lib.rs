// Tidings - background notification jobs for Rust
//
// This library bundles the notification queue with its Redis and SMTP
// backends behind cargo features.

// Re-export queue functionality
pub use tidings_queue::*;

// Re-export the crate itself for fully qualified paths
pub use tidings_queue as queue;

// Re-export commonly used external crates
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use serde_json;
pub use tokio;
