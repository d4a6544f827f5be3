//! Rust Admission Control
//!
//! Per-identifier token-bucket rate limiting with best-effort persistence of
//! remaining tokens to an external key-value store, so that limits survive
//! process restarts and are loosely shared between instances.

pub mod bucket;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod redis;
pub mod registry;
pub mod store;
pub mod utils;

// Re-export main types
pub use bucket::TokenBucket;
pub use crate::config::{Interval, LimiterOptions, RateLimitConfig, Settings};
pub use error::{AdmissionError, Result};
pub use manager::{ManagerBuilder, RateLimitManager};
pub use middleware::{admission_middleware, extract_identifier};
pub use registry::LimiterRegistry;
pub use store::{MemoryStore, PersistenceStore, StateStore};
