//! Harvest - resilient API harvesting engine
//!
//! Executes large batches of API requests against rate-limited, bot-protected
//! endpoints through a rotating egress pool.
//!
//! ## Features
//!
//! - Proxy pool with strike-based cooldown and forced reuse when exhausted
//! - Global circuit breaker with a single half-open trial
//! - Retry orchestration with per-status backoff and schema-drift alerts
//! - Browser identity rotation with session warmup
//! - Paced batch scheduling with family and global concurrency caps
//! - Failed-target ledger and JSON-lines result store

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use engine::Engine;
pub use error::{HarvestError, Result};
