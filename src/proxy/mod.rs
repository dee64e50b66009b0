//! Egress proxy management
//!
//! This module provides:
//! - Parsing and masking of egress addresses
//! - Health-aware round-robin rotation with cooldowns
//! - Parallel warmup probing before a run

pub mod address;
pub mod pool;
pub mod warmup;

pub use address::{parse_proxy_list, ProxyAddress};
pub use pool::{Egress, ProxyPool};
pub use warmup::{warmup_proxies, WarmupReport};
