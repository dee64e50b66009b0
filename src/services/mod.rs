//! Harvester services built on top of the engine

pub mod failed_targets;
pub mod harvest;
pub mod preflight;
pub mod session;
pub mod store;

pub use failed_targets::{FailedTargets, Ledger};
pub use harvest::{
    load_targets, parse_targets, HarvestReport, Harvester, PersistReport, RequestTemplate, TargetResult,
};
pub use preflight::run_preflight;
pub use session::{run_session, RunProgress};
pub use store::{JsonlStore, PersistenceStore, StoreItem};
