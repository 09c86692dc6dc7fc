//! ClinVar tab-delimited sync: download, verify, bulk load, derive, enrich,
//! report.

pub mod config;
pub mod derived;
pub mod enrich;
pub mod loader;
pub mod orchestrator;
pub mod postgres;
pub mod registry;
pub mod report;
pub mod schedule;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{SourceRegistry, SourceSpec, SyncConfig};
pub use orchestrator::{
    notifier_from_config, report_startup_failure, run_once, Collaborators, Heartbeat, RunOptions,
    SyncOrchestrator,
};
pub use postgres::PgStore;
pub use registry::{ActiveProcessGuard, ActiveProcessRegistry};
pub use schedule::maybe_build_scheduler;

pub const CRATE_NAME: &str = "cvsync-sync";
