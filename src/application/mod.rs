//! Application services layer.

pub mod backfill;
pub mod featured;
pub mod gateway;

pub use backfill::BackfillScheduler;
pub use featured::{BackfillRun, FeaturedSetManager, ToggleAction, ToggleOutcome};
pub use gateway::Gateway;
