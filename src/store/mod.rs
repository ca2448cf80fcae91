//! Durable stores, all SQLite-backed and sharing one database file.

pub mod baselines;
pub mod event_log;
pub mod incidents;
pub mod rules;

pub use baselines::BaselineStore;
pub use event_log::{DimensionFilter, EventLog, MinuteSnapshot};
pub use incidents::IncidentStore;
pub use rules::{RuleRegistry, RuleSnapshot};
