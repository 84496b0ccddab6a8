// Persistence for cost records and the query log

pub mod cost_store;
pub mod cost_tracker;
pub mod database;
pub mod query_log;

pub use cost_store::{CostStore, JsonFileCostStore, MemoryCostStore};
pub use cost_tracker::{CostBreakdown, CostEntry, CostRecord, CostSummary, CostTracker};
pub use database::Database;
pub use query_log::{QueryLog, QueryLogEntry, QueryLogStats};
