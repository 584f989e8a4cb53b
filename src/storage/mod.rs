// Storage layer: shared TTL state and the append-only usage ledger

pub mod database;
pub mod state_store;
pub mod usage;

pub use database::{decimal_helpers, Database};
pub use state_store::{MemoryStateStore, StateStore};
pub use usage::{
    MemoryUsageLedger, ModelUsage, ProviderUsage, UsageLedger, UsageMetadata, UsageRecord,
    UsageRepository, UsageStatistics, UsageStatus, WindowCount,
};
