//! Bounded session/message cache
//!
//! Information Hiding:
//! - `store` owns the index and schedules persistence
//! - `eviction` decides what to drop, without side effects
//! - `budgets` carries the limits both agree on

pub mod budgets;
pub mod eviction;
pub mod store;

pub use budgets::{BudgetOverrides, Budgets};
pub use eviction::EvictionReason;
pub use store::{
    ApplyOutcome, CacheStats, CacheStore, EvictionReport, LoadReport, MessageRange, PersistOp,
};
