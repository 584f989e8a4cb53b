//! Gateway facade tying adapters, the circuit breaker, quotas and the model
//! selector together.

pub mod service;
pub mod types;

pub use service::Gateway;
pub use types::{
    CallerContext, DescriptorSnapshot, HealthReport, ModelTarget, ResolvedTarget, TimeoutBudgets,
};
