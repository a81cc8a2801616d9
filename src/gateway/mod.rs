//! Gateway: aggregation of many backends behind one surface.
//!
//! The `Aggregator` owns the backends, the namespace registries and the
//! health tracker, and dispatches each call to the owning backend under its
//! retry policy.

pub mod aggregator;
pub mod errors;
pub mod health;
pub mod naming;
pub mod registry;
pub mod retry;

#[cfg(test)]
mod testing;

pub use aggregator::{Aggregator, BackendPolicy};
pub use errors::{CapabilityKind, GatewayError, ServerFailure, StartupReport};
pub use health::{HealthStats, HealthStatus, HealthTracker};
pub use registry::{
    NamespaceRegistry, PromptEntry, PromptRegistry, RegisterOutcome, RegistryEntry, ResourceEntry,
    ResourceRegistry, ToolEntry, ToolRegistry,
};
pub use retry::{with_retry, Retryable};
