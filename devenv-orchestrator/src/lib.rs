//! Dev environment orchestration logic
//!
//! Owns the environment registry, the lifecycle state machine, routing and
//! the idle reaper. It is consumed by the devenv-api HTTP service but can be
//! driven from any entry point through [`EnvironmentOrchestrator`].

pub mod db;
pub mod environment;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod operation;
pub mod orchestrator;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod routing;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;


pub use environment::{Environment, EnvironmentFilters, EnvironmentState, EnvironmentStatus};
pub use error::{OrchestratorError, Result};
pub use events::{EventBus, LifecycleEvent};
pub use lifecycle::{LifecycleManager, Trigger};
pub use operation::{Operation, OperationStatus, OperationType};
pub use orchestrator::{Accepted, Components, EnvironmentOrchestrator, HealthReport};
pub use reaper::{IdleReaper, SweepReport};
pub use registry::EnvironmentRegistry;
pub use retry::RetryPolicy;
pub use routing::{InMemoryRouteTable, Route, RouteTable, RoutingResolver, TraefikFileRouteTable};
