pub mod balancer;
pub mod choosers;
pub mod coordinator;
pub mod failure;
pub mod registry;

pub use balancer::ChooserRegistry;
pub use choosers::{ChooseContext, ChooseResult, Chooser, NoopChooser};
pub use coordinator::{
    BoundRoute, ConnectionGuard, Selection, SelectionCoordinator, SelectionResult,
};
pub use failure::SelectionFailure;
pub use registry::{
    HealthChangeEvent, InstanceHealthRegistry, InstanceStats, InstanceStatsSnapshot, InstanceStatus,
    RegistryStats,
};
