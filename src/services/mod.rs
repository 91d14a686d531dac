//! Application services for the praktor gateway.

pub mod gateway;
pub mod orchestrator;
pub mod provision;
pub mod registry;
pub mod reloader;
pub mod router;
pub mod scheduler;
pub mod swarm;

pub use gateway::Gateway;
pub use orchestrator::{
    CollabMembership, IpcToolHandler, Orchestrator, OutputListener, SwarmMembershipMap,
};
pub use provision::Provisioner;
pub use registry::Registry;
pub use reloader::{diff, ConfigDiff, Reloader};
pub use router::{RoutePicker, Route, Router, SWARM_SENTINEL};
pub use scheduler::Scheduler;
pub use swarm::plan::{build_plan, SwarmPlan};
pub use swarm::SwarmCoordinator;
