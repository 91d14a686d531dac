//! Domain models
//!
//! Framework-agnostic entities shared by the services layer, the store,
//! and the wire contracts.

pub mod agent;
pub mod config;
pub mod container;
pub mod message;
pub mod schedule;
pub mod secret;
pub mod session;
pub mod swarm;
pub mod task;

pub use agent::{AgentDefinition, FileMount, SecretFile};
pub use config::{
    Config, Defaults, NatsConfig, RouterConfig, SchedulerConfig, TelegramConfig, VaultConfig,
    WebConfig,
};
pub use container::{ContainerInfo, ContainerStatus};
pub use message::{MessageDirection, StoredMessage};
pub use schedule::Schedule;
pub use secret::{Secret, SecretKind};
pub use session::Session;
pub use swarm::{RoleResult, RoleStatus, SwarmAgent, SwarmRun, SwarmStatus, Synapse};
pub use task::{ScheduledTask, TaskRunStatus, TaskStatus};
