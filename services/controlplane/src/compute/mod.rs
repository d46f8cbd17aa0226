//! Compute orchestration: quota and scheduling collaborators, the
//! instance create flow built on them and instance groups.
pub mod instance_group;
pub mod orchestrator;
pub mod quota;
pub mod scheduler;

pub use instance_group::{InstanceGroup, InstanceGroups, NewInstanceGroup, ScaleStatus};
pub use orchestrator::{Caller, CreateOptions, InstanceOrchestrator};
pub use quota::{QuotaProvider, StaticQuota};
pub use scheduler::{HttpScheduler, Placement, Scheduler, UnconfiguredScheduler};
