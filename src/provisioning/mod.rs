//! # Provisioning
//!
//! The tenant lifecycle: input validation, the external command wrapper, the
//! orchestrator state machine and the worker that drains queued jobs.

pub mod command;
pub mod orchestrator;
pub mod validator;
pub mod worker;

pub use command::{CommandError, CommandResult, CommandRunner, CommandSpec, ProcessRunner};
pub use orchestrator::{
    EnqueueOutcome, ProvisionOutcome, ProvisioningConfig, ProvisioningOrchestrator,
    TenantStatusView,
};
pub use validator::{NewTenant, ValidationError};
pub use worker::{ProvisionWorker, STALE_JOB_GRACE, WorkerConfig};

/// Who is asking for a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Anonymous public caller
    Public,
    /// Authenticated operator
    Operator,
    /// The service itself, e.g. auto-enqueue after create
    System,
}

impl Actor {
    /// Whether this actor may admit a tenant for provisioning.
    pub fn may_provision(self) -> bool {
        matches!(self, Actor::Operator | Actor::System)
    }
}
