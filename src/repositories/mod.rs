//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for tenants
//! and provision jobs.

pub mod provision_job;
pub mod tenant;

pub use provision_job::{JobQueue, ProvisionJobRepository, ProvisionJobRequest};
pub use tenant::{NewTenantRecord, TenantField, TenantRepository, TenantStore};
