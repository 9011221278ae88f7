//! # Data Models
//!
//! This module contains all the data models used throughout the provisioner.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod provision_job;
pub mod tenant;

pub use provision_job::Entity as ProvisionJob;
pub use provision_job::ProvisionJobStatus;
pub use tenant::Entity as Tenant;
pub use tenant::TenantStatus;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "tenant-provisioner".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
