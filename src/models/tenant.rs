//! Tenant entity model
//!
//! This module contains the SeaORM entity model for the tenants table,
//! which stores one provisioning request per row together with its lifecycle
//! status and the derived site fields.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle status of a tenant record.
///
/// Stored as a lowercase string; serialized over the API in PascalCase.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum TenantStatus {
    #[sea_orm(string_value = "draft")]
    Draft,
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "provisioning")]
    Provisioning,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl TenantStatus {
    /// Statuses from which a provisioning attempt may be admitted.
    pub const ENQUEUEABLE: [TenantStatus; 2] = [TenantStatus::Draft, TenantStatus::Failed];

    /// Statuses from which a worker may start (or resume) an attempt.
    pub const RUNNABLE: [TenantStatus; 2] = [TenantStatus::Queued, TenantStatus::Provisioning];

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `Provisioning -> Provisioning` is accepted so that a worker can resume
    /// an attempt that was interrupted before it reached a terminal state.
    pub fn can_transition_to(self, next: TenantStatus) -> bool {
        use TenantStatus::*;

        matches!(
            (self, next),
            (Draft, Queued)
                | (Failed, Queued)
                | (Queued, Provisioning)
                | (Provisioning, Provisioning)
                | (Provisioning, Active)
                | (Provisioning, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Draft => "Draft",
            TenantStatus::Queued => "Queued",
            TenantStatus::Provisioning => "Provisioning",
            TenantStatus::Active => "Active",
            TenantStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant entity representing one provisioning request
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    /// Unique identifier for the tenant (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Company the tenant is provisioned for
    pub company_name: String,

    /// Contact email for the tenant
    pub email: String,

    /// Normalized subdomain (unique)
    #[sea_orm(unique)]
    pub subdomain: String,

    /// AES-256-GCM ciphertext of the site admin password
    pub admin_password_ciphertext: Vec<u8>,

    /// Base domain the site name is built under
    pub base_domain: String,

    /// Current lifecycle status
    pub status: TenantStatus,

    /// `{subdomain}.{base_domain}`, set once provisioning begins
    pub site_name: Option<String>,

    /// Public URL of the provisioned site
    pub site_url: Option<String>,

    /// Diagnostic from the last failed attempt
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Timestamp when the tenant was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the tenant was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::provision_job::Entity")]
    ProvisionJob,
}

impl Related<super::provision_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProvisionJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_edges_match_lifecycle() {
        use TenantStatus::*;

        assert!(Draft.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Active));
        assert!(Provisioning.can_transition_to(Failed));
    }

    #[test]
    fn forbidden_edges_are_rejected() {
        use TenantStatus::*;

        assert!(!Draft.can_transition_to(Failed));
        assert!(!Draft.can_transition_to(Active));
        assert!(!Queued.can_transition_to(Queued));
        assert!(!Active.can_transition_to(Queued));
        assert!(!Active.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Provisioning));
    }

    #[test]
    fn status_serializes_in_pascal_case() {
        let json = serde_json::to_string(&TenantStatus::Provisioning).unwrap();
        assert_eq!(json, "\"Provisioning\"");
        assert_eq!(TenantStatus::Failed.to_string(), "Failed");
    }
}
