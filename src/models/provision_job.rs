//! ProvisionJob entity model
//!
//! This module contains the SeaORM entity model for the provision_jobs table,
//! the durable queue between `enqueue` on the request path and the workers.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};

/// Status of a queued provisioning job
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum ProvisionJobStatus {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// ProvisionJob entity: one row per admitted provisioning attempt
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "provision_jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant the job provisions
    pub tenant_id: Uuid,

    /// Current job status
    pub status: ProvisionJobStatus,

    /// Number of times a worker claimed this job
    pub attempts: i32,

    /// Error text reported by the worker, if the run failed
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    /// Timestamp when the job becomes eligible to run
    pub scheduled_at: DateTimeWithTimeZone,

    /// Timestamp when a worker claimed the job
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job finished
    pub finished_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tenant::Entity",
        from = "Column::TenantId",
        to = "super::tenant::Column::Id"
    )]
    Tenant,
}

impl Related<super::tenant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
