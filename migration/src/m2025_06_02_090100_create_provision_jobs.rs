//! Migration to create the provision_jobs table.
//!
//! Rows are the durable queue between the request path and the provisioning
//! workers: one row per accepted `enqueue`, claimed by exactly one worker.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ProvisionJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProvisionJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ProvisionJobs::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(ProvisionJobs::Status)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(ProvisionJobs::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ProvisionJobs::Error).text().null())
                    .col(
                        ColumnDef::new(ProvisionJobs::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ProvisionJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ProvisionJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ProvisionJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ProvisionJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_provision_jobs_tenant_id")
                            .from(ProvisionJobs::Table, ProvisionJobs::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_provision_jobs_status_scheduled ON provision_jobs (status, scheduled_at)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_provision_jobs_tenant_id")
                    .table(ProvisionJobs::Table)
                    .col(ProvisionJobs::TenantId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_provision_jobs_status_scheduled")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_provision_jobs_tenant_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(ProvisionJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ProvisionJobs {
    Table,
    Id,
    TenantId,
    Status,
    Attempts,
    Error,
    ScheduledAt,
    StartedAt,
    FinishedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}
