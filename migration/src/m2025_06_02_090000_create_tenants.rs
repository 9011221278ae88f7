//! Migration to create the tenants table.
//!
//! Each row is one provisioning request: the requested subdomain, the
//! encrypted admin password, the lifecycle status and the derived site fields.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tenants::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Tenants::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Tenants::CompanyName).text().not_null())
                    .col(ColumnDef::new(Tenants::Email).text().not_null())
                    .col(ColumnDef::new(Tenants::Subdomain).text().not_null())
                    .col(
                        ColumnDef::new(Tenants::AdminPasswordCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Tenants::BaseDomain)
                            .text()
                            .not_null()
                            .default("local"),
                    )
                    .col(
                        ColumnDef::new(Tenants::Status)
                            .text()
                            .not_null()
                            .default("draft"),
                    )
                    .col(ColumnDef::new(Tenants::SiteName).text().null())
                    .col(ColumnDef::new(Tenants::SiteUrl).text().null())
                    .col(ColumnDef::new(Tenants::LastError).text().null())
                    .col(
                        ColumnDef::new(Tenants::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Tenants::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Subdomain uniqueness is the final arbiter for concurrent creates
        manager
            .create_index(
                Index::create()
                    .name("idx_tenants_subdomain_unique")
                    .table(Tenants::Table)
                    .col(Tenants::Subdomain)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tenants_status")
                    .table(Tenants::Table)
                    .col(Tenants::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_tenants_status").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_tenants_subdomain_unique").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Tenants::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
    CompanyName,
    Email,
    Subdomain,
    AdminPasswordCiphertext,
    BaseDomain,
    Status,
    SiteName,
    SiteUrl,
    LastError,
    CreatedAt,
    UpdatedAt,
}
