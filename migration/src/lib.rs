//! Database migrations for the tenant provisioner.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_06_02_090000_create_tenants;
mod m2025_06_02_090100_create_provision_jobs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_06_02_090000_create_tenants::Migration),
            Box::new(m2025_06_02_090100_create_provision_jobs::Migration),
        ]
    }
}
