//! # Tenant Repository
//!
//! This module contains the [`TenantStore`] contract consumed by the
//! provisioning core and its SeaORM implementation. Writes are single-field
//! updates so the request path and the worker path never overwrite each
//! other's columns; status changes made by the admission gate go through a
//! conditional update instead.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::models::tenant::{
    ActiveModel as TenantActiveModel, Column, Entity as Tenant, Model as TenantModel,
};
use crate::models::TenantStatus;

/// Data required to persist a new tenant in `Draft`.
#[derive(Debug, Clone)]
pub struct NewTenantRecord {
    pub id: Uuid,
    pub company_name: String,
    pub email: String,
    pub subdomain: String,
    pub admin_password_ciphertext: Vec<u8>,
    pub base_domain: String,
}

/// A single independently settable column of a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantField {
    Status(TenantStatus),
    SiteName(Option<String>),
    SiteUrl(Option<String>),
    LastError(Option<String>),
}

impl TenantField {
    fn name(&self) -> &'static str {
        match self {
            TenantField::Status(_) => "status",
            TenantField::SiteName(_) => "site_name",
            TenantField::SiteUrl(_) => "site_url",
            TenantField::LastError(_) => "last_error",
        }
    }
}

/// Persistence contract for tenant records.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<TenantModel>, RepositoryError>;

    /// Insert a new record in `Draft`. A subdomain collision is
    /// [`RepositoryError::Conflict`].
    async fn insert(&self, record: NewTenantRecord) -> Result<TenantModel, RepositoryError>;

    /// Atomically set one column. Missing records are [`RepositoryError::NotFound`].
    async fn update_field(&self, id: Uuid, field: TenantField) -> Result<(), RepositoryError>;

    async fn exists_by_subdomain(&self, subdomain: &str) -> Result<bool, RepositoryError>;

    /// Set `status = to` only if the current status is one of `from`.
    /// Returns whether the row was changed.
    async fn transition_status(
        &self,
        id: Uuid,
        from: &[TenantStatus],
        to: TenantStatus,
        clear_last_error: bool,
    ) -> Result<bool, RepositoryError>;
}

/// SeaORM-backed [`TenantStore`]
#[derive(Debug, Clone)]
pub struct TenantRepository {
    db: DatabaseConnection,
}

impl TenantRepository {
    /// Create a new TenantRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TenantStore for TenantRepository {
    async fn get(&self, id: Uuid) -> Result<Option<TenantModel>, RepositoryError> {
        Tenant::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(RepositoryError::database_error)
    }

    async fn insert(&self, record: NewTenantRecord) -> Result<TenantModel, RepositoryError> {
        let now = Utc::now().fixed_offset();

        let tenant = TenantActiveModel {
            id: Set(record.id),
            company_name: Set(record.company_name),
            email: Set(record.email),
            subdomain: Set(record.subdomain),
            admin_password_ciphertext: Set(record.admin_password_ciphertext),
            base_domain: Set(record.base_domain),
            status: Set(TenantStatus::Draft),
            site_name: Set(None),
            site_url: Set(None),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        tenant.insert(&self.db).await.map_err(|e| {
            let err = RepositoryError::database_error(e);
            if !matches!(err, RepositoryError::Conflict(_)) {
                tracing::error!(tenant_id = %record.id, error = %err, "Failed to insert tenant");
            }
            err
        })
    }

    async fn update_field(&self, id: Uuid, field: TenantField) -> Result<(), RepositoryError> {
        let field_name = field.name();
        let update = Tenant::update_many().col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()));

        let update = match field {
            TenantField::Status(status) => update.col_expr(Column::Status, Expr::value(status)),
            TenantField::SiteName(value) => update.col_expr(Column::SiteName, Expr::value(value)),
            TenantField::SiteUrl(value) => update.col_expr(Column::SiteUrl, Expr::value(value)),
            TenantField::LastError(value) => update.col_expr(Column::LastError, Expr::value(value)),
        };

        let result = update
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(|e| {
                tracing::error!(tenant_id = %id, field = field_name, "Failed to update tenant: {}", e);
                RepositoryError::database_error(e)
            })?;

        if result.rows_affected == 0 {
            return Err(RepositoryError::NotFound(format!("Tenant {} not found", id)));
        }

        Ok(())
    }

    async fn exists_by_subdomain(&self, subdomain: &str) -> Result<bool, RepositoryError> {
        let count = Tenant::find()
            .filter(Column::Subdomain.eq(subdomain))
            .count(&self.db)
            .await
            .map_err(RepositoryError::database_error)?;

        Ok(count > 0)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: &[TenantStatus],
        to: TenantStatus,
        clear_last_error: bool,
    ) -> Result<bool, RepositoryError> {
        let mut update = Tenant::update_many()
            .col_expr(Column::Status, Expr::value(to))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()));

        if clear_last_error {
            update = update.col_expr(Column::LastError, Expr::value(Option::<String>::None));
        }

        let result = update
            .filter(Column::Id.eq(id))
            .filter(Column::Status.is_in(from.iter().copied()))
            .exec(&self.db)
            .await
            .map_err(|e| {
                tracing::error!(tenant_id = %id, to = %to, "Failed to transition tenant: {}", e);
                RepositoryError::database_error(e)
            })?;

        Ok(result.rows_affected == 1)
    }
}
