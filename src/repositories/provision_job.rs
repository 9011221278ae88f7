//! # ProvisionJob Repository
//!
//! This module provides the [`JobQueue`] contract used by `enqueue` and the
//! SeaORM-backed queue the provisioning workers drain.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::error::{LAST_ERROR_MAX_CHARS, RepositoryError, truncate_chars};
use crate::models::provision_job::{ActiveModel, Column, Entity, Model};
use crate::models::ProvisionJobStatus;

/// Typed payload of a provisioning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionJobRequest {
    pub tenant_id: Uuid,
}

/// Submission side of the background job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a job for later execution and return its id.
    async fn submit(&self, job: ProvisionJobRequest) -> Result<Uuid, RepositoryError>;
}

/// Repository for provision job database operations
#[derive(Debug, Clone)]
pub struct ProvisionJobRepository {
    db: DatabaseConnection,
}

impl ProvisionJobRepository {
    /// Create a new ProvisionJobRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Claim up to `limit` due jobs, moving them from `queued` to `running`.
    ///
    /// The update re-checks `status = 'queued'`, so two workers racing on the
    /// same rows claim each job once.
    pub async fn claim_due(&self, limit: u64) -> Result<Vec<Model>, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let txn = self
            .db
            .begin()
            .await
            .map_err(RepositoryError::database_error)?;

        let eligible: Vec<Uuid> = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq(ProvisionJobStatus::Queued))
            .filter(Column::ScheduledAt.lte(now))
            .order_by_asc(Column::ScheduledAt)
            .limit(limit)
            .into_tuple::<Uuid>()
            .all(&txn)
            .await
            .map_err(RepositoryError::database_error)?;

        if eligible.is_empty() {
            txn.commit().await.map_err(RepositoryError::database_error)?;
            return Ok(Vec::new());
        }

        let mut claimed = Vec::with_capacity(eligible.len());
        for job_id in eligible {
            let result = Entity::update_many()
                .col_expr(Column::Status, Expr::value(ProvisionJobStatus::Running))
                .col_expr(Column::StartedAt, Expr::value(now))
                .col_expr(Column::UpdatedAt, Expr::value(now))
                .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
                .filter(Column::Id.eq(job_id))
                .filter(Column::Status.eq(ProvisionJobStatus::Queued))
                .exec(&txn)
                .await
                .map_err(RepositoryError::database_error)?;

            if result.rows_affected == 1 {
                claimed.push(job_id);
            }
        }

        let jobs = Entity::find()
            .filter(Column::Id.is_in(claimed))
            .order_by_asc(Column::ScheduledAt)
            .all(&txn)
            .await
            .map_err(RepositoryError::database_error)?;

        txn.commit().await.map_err(RepositoryError::database_error)?;
        Ok(jobs)
    }

    pub async fn mark_succeeded(&self, job_id: Uuid) -> Result<(), RepositoryError> {
        self.finish(job_id, ProvisionJobStatus::Succeeded, None).await
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<(), RepositoryError> {
        let error = truncate_chars(error, LAST_ERROR_MAX_CHARS);
        self.finish(job_id, ProvisionJobStatus::Failed, Some(error))
            .await
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: ProvisionJobStatus,
        error: Option<String>,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::Error, Expr::value(error))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .exec(&self.db)
            .await
            .map_err(|e| {
                tracing::error!(job_id = %job_id, "Failed to finish provision job: {}", e);
                RepositoryError::database_error(e)
            })?;

        if result.rows_affected == 0 {
            return Err(RepositoryError::NotFound(format!(
                "Provision job {} not found",
                job_id
            )));
        }

        Ok(())
    }

    /// Put jobs left `running` since before `started_before` back in the queue.
    ///
    /// Jobs started after the cutoff may still belong to a live worker and are
    /// left alone. Tenants of requeued jobs stay in `Provisioning` and are
    /// resumed by the next run.
    pub async fn requeue_interrupted(
        &self,
        started_before: DateTime<FixedOffset>,
    ) -> Result<u64, RepositoryError> {
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(ProvisionJobStatus::Queued))
            .col_expr(Column::ScheduledAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Status.eq(ProvisionJobStatus::Running))
            .filter(Column::StartedAt.lt(started_before))
            .exec(&self.db)
            .await
            .map_err(RepositoryError::database_error)?;

        Ok(result.rows_affected)
    }
}

#[async_trait]
impl JobQueue for ProvisionJobRepository {
    async fn submit(&self, job: ProvisionJobRequest) -> Result<Uuid, RepositoryError> {
        let now = Utc::now().fixed_offset();

        let model = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(job.tenant_id),
            status: Set(ProvisionJobStatus::Queued),
            attempts: Set(0),
            error: Set(None),
            scheduled_at: Set(now),
            started_at: Set(None),
            finished_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = model.insert(&self.db).await.map_err(|e| {
            tracing::error!(tenant_id = %job.tenant_id, "Failed to create provision job: {}", e);
            RepositoryError::database_error(e)
        })?;

        tracing::info!(
            tenant_id = %job.tenant_id,
            job_id = %inserted.id,
            "Provision job enqueued"
        );

        Ok(inserted.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::tenant::{NewTenantRecord, TenantRepository, TenantStore};
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn setup() -> (ProvisionJobRepository, Uuid) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        let tenant = TenantRepository::new(db.clone())
            .insert(NewTenantRecord {
                id: Uuid::new_v4(),
                company_name: "Acme".to_string(),
                email: "a@acme.com".to_string(),
                subdomain: "acme".to_string(),
                admin_password_ciphertext: vec![0],
                base_domain: "local".to_string(),
            })
            .await
            .unwrap();

        (ProvisionJobRepository::new(db), tenant.id)
    }

    #[tokio::test]
    async fn submitted_job_is_claimed_once() {
        let (repo, tenant_id) = setup().await;
        let job_id = repo.submit(ProvisionJobRequest { tenant_id }).await.unwrap();

        let claimed = repo.claim_due(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job_id);
        assert_eq!(claimed[0].status, ProvisionJobStatus::Running);
        assert_eq!(claimed[0].attempts, 1);
        assert!(claimed[0].started_at.is_some());

        assert!(repo.claim_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finished_jobs_record_outcome() {
        let (repo, tenant_id) = setup().await;
        let ok = repo.submit(ProvisionJobRequest { tenant_id }).await.unwrap();
        let bad = repo.submit(ProvisionJobRequest { tenant_id }).await.unwrap();
        repo.claim_due(10).await.unwrap();

        repo.mark_succeeded(ok).await.unwrap();
        repo.mark_failed(bad, &"e".repeat(20_000)).await.unwrap();

        let ok = Entity::find_by_id(ok).one(&repo.db).await.unwrap().unwrap();
        assert_eq!(ok.status, ProvisionJobStatus::Succeeded);
        assert!(ok.finished_at.is_some());

        let bad = Entity::find_by_id(bad).one(&repo.db).await.unwrap().unwrap();
        assert_eq!(bad.status, ProvisionJobStatus::Failed);
        assert_eq!(bad.error.unwrap().chars().count(), LAST_ERROR_MAX_CHARS);
    }

    #[tokio::test]
    async fn only_jobs_started_before_cutoff_are_requeued() {
        let (repo, tenant_id) = setup().await;
        repo.submit(ProvisionJobRequest { tenant_id }).await.unwrap();
        repo.claim_due(10).await.unwrap();

        let an_hour_ago = (Utc::now() - chrono::Duration::hours(1)).fixed_offset();
        assert_eq!(repo.requeue_interrupted(an_hour_ago).await.unwrap(), 0);
        assert!(repo.claim_due(10).await.unwrap().is_empty());

        let later = (Utc::now() + chrono::Duration::seconds(1)).fixed_offset();
        assert_eq!(repo.requeue_interrupted(later).await.unwrap(), 1);

        let reclaimed = repo.claim_due(10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts, 2);
    }
}
