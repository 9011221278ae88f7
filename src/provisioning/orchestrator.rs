//! Provisioning state machine
//!
//! `enqueue` is the admission gate: it moves a tenant from `Draft` or
//! `Failed` to `Queued` with a conditional update and submits exactly one job.
//! `run` is the worker-side entrypoint that drives the toolchain and records
//! the outcome. Every execution-time failure is persisted as `Failed` with a
//! bounded `last_error` before it is returned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::{self, CryptoKey, SecretString};
use crate::error::ProvisioningError;
use crate::models::TenantStatus;
use crate::models::tenant::Model as TenantModel;
use crate::provisioning::Actor;
use crate::provisioning::command::{CommandRunner, CommandSpec};
use crate::provisioning::validator::{self, ValidationError};
use crate::repositories::provision_job::{JobQueue, ProvisionJobRequest};
use crate::repositories::tenant::{TenantField, TenantStore};

/// Toolchain settings resolved from configuration at construction time.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Toolchain executable name or path
    pub toolchain_bin: String,
    /// Working directory for toolchain invocations
    pub toolchain_home: Option<PathBuf>,
    pub db_root_username: String,
    pub db_root_password: SecretString,
    /// One `--install-app` flag is emitted per entry, in order
    pub install_apps: Vec<String>,
    /// Scheme used to build `site_url`
    pub site_scheme: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            toolchain_bin: "bench".to_string(),
            toolchain_home: None,
            db_root_username: "root".to_string(),
            db_root_password: SecretString::from(""),
            install_apps: vec!["erpnext".to_string()],
            site_scheme: "https".to_string(),
        }
    }
}

/// Result of a successful admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct EnqueueOutcome {
    pub tenant_id: Uuid,
    pub status: TenantStatus,
    pub job_id: Uuid,
}

/// Result of a successful provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ProvisionOutcome {
    pub site_name: String,
    pub site_url: String,
}

/// Read-only projection of a tenant. Never carries the admin password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct TenantStatusView {
    pub tenant_id: Uuid,
    pub status: TenantStatus,
    pub site_url: Option<String>,
    pub site_name: Option<String>,
    pub last_error: Option<String>,
}

impl From<TenantModel> for TenantStatusView {
    fn from(tenant: TenantModel) -> Self {
        Self {
            tenant_id: tenant.id,
            status: tenant.status,
            site_url: tenant.site_url,
            site_name: tenant.site_name,
            last_error: tenant.last_error,
        }
    }
}

/// Owns the tenant lifecycle.
#[derive(Clone)]
pub struct ProvisioningOrchestrator {
    tenants: Arc<dyn TenantStore>,
    jobs: Arc<dyn JobQueue>,
    runner: Arc<dyn CommandRunner>,
    crypto_key: CryptoKey,
    config: ProvisioningConfig,
}

impl ProvisioningOrchestrator {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        jobs: Arc<dyn JobQueue>,
        runner: Arc<dyn CommandRunner>,
        crypto_key: CryptoKey,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            tenants,
            jobs,
            runner,
            crypto_key,
            config,
        }
    }

    async fn load(&self, tenant_id: Uuid) -> Result<TenantModel, ProvisioningError> {
        self.tenants
            .get(tenant_id)
            .await?
            .ok_or(ProvisioningError::TenantNotFound(tenant_id))
    }

    /// Current status after a lost conditional update, as a transition error.
    async fn rejected_transition(
        &self,
        tenant_id: Uuid,
        action: &'static str,
    ) -> ProvisioningError {
        match self.load(tenant_id).await {
            Ok(tenant) => ValidationError::InvalidStateTransition {
                current: tenant.status,
                action,
            }
            .into(),
            Err(err) => err,
        }
    }

    /// Admit a tenant for provisioning.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn enqueue(
        &self,
        actor: Actor,
        tenant_id: Uuid,
    ) -> Result<EnqueueOutcome, ProvisioningError> {
        const ACTION: &str = "enqueue";

        if !actor.may_provision() {
            return Err(ProvisioningError::Forbidden {
                action: "enqueue provisioning",
            });
        }

        let tenant = self.load(tenant_id).await?;
        validator::ensure_can_transition(tenant.status, TenantStatus::Queued, ACTION)?;

        let admitted = self
            .tenants
            .transition_status(
                tenant_id,
                &TenantStatus::ENQUEUEABLE,
                TenantStatus::Queued,
                true,
            )
            .await?;

        if !admitted {
            return Err(self.rejected_transition(tenant_id, ACTION).await);
        }

        let job_id = match self.jobs.submit(ProvisionJobRequest { tenant_id }).await {
            Ok(job_id) => job_id,
            Err(err) => {
                error!(error = %err, "Failed to submit provision job, reverting admission");
                if let Err(revert_err) = self
                    .tenants
                    .transition_status(tenant_id, &[TenantStatus::Queued], tenant.status, false)
                    .await
                {
                    error!(error = %revert_err, "Failed to revert tenant status");
                }
                return Err(err.into());
            }
        };

        info!(job_id = %job_id, from = %tenant.status, actor = ?actor, "Tenant queued for provisioning");

        Ok(EnqueueOutcome {
            tenant_id,
            status: TenantStatus::Queued,
            job_id,
        })
    }

    /// Provision the tenant's site. Called by the worker for a claimed job.
    #[instrument(skip(self, cancel), fields(tenant_id = %tenant_id))]
    pub async fn run(
        &self,
        tenant_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        const ACTION: &str = "run";
        let started = Instant::now();

        let tenant = self.load(tenant_id).await?;
        validator::ensure_can_transition(tenant.status, TenantStatus::Provisioning, ACTION)?;

        let site_name = validator::site_name(&tenant.subdomain, &tenant.base_domain);

        let claimed = self
            .tenants
            .transition_status(
                tenant_id,
                &TenantStatus::RUNNABLE,
                TenantStatus::Provisioning,
                false,
            )
            .await?;

        if !claimed {
            return Err(self.rejected_transition(tenant_id, ACTION).await);
        }

        if tenant.status == TenantStatus::Provisioning {
            warn!("Resuming interrupted provisioning attempt");
        }

        let result = self.provision(&tenant, &site_name, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as f64;
        histogram!("provisioning_run_duration_ms").record(elapsed_ms);

        match result {
            Ok(outcome) => {
                counter!("provisioning_runs_total", "outcome" => "active").increment(1);
                info!(site_name = %outcome.site_name, elapsed_ms, "Tenant provisioned");
                Ok(outcome)
            }
            Err(err) => {
                counter!("provisioning_runs_total", "outcome" => "failed").increment(1);
                self.record_failure(tenant_id, &err).await;
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        tenant: &TenantModel,
        site_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        self.tenants
            .update_field(tenant.id, TenantField::SiteName(Some(site_name.to_string())))
            .await?;

        let admin_password = crypto::decrypt_admin_password(
            &self.crypto_key,
            tenant.id,
            &tenant.admin_password_ciphertext,
        )?;

        let spec = self.build_command(site_name, admin_password);
        let result = self.runner.run(&spec, cancel).await?;
        info!(
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "Toolchain finished"
        );

        let site_url = format!("{}://{}", self.config.site_scheme, site_name);

        self.tenants
            .update_field(tenant.id, TenantField::SiteUrl(Some(site_url.clone())))
            .await?;
        self.tenants
            .update_field(tenant.id, TenantField::SiteName(Some(site_name.to_string())))
            .await?;
        self.tenants
            .update_field(tenant.id, TenantField::Status(TenantStatus::Active))
            .await?;

        Ok(ProvisionOutcome {
            site_name: site_name.to_string(),
            site_url,
        })
    }

    /// Force a tenant whose attempt died outside the normal error path to
    /// `Failed`, and return the error to report.
    pub async fn fail_unexpected(&self, tenant_id: Uuid, message: String) -> ProvisioningError {
        let err = ProvisioningError::Unexpected(message);
        counter!("provisioning_runs_total", "outcome" => "failed").increment(1);
        self.record_failure(tenant_id, &err).await;
        err
    }

    /// Make a failed attempt durable: `last_error` first, then `Failed`.
    async fn record_failure(&self, tenant_id: Uuid, err: &ProvisioningError) {
        error!(kind = err.kind(), error = %err, "Provisioning attempt failed");

        let last_error = err.last_error_text();
        if let Err(update_err) = self
            .tenants
            .update_field(tenant_id, TenantField::LastError(Some(last_error)))
            .await
        {
            error!(error = %update_err, "Failed to persist last_error");
        }

        if let Err(update_err) = self
            .tenants
            .update_field(tenant_id, TenantField::Status(TenantStatus::Failed))
            .await
        {
            error!(error = %update_err, "Failed to mark tenant as failed");
        }
    }

    /// Toolchain argv for creating `site_name`.
    pub fn build_command(&self, site_name: &str, admin_password: SecretString) -> CommandSpec {
        let mut spec = CommandSpec::new(self.config.toolchain_bin.clone())
            .arg("new-site")
            .arg("--mariadb-user-host-login-scope=%")
            .secret_arg("--admin-password=", admin_password)
            .arg(format!("--db-root-username={}", self.config.db_root_username))
            .secret_arg("--db-root-password=", self.config.db_root_password.clone());

        for app in &self.config.install_apps {
            spec = spec.arg("--install-app").arg(app.clone());
        }

        spec = spec.arg(site_name).prepend_program_dir_to_path();

        if let Some(home) = &self.config.toolchain_home {
            spec = spec.current_dir(home.clone());
        }

        spec
    }

    /// Read-only status projection.
    pub async fn status(&self, tenant_id: Uuid) -> Result<TenantStatusView, ProvisioningError> {
        Ok(self.load(tenant_id).await?.into())
    }
}
