//! Test utilities for database and provisioning tests.
//!
//! In-memory SQLite with migrations applied, a scripted [`CommandRunner`] and
//! helpers to wire the provisioning services the way the server does.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ColumnTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
};
use uuid::Uuid;
use tokio_util::sync::CancellationToken;

use provisioner::crypto::{CryptoKey, SecretString};
use provisioner::models::{provision_job, tenant};
use provisioner::provisioning::command::FailureReason;
use provisioner::provisioning::{
    CommandError, CommandResult, CommandRunner, CommandSpec, NewTenant, ProvisionWorker,
    ProvisioningConfig, ProvisioningOrchestrator, WorkerConfig,
};
use provisioner::repositories::{ProvisionJobRepository, TenantRepository};
use provisioner::service::TenantService;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub async fn tenant_count(db: &DatabaseConnection) -> Result<u64> {
    Ok(tenant::Entity::find().count(db).await?)
}

pub async fn find_job(db: &DatabaseConnection, job_id: Uuid) -> Result<provision_job::Model> {
    provision_job::Entity::find_by_id(job_id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow::anyhow!("provision job {} not found", job_id))
}

pub async fn jobs_for_tenant(
    db: &DatabaseConnection,
    tenant_id: Uuid,
) -> Result<Vec<provision_job::Model>> {
    Ok(provision_job::Entity::find()
        .filter(provision_job::Column::TenantId.eq(tenant_id))
        .all(db)
        .await?)
}

pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![42u8; 32]).expect("32-byte key")
}

pub fn test_provisioning_config() -> ProvisioningConfig {
    ProvisioningConfig {
        db_root_password: SecretString::from("root-pw"),
        ..Default::default()
    }
}

/// What the scripted toolchain does on its next invocation.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    NotFound,
    /// Block until the run is cancelled
    HangUntilCancelled,
    /// Panic inside the runner
    Panic,
}

/// [`CommandRunner`] that records every spec and answers from a script.
pub struct ScriptedRunner {
    script: Mutex<Script>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        let script = self.script.lock().unwrap().clone();
        let command = spec.render(&spec.program);

        match script {
            Script::Succeed => Ok(CommandResult {
                exit_code: 0,
                stdout: "Site created".to_string(),
                stderr: String::new(),
            }),
            Script::Exit {
                code,
                stdout,
                stderr,
            } => Err(CommandError::ToolchainExecutionFailed {
                command,
                exit_code: Some(code),
                stdout,
                stderr,
                reason: FailureReason::NonZeroExit(code),
            }),
            Script::NotFound => Err(CommandError::ToolchainNotFound {
                program: spec.program.clone(),
                searched: vec!["/opt/bench/bin".into()],
            }),
            Script::Panic => panic!("toolchain runner blew up"),
            Script::HangUntilCancelled => {
                cancel.cancelled().await;
                Err(CommandError::ToolchainExecutionFailed {
                    command,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    reason: FailureReason::Cancelled,
                })
            }
        }
    }
}

/// The provisioning services over one database.
pub struct Harness {
    pub db: DatabaseConnection,
    pub tenants: TenantRepository,
    pub jobs: ProvisionJobRepository,
    pub runner: Arc<ScriptedRunner>,
    pub orchestrator: Arc<ProvisioningOrchestrator>,
    pub service: TenantService,
}

impl Harness {
    pub async fn new(script: Script) -> Result<Self> {
        Self::with_config(script, test_provisioning_config()).await
    }

    pub async fn with_config(script: Script, config: ProvisioningConfig) -> Result<Self> {
        let db = setup_test_db().await?;
        let tenants = TenantRepository::new(db.clone());
        let jobs = ProvisionJobRepository::new(db.clone());
        let runner = Arc::new(ScriptedRunner::new(script));

        let orchestrator = Arc::new(ProvisioningOrchestrator::new(
            Arc::new(tenants.clone()),
            Arc::new(jobs.clone()),
            runner.clone(),
            test_crypto_key(),
            config,
        ));
        let service = TenantService::new(
            Arc::new(tenants.clone()),
            Arc::clone(&orchestrator),
            test_crypto_key(),
        );

        Ok(Self {
            db,
            tenants,
            jobs,
            runner,
            orchestrator,
            service,
        })
    }

    pub fn worker(&self) -> ProvisionWorker {
        ProvisionWorker::new(
            self.jobs.clone(),
            Arc::clone(&self.orchestrator),
            WorkerConfig {
                tick_ms: 100,
                concurrency: 4,
                ..WorkerConfig::default()
            },
        )
    }
}

pub fn new_tenant(company: &str, email: &str, subdomain: &str, password: &str) -> NewTenant {
    NewTenant {
        company_name: company.to_string(),
        email: email.to_string(),
        subdomain: subdomain.to_string(),
        admin_password: SecretString::from(password),
        base_domain: None,
    }
}

pub fn acme() -> NewTenant {
    new_tenant("Acme", "a@acme.com", "acme", "secret")
}
