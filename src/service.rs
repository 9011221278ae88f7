//! # Tenant Service
//!
//! Public facade over the provisioning core: create a tenant, admit it for
//! provisioning, read its status. HTTP handlers and the CLI both go through
//! this type.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::{self, CryptoKey};
use crate::error::{ProvisioningError, RepositoryError};
use crate::models::TenantStatus;
use crate::provisioning::validator::{self, NewTenant, ValidationError};
use crate::provisioning::{
    Actor, EnqueueOutcome, ProvisioningOrchestrator, TenantStatusView,
};
use crate::repositories::tenant::{NewTenantRecord, TenantStore};

/// Response of a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct CreatedTenant {
    pub tenant_id: Uuid,
    pub status: TenantStatus,
}

#[derive(Clone)]
pub struct TenantService {
    tenants: Arc<dyn TenantStore>,
    orchestrator: Arc<ProvisioningOrchestrator>,
    crypto_key: CryptoKey,
    auto_enqueue: bool,
    default_base_domain: String,
}

impl TenantService {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        orchestrator: Arc<ProvisioningOrchestrator>,
        crypto_key: CryptoKey,
    ) -> Self {
        Self {
            tenants,
            orchestrator,
            crypto_key,
            auto_enqueue: false,
            default_base_domain: validator::DEFAULT_BASE_DOMAIN.to_string(),
        }
    }

    /// Base domain used when a create request does not name one.
    pub fn with_default_base_domain(mut self, base_domain: impl Into<String>) -> Self {
        self.default_base_domain = base_domain.into();
        self
    }

    /// Admit every new tenant for provisioning as the system actor.
    pub fn with_auto_enqueue(mut self, enabled: bool) -> Self {
        self.auto_enqueue = enabled;
        self
    }

    pub fn orchestrator(&self) -> &Arc<ProvisioningOrchestrator> {
        &self.orchestrator
    }

    /// Validate and persist a new tenant in `Draft`.
    #[instrument(skip(self, input), fields(subdomain = %input.subdomain.trim()))]
    pub async fn create_tenant(
        &self,
        mut input: NewTenant,
    ) -> Result<CreatedTenant, ProvisioningError> {
        // Reject malformed input before touching the database.
        let subdomain = validator::validate_subdomain(&input.subdomain)?;
        let taken = self.tenants.exists_by_subdomain(&subdomain).await?;
        if input
            .base_domain
            .as_deref()
            .is_none_or(|domain| domain.trim().is_empty())
        {
            input.base_domain = Some(self.default_base_domain.clone());
        }
        let validated = validator::validate(input, |candidate| taken && candidate == subdomain)?;

        let tenant_id = Uuid::new_v4();
        let ciphertext =
            crypto::encrypt_admin_password(&self.crypto_key, tenant_id, &validated.admin_password)?;

        let record = NewTenantRecord {
            id: tenant_id,
            company_name: validated.company_name,
            email: validated.email,
            subdomain: validated.subdomain.clone(),
            admin_password_ciphertext: ciphertext,
            base_domain: validated
                .base_domain
                .unwrap_or_else(|| self.default_base_domain.clone()),
        };

        let tenant = match self.tenants.insert(record).await {
            Ok(tenant) => tenant,
            // Lost a race with a concurrent create on the unique index.
            Err(RepositoryError::Conflict(_)) => {
                return Err(ValidationError::DuplicateSubdomain(validated.subdomain).into());
            }
            Err(err) => return Err(err.into()),
        };

        info!(tenant_id = %tenant.id, "Tenant created");

        let status = if self.auto_enqueue {
            self.orchestrator.enqueue(Actor::System, tenant.id).await?.status
        } else {
            tenant.status
        };

        Ok(CreatedTenant {
            tenant_id: tenant.id,
            status,
        })
    }

    /// Admit a tenant for provisioning on behalf of `actor`.
    pub async fn enqueue_provision(
        &self,
        actor: Actor,
        tenant_id: Uuid,
    ) -> Result<EnqueueOutcome, ProvisioningError> {
        self.orchestrator.enqueue(actor, tenant_id).await
    }

    pub async fn tenant_status(&self, tenant_id: Uuid) -> Result<TenantStatusView, ProvisioningError> {
        self.orchestrator.status(tenant_id).await
    }
}
