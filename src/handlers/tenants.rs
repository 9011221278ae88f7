//! # Tenants API Handlers
//!
//! Public tenant creation and status, and operator-only provisioning admission.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::crypto::SecretString;
use crate::error::ApiError;
use crate::provisioning::{EnqueueOutcome, NewTenant, TenantStatusView};
use crate::server::AppState;
use crate::service::CreatedTenant;

/// Request payload for creating a new tenant
#[derive(Deserialize, ToSchema)]
pub struct CreateTenantRequest {
    /// Company display name (required, max 255 characters)
    #[schema(example = "Acme Corp")]
    pub company_name: String,
    /// Administrator contact email
    #[schema(example = "admin@acme.test")]
    pub email: String,
    /// Requested subdomain; lowercased before validation
    #[schema(example = "acme")]
    pub subdomain: String,
    /// Initial administrator password for the new site
    #[schema(example = "s3cret-Passw0rd", format = Password)]
    pub admin_password: String,
    /// Base domain appended to the subdomain; defaults to the configured one
    #[schema(example = "example.com")]
    pub base_domain: Option<String>,
}

impl std::fmt::Debug for CreateTenantRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateTenantRequest")
            .field("company_name", &self.company_name)
            .field("email", &self.email)
            .field("subdomain", &self.subdomain)
            .field("admin_password", &"[REDACTED]")
            .field("base_domain", &self.base_domain)
            .finish()
    }
}

impl From<CreateTenantRequest> for NewTenant {
    fn from(request: CreateTenantRequest) -> Self {
        NewTenant {
            company_name: request.company_name,
            email: request.email,
            subdomain: request.subdomain,
            admin_password: SecretString::from(request.admin_password),
            base_domain: request.base_domain,
        }
    }
}

/// Create a new tenant in `draft`
#[utoipa::path(
    post,
    path = "/api/v1/tenants",
    request_body = CreateTenantRequest,
    responses(
        (status = 201, description = "Tenant created", body = CreatedTenant, headers(
            ("X-Trace-Id", description = "Trace identifier for request correlation")
        )),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 409, description = "Subdomain already taken", body = ApiError),
        (status = 429, description = "Rate limit exceeded", body = ApiError, headers(
            ("Retry-After", description = "Seconds until the caller may retry")
        )),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn create_tenant(
    State(state): State<AppState>,
    payload: Result<Json<CreateTenantRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedTenant>), ApiError> {
    let Json(request) = payload?;

    let created = state.service.create_tenant(request.into()).await?;

    Ok((StatusCode::CREATED, Json(created)))
}

/// Read a tenant's lifecycle status
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{id}/status",
    params(
        ("id" = Uuid, Path, description = "Tenant identifier")
    ),
    responses(
        (status = 200, description = "Current tenant status", body = TenantStatusView),
        (status = 400, description = "Invalid tenant identifier", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn get_tenant_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TenantStatusView>, ApiError> {
    let tenant_id = parse_tenant_id(&id)?;
    let view = state.service.tenant_status(tenant_id).await?;
    Ok(Json(view))
}

/// Admit a tenant for provisioning
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/provision",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Tenant identifier")
    ),
    responses(
        (status = 202, description = "Provisioning queued", body = EnqueueOutcome),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError),
        (status = 409, description = "Tenant is not in an enqueueable status", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn enqueue_provision(
    State(state): State<AppState>,
    operator: OperatorAuth,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<EnqueueOutcome>), ApiError> {
    let tenant_id = parse_tenant_id(&id)?;
    let outcome = state
        .service
        .enqueue_provision(operator.actor(), tenant_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

fn parse_tenant_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        crate::error::validation_error(
            "Invalid tenant ID",
            serde_json::json!({ "id": "Must be a valid UUID" }),
        )
    })
}

