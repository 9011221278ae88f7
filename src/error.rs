//! # Error Handling
//!
//! This module provides unified error handling for the provisioner: the
//! problem+json [`ApiError`] returned over HTTP with trace ID propagation, the
//! [`RepositoryError`] produced by the persistence layer, and the
//! [`ProvisioningError`] taxonomy of the provisioning core.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::provisioning::command::CommandError;
use crate::provisioning::validator::ValidationError;
use crate::telemetry;

/// Upper bound, in characters, for any diagnostic persisted as `last_error`.
pub const LAST_ERROR_MAX_CHARS: usize = 14_000;

/// Truncate `message` to at most `max_chars` characters without splitting a
/// UTF-8 sequence.
pub fn truncate_chars(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Extract current trace ID from the request context (falls back to a generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

/// Whether a database error is a unique-constraint violation on any supported backend.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code_str = code.as_ref();
        code_str == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code_str)
    })
}

/// Standard error types with predefined status codes
#[derive(Debug, Error)]
pub enum ErrorType {
    #[error("Conflict")]
    Conflict,
    #[error("Internal Server Error")]
    InternalServerError,
}

impl ErrorType {
    /// Get the appropriate HTTP status code for this error type
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::Conflict => StatusCode::CONFLICT,
            ErrorType::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string for this error type (SCREAMING_SNAKE_CASE)
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorType::Conflict => "CONFLICT",
            ErrorType::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ErrorType> for ApiError {
    fn from(error_type: ErrorType) -> Self {
        Self::new(
            error_type.status_code(),
            error_type.error_code(),
            &error_type.to_string(),
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            _ => {
                tracing::error!("Database error: {:?}", error);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Errors surfaced by the repository layer.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("{0}")]
    NotFound(String),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("secret handling failed: {0}")]
    Crypto(#[from] CryptoError),
}

impl RepositoryError {
    /// Classify a SeaORM error, separating unique violations from other failures.
    pub fn database_error(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            RepositoryError::Conflict(error.to_string())
        } else {
            RepositoryError::Database(error)
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(db_err) => db_err.into(),
            RepositoryError::NotFound(message) => {
                ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", &message)
            }
            RepositoryError::Conflict(_) => ErrorType::Conflict.into(),
            RepositoryError::Crypto(err) => {
                tracing::error!(error = %err, "Secret handling failed");
                ErrorType::InternalServerError.into()
            }
        }
    }
}

/// Failure kinds of the provisioning core.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// Input or state precondition rejected at admission time.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The caller lacks the privilege the operation requires.
    #[error("operator privilege is required to {action}")]
    Forbidden { action: &'static str },
    #[error("tenant {0} not found")]
    TenantNotFound(Uuid),
    /// The external toolchain could not be located or did not succeed.
    #[error(transparent)]
    Toolchain(#[from] CommandError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    /// Anything else that went wrong while running an attempt.
    #[error("unexpected provisioning failure: {0}")]
    Unexpected(String),
}

impl ProvisioningError {
    /// Diagnostic text persisted into `last_error`, bounded to [`LAST_ERROR_MAX_CHARS`].
    pub fn last_error_text(&self) -> String {
        let text = match self {
            ProvisioningError::Toolchain(command_err) => command_err.diagnostic(),
            other => other.to_string(),
        };
        truncate_chars(&text, LAST_ERROR_MAX_CHARS)
    }

    /// Short machine-readable label, used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisioningError::Validation(ValidationError::InvalidSubdomain { .. }) => {
                "invalid_subdomain"
            }
            ProvisioningError::Validation(ValidationError::DuplicateSubdomain(_)) => {
                "duplicate_subdomain"
            }
            ProvisioningError::Validation(ValidationError::InvalidStateTransition { .. }) => {
                "invalid_state_transition"
            }
            ProvisioningError::Validation(ValidationError::InvalidField { .. }) => "invalid_field",
            ProvisioningError::Forbidden { .. } => "forbidden",
            ProvisioningError::TenantNotFound(_) => "tenant_not_found",
            ProvisioningError::Toolchain(CommandError::ToolchainNotFound { .. }) => {
                "toolchain_not_found"
            }
            ProvisioningError::Toolchain(_) => "toolchain_execution_failed",
            ProvisioningError::Repository(_) => "repository",
            ProvisioningError::Unexpected(_) => "unexpected",
        }
    }
}

impl From<CryptoError> for ProvisioningError {
    fn from(error: CryptoError) -> Self {
        ProvisioningError::Repository(RepositoryError::Crypto(error))
    }
}

impl From<ProvisioningError> for ApiError {
    fn from(error: ProvisioningError) -> Self {
        match error {
            ProvisioningError::Validation(ValidationError::InvalidSubdomain {
                subdomain,
                reason,
            }) => validation_error(
                "Invalid subdomain",
                json!({ "subdomain": subdomain, "reason": reason }),
            )
            .with_code("INVALID_SUBDOMAIN"),
            ProvisioningError::Validation(ValidationError::DuplicateSubdomain(subdomain)) => {
                ApiError::new(
                    StatusCode::CONFLICT,
                    "DUPLICATE_SUBDOMAIN",
                    "Subdomain already taken",
                )
                .with_details(json!({ "subdomain": subdomain }))
            }
            ProvisioningError::Validation(ValidationError::InvalidStateTransition {
                current,
                action,
            }) => ApiError::new(
                StatusCode::CONFLICT,
                "INVALID_STATE_TRANSITION",
                &format!("Cannot {} tenant in status {}", action, current),
            )
            .with_details(json!({ "current_status": current })),
            ProvisioningError::Validation(ValidationError::InvalidField { field, reason }) => {
                validation_error(
                    "Validation failed",
                    json!({ "field": field, "reason": reason }),
                )
            }
            ProvisioningError::Forbidden { action } => {
                forbidden(Some(
                    format!("Operator privilege is required to {}", action).as_str(),
                ))
            }
            ProvisioningError::TenantNotFound(tenant_id) => ApiError::new(
                StatusCode::NOT_FOUND,
                "TENANT_NOT_FOUND",
                "Tenant not found",
            )
            .with_details(json!({ "tenant_id": tenant_id.to_string() })),
            ProvisioningError::Repository(repo_err) => repo_err.into(),
            other => {
                tracing::error!(kind = other.kind(), error = %other, "Provisioning error");
                ErrorType::InternalServerError.into()
            }
        }
    }
}

impl ApiError {
    /// Replace the error code while keeping status, message and details.
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = code.to_string().into_boxed_str();
        self
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create an unauthorized error (401) with explicit trace_id
pub fn unauthorized_with_trace_id(message: Option<&str>, trace_id: String) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    let mut error = ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg);
    error.trace_id = Some(trace_id.into_boxed_str());
    error
}

/// Create a forbidden error (403)
pub fn forbidden(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Insufficient permissions");
    ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN", msg)
}

/// Create a rate limited error (429) carrying a Retry-After hint
pub fn rate_limited(retry_after_secs: u64) -> ApiError {
    ApiError::new(
        StatusCode::TOO_MANY_REQUESTS,
        "RATE_LIMITED",
        "Rate limit exceeded",
    )
    .with_retry_after(retry_after_secs)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}
