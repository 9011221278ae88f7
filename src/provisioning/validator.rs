//! Input and state-precondition validation for tenant records.
//!
//! Everything here is a pure function of its arguments. Uniqueness is checked
//! against a caller-supplied predicate so the same rules apply whether the
//! taken set comes from the database or from a test fixture.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::crypto::SecretString;
use crate::models::TenantStatus;

/// Base domain used when a tenant does not supply one.
pub const DEFAULT_BASE_DOMAIN: &str = "local";

const SUBDOMAIN_PATTERN: &str = r"^[a-z0-9]([a-z0-9-]{1,61}[a-z0-9])?$";
/// One DNS label of a base domain
const DOMAIN_LABEL_PATTERN: &str = r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$";
const MIN_SUBDOMAIN_LEN: usize = 3;
const MAX_FIELD_LEN: usize = 255;
const MAX_BASE_DOMAIN_LEN: usize = 253;

fn subdomain_regex() -> &'static Regex {
    static SUBDOMAIN_RE: OnceLock<Regex> = OnceLock::new();
    SUBDOMAIN_RE.get_or_init(|| Regex::new(SUBDOMAIN_PATTERN).expect("subdomain pattern compiles"))
}

fn domain_label_regex() -> &'static Regex {
    static LABEL_RE: OnceLock<Regex> = OnceLock::new();
    LABEL_RE.get_or_init(|| Regex::new(DOMAIN_LABEL_PATTERN).expect("label pattern compiles"))
}

/// Validation failures raised before any state is mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid subdomain '{subdomain}': {reason}")]
    InvalidSubdomain {
        subdomain: String,
        reason: &'static str,
    },
    #[error("subdomain '{0}' is already taken")]
    DuplicateSubdomain(String),
    #[error("cannot {action} tenant in status {current}")]
    InvalidStateTransition {
        current: TenantStatus,
        action: &'static str,
    },
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// A tenant creation request before it is persisted.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub company_name: String,
    pub email: String,
    pub subdomain: String,
    pub admin_password: SecretString,
    pub base_domain: Option<String>,
}

/// Trim and lowercase a subdomain.
pub fn normalize_subdomain(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Trim and lowercase a base domain, falling back to [`DEFAULT_BASE_DOMAIN`].
pub fn normalize_base_domain(raw: Option<&str>) -> String {
    raw.map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_DOMAIN.to_string())
}

/// Normalize a base domain and check it is a dot-separated hostname.
///
/// The result is interpolated into the toolchain's site argument, so every
/// label must be a plain DNS label.
pub fn validate_base_domain(raw: Option<&str>) -> Result<String, ValidationError> {
    let base_domain = normalize_base_domain(raw);

    if base_domain.len() > MAX_BASE_DOMAIN_LEN {
        return Err(ValidationError::InvalidField {
            field: "base_domain",
            reason: "must be at most 253 characters",
        });
    }

    if !base_domain
        .split('.')
        .all(|label| domain_label_regex().is_match(label))
    {
        return Err(ValidationError::InvalidField {
            field: "base_domain",
            reason: "must be a hostname of dot-separated lowercase labels",
        });
    }

    Ok(base_domain)
}

/// Normalize `raw` and check it against the subdomain grammar.
pub fn validate_subdomain(raw: &str) -> Result<String, ValidationError> {
    let subdomain = normalize_subdomain(raw);

    if subdomain.is_empty() {
        return Err(ValidationError::InvalidSubdomain {
            subdomain,
            reason: "must not be empty",
        });
    }

    if subdomain.len() < MIN_SUBDOMAIN_LEN {
        return Err(ValidationError::InvalidSubdomain {
            subdomain,
            reason: "must be at least 3 characters long",
        });
    }

    if !subdomain_regex().is_match(&subdomain) {
        return Err(ValidationError::InvalidSubdomain {
            subdomain,
            reason: "use lowercase letters, digits and inner hyphens only",
        });
    }

    Ok(subdomain)
}

fn validate_text_field(
    field: &'static str,
    value: &str,
) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidField {
            field,
            reason: "must not be empty",
        });
    }
    if trimmed.chars().count() > MAX_FIELD_LEN {
        return Err(ValidationError::InvalidField {
            field,
            reason: "must be at most 255 characters",
        });
    }
    Ok(trimmed.to_string())
}

/// Normalize and validate a creation request.
///
/// `is_taken` answers whether a normalized subdomain already belongs to
/// another record.
pub fn validate<F>(input: NewTenant, is_taken: F) -> Result<NewTenant, ValidationError>
where
    F: Fn(&str) -> bool,
{
    let subdomain = validate_subdomain(&input.subdomain)?;
    let company_name = validate_text_field("company_name", &input.company_name)?;
    let email = validate_text_field("email", &input.email)?;
    let base_domain = validate_base_domain(input.base_domain.as_deref())?;

    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(ValidationError::InvalidField {
            field: "email",
            reason: "must be an email address",
        });
    }

    if input.admin_password.expose().is_empty() {
        return Err(ValidationError::InvalidField {
            field: "admin_password",
            reason: "must not be empty",
        });
    }

    if is_taken(&subdomain) {
        return Err(ValidationError::DuplicateSubdomain(subdomain));
    }

    Ok(NewTenant {
        company_name,
        email,
        subdomain,
        admin_password: input.admin_password,
        base_domain: Some(base_domain),
    })
}

/// Check that the lifecycle permits `current -> next` for `action`.
pub fn ensure_can_transition(
    current: TenantStatus,
    next: TenantStatus,
    action: &'static str,
) -> Result<(), ValidationError> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(ValidationError::InvalidStateTransition { current, action })
    }
}

/// `{subdomain}.{base_domain}`
pub fn site_name(subdomain: &str, base_domain: &str) -> String {
    format!("{}.{}", subdomain, base_domain)
}
