//! Configuration loading for the tenant provisioner.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `PROVISIONER_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoKey, SecretString};
use crate::provisioning::{ProvisioningConfig, STALE_JOB_GRACE, WorkerConfig, validator};

const ENV_PREFIX: &str = "PROVISIONER_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `PROVISIONER_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    /// Admit new tenants for provisioning as soon as they are created
    #[serde(default)]
    pub auto_enqueue_on_create: bool,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub rate_limit: CreateRateLimitConfig,
}

/// External site-creation toolchain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ToolchainConfig {
    /// Executable name or path
    ///
    /// Environment variable: `PROVISIONER_TOOLCHAIN_BIN`
    #[serde(default = "default_toolchain_bin")]
    pub bin: String,

    /// Working directory for invocations
    ///
    /// Environment variable: `PROVISIONER_TOOLCHAIN_HOME`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// Location tried when the executable is not on the search path
    ///
    /// Environment variable: `PROVISIONER_TOOLCHAIN_FALLBACK`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<PathBuf>,

    /// Directories searched for the executable; the process `PATH` when unset
    ///
    /// Environment variable: `PROVISIONER_TOOLCHAIN_SEARCH_PATH` (`PATH` syntax)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_path: Option<Vec<PathBuf>>,

    /// Upper bound on a single invocation
    ///
    /// Environment variable: `PROVISIONER_TOOLCHAIN_TIMEOUT_SECONDS`
    #[serde(default = "default_toolchain_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Environment variable: `PROVISIONER_DB_ROOT_USERNAME`
    #[serde(default = "default_db_root_username")]
    pub db_root_username: String,

    /// Environment variable: `PROVISIONER_DB_ROOT_PASSWORD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_root_password: Option<String>,

    /// Applications installed on every new site, in order
    ///
    /// Environment variable: `PROVISIONER_INSTALL_APPS` (comma-separated)
    #[serde(default = "default_install_apps")]
    pub install_apps: Vec<String>,

    /// Environment variable: `PROVISIONER_SITE_SCHEME`
    #[serde(default = "default_site_scheme")]
    pub site_scheme: String,

    /// Environment variable: `PROVISIONER_DEFAULT_BASE_DOMAIN`
    #[serde(default = "default_base_domain")]
    pub default_base_domain: String,
}

/// Provision worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerSettings {
    /// Environment variable: `PROVISIONER_WORKER_ENABLED`
    #[serde(default = "default_worker_enabled")]
    pub enabled: bool,
    /// Environment variable: `PROVISIONER_WORKER_TICK_MS`
    #[serde(default = "default_worker_tick_ms")]
    pub tick_ms: u64,
    /// Environment variable: `PROVISIONER_WORKER_CONCURRENCY`
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
}

/// Rate limit applied to public tenant creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CreateRateLimitConfig {
    /// Requests allowed per caller per window
    ///
    /// Environment variable: `PROVISIONER_CREATE_RATE_LIMIT`
    #[serde(default = "default_create_rate_limit")]
    pub limit: u32,
    /// Environment variable: `PROVISIONER_CREATE_RATE_WINDOW_SECONDS`
    #[serde(default = "default_create_rate_window_seconds")]
    pub window_seconds: u64,
    /// Distinct callers tracked before the least recent is evicted
    ///
    /// Environment variable: `PROVISIONER_RATE_LIMIT_MAX_CALLERS`
    #[serde(default = "default_rate_limit_max_callers")]
    pub max_callers: usize,
    /// Key callers by `X-Forwarded-For` / `X-Real-IP`. Enable only behind a
    /// reverse proxy that overwrites those headers.
    ///
    /// Environment variable: `PROVISIONER_TRUST_PROXY`
    #[serde(default)]
    pub trust_proxy: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            crypto_key: None,
            auto_enqueue_on_create: false,
            toolchain: ToolchainConfig::default(),
            worker: WorkerSettings::default(),
            rate_limit: CreateRateLimitConfig::default(),
        }
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            bin: default_toolchain_bin(),
            home: None,
            fallback: None,
            search_path: None,
            timeout_seconds: default_toolchain_timeout_seconds(),
            db_root_username: default_db_root_username(),
            db_root_password: None,
            install_apps: default_install_apps(),
            site_scheme: default_site_scheme(),
            default_base_domain: default_base_domain(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: default_worker_enabled(),
            tick_ms: default_worker_tick_ms(),
            concurrency: default_worker_concurrency(),
        }
    }
}

impl Default for CreateRateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_create_rate_limit(),
            window_seconds: default_create_rate_window_seconds(),
            max_callers: default_rate_limit_max_callers(),
            trust_proxy: false,
        }
    }
}

impl ToolchainConfig {
    /// Validate toolchain settings.
    pub fn validate(&self, profile: &str) -> Result<(), ConfigError> {
        if self.bin.trim().is_empty() {
            return Err(ConfigError::MissingToolchainBin);
        }

        if self.timeout_seconds == 0 || self.timeout_seconds > 86_400 {
            return Err(ConfigError::InvalidToolchainTimeout {
                value: self.timeout_seconds,
            });
        }

        if self.install_apps.is_empty() {
            return Err(ConfigError::MissingInstallApps);
        }

        if !matches!(self.site_scheme.as_str(), "http" | "https") {
            return Err(ConfigError::InvalidSiteScheme {
                value: self.site_scheme.clone(),
            });
        }

        if validator::validate_base_domain(Some(&self.default_base_domain)).is_err() {
            return Err(ConfigError::InvalidBaseDomain {
                value: self.default_base_domain.clone(),
            });
        }

        if !matches!(profile, "local" | "test")
            && self
                .db_root_password
                .as_deref()
                .is_none_or(|password| password.is_empty())
        {
            return Err(ConfigError::MissingDbRootPassword);
        }

        Ok(())
    }
}

impl WorkerSettings {
    /// Validate worker pool bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms < 100 || self.tick_ms > 60_000 {
            return Err(ConfigError::InvalidWorkerTick {
                value: self.tick_ms,
            });
        }

        if self.concurrency == 0 || self.concurrency > 64 {
            return Err(ConfigError::InvalidWorkerConcurrency {
                value: self.concurrency,
            });
        }

        Ok(())
    }
}

impl CreateRateLimitConfig {
    /// Validate create rate limit bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::InvalidCreateRateLimit { value: self.limit });
        }

        if self.window_seconds == 0 {
            return Err(ConfigError::InvalidCreateRateWindow {
                value: self.window_seconds,
            });
        }

        if self.max_callers == 0 {
            return Err(ConfigError::InvalidRateLimitMaxCallers {
                value: self.max_callers,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.crypto_key.is_some() {
            config.crypto_key = Some(REDACTED.as_bytes().to_vec());
        }
        if config.toolchain.db_root_password.is_some() {
            config.toolchain.db_root_password = Some(REDACTED.to_string());
        }
        if let Some(at) = config.database_url.find('@') {
            // Drop userinfo from the connection string
            if let Some(scheme_end) = config.database_url.find("://") {
                config.database_url = format!(
                    "{}://{}{}",
                    &config.database_url[..scheme_end],
                    REDACTED,
                    &config.database_url[at..]
                );
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.crypto_key {
            Some(key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        self.toolchain.validate(&self.profile)?;
        self.worker.validate()?;
        self.rate_limit.validate()?;

        Ok(())
    }

    /// The validated encryption key for admin passwords.
    pub fn crypto_key(&self) -> Result<CryptoKey, ConfigError> {
        let bytes = self.crypto_key.clone().ok_or(ConfigError::MissingCryptoKey)?;
        let length = bytes.len();
        CryptoKey::new(bytes).map_err(|_| ConfigError::InvalidCryptoKeyLength { length })
    }

    /// Orchestrator settings resolved from the toolchain section.
    pub fn provisioning_config(&self) -> ProvisioningConfig {
        ProvisioningConfig {
            toolchain_bin: self.toolchain.bin.clone(),
            toolchain_home: self.toolchain.home.clone(),
            db_root_username: self.toolchain.db_root_username.clone(),
            db_root_password: SecretString::from(
                self.toolchain.db_root_password.clone().unwrap_or_default(),
            ),
            install_apps: self.toolchain.install_apps.clone(),
            site_scheme: self.toolchain.site_scheme.clone(),
        }
    }

    pub fn toolchain_timeout(&self) -> Duration {
        Duration::from_secs(self.toolchain.timeout_seconds)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            tick_ms: self.worker.tick_ms,
            concurrency: self.worker.concurrency,
            stale_after: self.toolchain_timeout() + STALE_JOB_GRACE,
        }
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/provisioner".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_toolchain_bin() -> String {
    "bench".to_string()
}

fn default_toolchain_timeout_seconds() -> u64 {
    1800
}

fn default_db_root_username() -> String {
    "root".to_string()
}

fn default_install_apps() -> Vec<String> {
    vec!["erpnext".to_string()]
}

fn default_site_scheme() -> String {
    "https".to_string()
}

fn default_base_domain() -> String {
    "local".to_string()
}

fn default_worker_enabled() -> bool {
    true
}

fn default_worker_tick_ms() -> u64 {
    2000
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_create_rate_limit() -> u32 {
    5
}

fn default_create_rate_window_seconds() -> u64 {
    60
}

fn default_rate_limit_max_callers() -> usize {
    10_000
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set PROVISIONER_OPERATOR_TOKEN or PROVISIONER_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("crypto key is missing; set PROVISIONER_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("{key} must be {expected}, got '{value}'")]
    InvalidValue {
        key: String,
        expected: &'static str,
        value: String,
    },
    #[error("toolchain executable is empty; set PROVISIONER_TOOLCHAIN_BIN")]
    MissingToolchainBin,
    #[error("toolchain timeout must be between 1 and 86400 seconds, got {value}")]
    InvalidToolchainTimeout { value: u64 },
    #[error("at least one application must be listed in PROVISIONER_INSTALL_APPS")]
    MissingInstallApps,
    #[error("site scheme must be 'http' or 'https', got '{value}'")]
    InvalidSiteScheme { value: String },
    #[error("default base domain must be a hostname, got '{value}'")]
    InvalidBaseDomain { value: String },
    #[error("database root password is missing; set PROVISIONER_DB_ROOT_PASSWORD")]
    MissingDbRootPassword,
    #[error("worker tick must be between 100 and 60000 milliseconds, got {value}")]
    InvalidWorkerTick { value: u64 },
    #[error("worker concurrency must be between 1 and 64, got {value}")]
    InvalidWorkerConcurrency { value: usize },
    #[error("create rate limit must be positive, got {value}")]
    InvalidCreateRateLimit { value: u32 },
    #[error("create rate window must be positive, got {value}")]
    InvalidCreateRateWindow { value: u64 },
    #[error("rate limit caller capacity must be positive, got {value}")]
    InvalidRateLimitMaxCallers { value: usize },
}

/// Loads configuration using layered `.env` files and `PROVISIONER_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse an optional typed value, rejecting malformed input instead of
/// silently falling back to the default.
fn parse_or<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    expected: &'static str,
    default: impl FnOnce() -> T,
) -> Result<T, ConfigError> {
    match layered.remove(key).and_then(non_empty) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: format!("{}{}", ENV_PREFIX, key),
            expected,
            value,
        }),
        None => Ok(default()),
    }
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = parse_or(
            &mut layered,
            "DB_MAX_CONNECTIONS",
            "a positive integer",
            default_db_max_connections,
        )?;
        let db_acquire_timeout_ms = parse_or(
            &mut layered,
            "DB_ACQUIRE_TIMEOUT_MS",
            "a positive integer",
            default_db_acquire_timeout_ms,
        )?;

        // Support both a single token and a comma-separated list
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            comma_list(&tokens)
        } else if let Some(token) = layered.remove("OPERATOR_TOKEN").and_then(non_empty) {
            vec![token]
        } else {
            Vec::new()
        };

        let crypto_key = match layered.remove("CRYPTO_KEY").and_then(non_empty) {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(&key_str).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let auto_enqueue_on_create = parse_or(
            &mut layered,
            "AUTO_ENQUEUE_ON_CREATE",
            "true or false",
            || false,
        )?;

        let toolchain = ToolchainConfig {
            bin: layered
                .remove("TOOLCHAIN_BIN")
                .and_then(non_empty)
                .unwrap_or_else(default_toolchain_bin),
            home: layered
                .remove("TOOLCHAIN_HOME")
                .and_then(non_empty)
                .map(PathBuf::from),
            fallback: layered
                .remove("TOOLCHAIN_FALLBACK")
                .and_then(non_empty)
                .map(PathBuf::from),
            search_path: layered
                .remove("TOOLCHAIN_SEARCH_PATH")
                .and_then(non_empty)
                .map(|paths| env::split_paths(&paths).collect()),
            timeout_seconds: parse_or(
                &mut layered,
                "TOOLCHAIN_TIMEOUT_SECONDS",
                "a number of seconds",
                default_toolchain_timeout_seconds,
            )?,
            db_root_username: layered
                .remove("DB_ROOT_USERNAME")
                .and_then(non_empty)
                .unwrap_or_else(default_db_root_username),
            db_root_password: layered.remove("DB_ROOT_PASSWORD").filter(|v| !v.is_empty()),
            install_apps: layered
                .remove("INSTALL_APPS")
                .map(|apps| comma_list(&apps))
                .unwrap_or_else(default_install_apps),
            site_scheme: layered
                .remove("SITE_SCHEME")
                .and_then(non_empty)
                .map(|scheme| scheme.to_lowercase())
                .unwrap_or_else(default_site_scheme),
            default_base_domain: layered
                .remove("DEFAULT_BASE_DOMAIN")
                .and_then(non_empty)
                .map(|domain| domain.to_lowercase())
                .unwrap_or_else(default_base_domain),
        };

        let worker = WorkerSettings {
            enabled: parse_or(
                &mut layered,
                "WORKER_ENABLED",
                "true or false",
                default_worker_enabled,
            )?,
            tick_ms: parse_or(
                &mut layered,
                "WORKER_TICK_MS",
                "a number of milliseconds",
                default_worker_tick_ms,
            )?,
            concurrency: parse_or(
                &mut layered,
                "WORKER_CONCURRENCY",
                "a positive integer",
                default_worker_concurrency,
            )?,
        };

        let rate_limit = CreateRateLimitConfig {
            limit: parse_or(
                &mut layered,
                "CREATE_RATE_LIMIT",
                "a positive integer",
                default_create_rate_limit,
            )?,
            window_seconds: parse_or(
                &mut layered,
                "CREATE_RATE_WINDOW_SECONDS",
                "a number of seconds",
                default_create_rate_window_seconds,
            )?,
            max_callers: parse_or(
                &mut layered,
                "RATE_LIMIT_MAX_CALLERS",
                "a positive integer",
                default_rate_limit_max_callers,
            )?,
            trust_proxy: parse_or(&mut layered, "TRUST_PROXY", "true or false", || false)?,
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            crypto_key,
            auto_enqueue_on_create,
            toolchain,
            worker,
            rate_limit,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{}PROFILE", ENV_PREFIX))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            operator_tokens: vec!["token".to_string()],
            crypto_key: Some(vec![7u8; 32]),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate_for_local_profile() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.toolchain.timeout_seconds, 1800);
        assert_eq!(config.toolchain.install_apps, vec!["erpnext".to_string()]);
        assert_eq!(config.rate_limit.limit, 5);
        assert_eq!(config.rate_limit.window_seconds, 60);
    }

    #[test]
    fn test_production_requires_db_root_password() {
        let mut config = valid_config();
        config.profile = "prod".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDbRootPassword)
        ));

        config.toolchain.db_root_password = Some("pw".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bounds_are_checked() {
        let mut config = valid_config();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.toolchain.timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.toolchain.site_scheme = "ftp".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.toolchain.default_base_domain = "not a/domain".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBaseDomain { .. })
        ));

        let mut config = valid_config();
        config.crypto_key = Some(vec![0u8; 16]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCryptoKeyLength { length: 16 })
        ));
    }

    #[test]
    fn test_redacted_json_hides_secrets() {
        let mut config = valid_config();
        config.toolchain.db_root_password = Some("super-secret".to_string());
        config.database_url = "postgresql://user:pass@db:5432/provisioner".to_string();

        let json = config.redacted_json().unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!json.contains("token\""));
        assert!(!json.contains("user:pass"));
        assert!(json.contains("@db:5432/provisioner"));
    }

    #[test]
    fn test_provisioning_config_mapping() {
        let mut config = valid_config();
        config.toolchain.db_root_password = Some("pw".to_string());
        config.toolchain.install_apps = vec!["erpnext".to_string(), "hrms".to_string()];

        let provisioning = config.provisioning_config();
        assert_eq!(provisioning.db_root_password.expose(), "pw");
        assert_eq!(provisioning.install_apps.len(), 2);
        assert_eq!(config.toolchain_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_running_jobs_go_stale_only_after_the_toolchain_timeout() {
        let mut config = valid_config();
        config.toolchain.timeout_seconds = 120;

        let worker = config.worker_config();
        assert!(worker.stale_after > config.toolchain_timeout());
        assert_eq!(worker.stale_after, Duration::from_secs(180));
    }
}
