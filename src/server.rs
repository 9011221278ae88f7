//! # Server Configuration
//!
//! Wiring of the provisioning services, the Axum router and the server and
//! worker lifecycles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::operator_auth_middleware;
use crate::config::{AppConfig, ConfigError};
use crate::handlers;
use crate::provisioning::{CommandRunner, ProcessRunner, ProvisionWorker, ProvisioningOrchestrator};
use crate::rate_limit::{RateLimiter, rate_limit_middleware};
use crate::repositories::{ProvisionJobRepository, TenantRepository};
use crate::service::TenantService;
use crate::telemetry::trace_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub service: Arc<TenantService>,
    pub create_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Build the service graph over `db`, running the toolchain through `runner`.
    pub fn build(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ConfigError> {
        let crypto_key = config.crypto_key()?;
        let tenants = Arc::new(TenantRepository::new(db.clone()));
        let jobs = Arc::new(ProvisionJobRepository::new(db.clone()));

        let orchestrator = Arc::new(ProvisioningOrchestrator::new(
            tenants.clone(),
            jobs,
            runner,
            crypto_key.clone(),
            config.provisioning_config(),
        ));

        let service = TenantService::new(tenants, orchestrator, crypto_key)
            .with_auto_enqueue(config.auto_enqueue_on_create)
            .with_default_base_domain(config.toolchain.default_base_domain.clone());

        let create_limiter = Arc::new(
            RateLimiter::new(
                config.rate_limit.limit,
                Duration::from_secs(config.rate_limit.window_seconds),
                config.rate_limit.max_callers,
            )
            .with_trust_proxy(config.rate_limit.trust_proxy),
        );

        Ok(Self {
            config,
            db,
            service: Arc::new(service),
            create_limiter,
        })
    }

    /// Worker pool draining provision jobs with this state's orchestrator.
    pub fn worker(&self) -> ProvisionWorker {
        ProvisionWorker::new(
            ProvisionJobRepository::new(self.db.clone()),
            Arc::clone(self.service.orchestrator()),
            self.config.worker_config(),
        )
    }
}

/// Toolchain runner as configured.
pub fn process_runner(config: &AppConfig) -> ProcessRunner {
    ProcessRunner::new(
        config.toolchain.search_path.clone(),
        config.toolchain.fallback.clone(),
        config.toolchain_timeout(),
    )
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let create_routes = Router::new()
        .route("/api/v1/tenants", post(handlers::tenants::create_tenant))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.create_limiter),
            rate_limit_middleware,
        ));

    let operator_routes = Router::new()
        .route(
            "/api/v1/tenants/{id}/provision",
            post(handlers::tenants::enqueue_provision),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            operator_auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/api/v1/tenants/{id}/status",
            get(handlers::tenants::get_tenant_status),
        )
        .merge(create_routes)
        .merge(operator_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_middleware))
}

/// Starts the HTTP server and, when enabled, the provision worker. Both stop
/// on Ctrl-C.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let addr = config
        .bind_addr()
        .with_context(|| format!("Invalid server address: {}", config.api_bind_addr))?;

    let runner = Arc::new(process_runner(&config));
    let state = AppState::build(Arc::clone(&config), db, runner)?;

    let shutdown = CancellationToken::new();
    let worker_handle = if config.worker.enabled {
        let worker = state.worker();
        let token = shutdown.clone();
        Some(tokio::spawn(async move { worker.run(token).await }))
    } else {
        tracing::info!("Provision worker disabled");
        None
    };

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        server_shutdown.cancel();
    })
    .await
    .context("HTTP server failed")?;

    if let Some(handle) = worker_handle {
        handle.await.context("Provision worker task panicked")??;
    }

    Ok(())
}

/// Runs only the provision worker until Ctrl-C.
pub async fn run_worker(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let runner = Arc::new(process_runner(&config));
    let state = AppState::build(config, db, runner)?;

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    state.worker().run(shutdown).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

struct BearerAuthAddon;

impl Modify for BearerAuthAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::tenants::create_tenant,
        crate::handlers::tenants::get_tenant_status,
        crate::handlers::tenants::enqueue_provision,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::TenantStatus,
            crate::handlers::HealthStatus,
            crate::handlers::tenants::CreateTenantRequest,
            crate::service::CreatedTenant,
            crate::provisioning::EnqueueOutcome,
            crate::provisioning::TenantStatusView,
            crate::error::ApiError,
        )
    ),
    modifiers(&BearerAuthAddon),
    info(
        title = "Tenant Provisioner API",
        description = "Tenant registration and site provisioning",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
