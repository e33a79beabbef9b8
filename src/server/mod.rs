//! Server initialization and routing

use crate::api;
use crate::cache::{CacheManager, CacheOperations, NoOpCacheManager};
use crate::config::Config;
use crate::enforcer::{EngineOptions, LocalPolicyEngine, PolicyEngine, RemotePolicyEngine};
use crate::jwt::JwtManager;
use crate::middleware::{inject_client_ip, SanitizedMakeSpan};
use crate::repository::{
    api_token::ApiTokenRepositoryImpl, assignment::AssignmentRepositoryImpl,
    audit::AuditRepositoryImpl, policy::PolicyRepositoryImpl, role::RoleRepositoryImpl,
    role_group::RoleGroupRepositoryImpl, template::TemplateRepositoryImpl,
    user::UserRepositoryImpl,
};
use crate::service::{
    spawn_gc_scheduler, spawn_login_audit_worker, AssignmentMerger, AuditSink,
    AuthorizationService, LifecycleService, LoginAuditQueue, RequestGate, RoleGroupService,
    SubjectResolver, UserService,
};
use crate::state::HasServices;
use crate::template::TemplateCatalog;
use anyhow::Result;
use axum::{
    routing::{delete, get},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::{mysql::MySqlPoolOptions, MySqlPool};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

type Merger =
    AssignmentMerger<RoleRepositoryImpl, TemplateRepositoryImpl, AssignmentRepositoryImpl>;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db_pool: MySqlPool,
    pub subject_resolver: Arc<SubjectResolver<UserRepositoryImpl, ApiTokenRepositoryImpl>>,
    pub authorization: Arc<AuthorizationService>,
    pub user_service: Arc<
        UserService<
            UserRepositoryImpl,
            RoleGroupRepositoryImpl,
            RoleRepositoryImpl,
            TemplateRepositoryImpl,
            AssignmentRepositoryImpl,
            AuditRepositoryImpl,
        >,
    >,
    pub role_group_service: Arc<
        RoleGroupService<
            RoleGroupRepositoryImpl,
            RoleRepositoryImpl,
            TemplateRepositoryImpl,
            AssignmentRepositoryImpl,
            AuditRepositoryImpl,
        >,
    >,
    pub lifecycle_service: Arc<
        LifecycleService<
            AssignmentRepositoryImpl,
            RoleRepositoryImpl,
            PolicyRepositoryImpl,
            TemplateRepositoryImpl,
        >,
    >,
    pub prometheus_handle: Option<PrometheusHandle>,
}

/// Implement HasServices trait for production AppState
impl HasServices for AppState {
    type UserRepo = UserRepositoryImpl;
    type RoleGroupRepo = RoleGroupRepositoryImpl;
    type RoleRepo = RoleRepositoryImpl;
    type TemplateRepo = TemplateRepositoryImpl;
    type AssignmentRepo = AssignmentRepositoryImpl;
    type AuditRepo = AuditRepositoryImpl;
    type PolicyRepo = PolicyRepositoryImpl;
    type ApiTokenRepo = ApiTokenRepositoryImpl;

    fn config(&self) -> &Config {
        &self.config
    }

    fn subject_resolver(&self) -> &SubjectResolver<UserRepositoryImpl, ApiTokenRepositoryImpl> {
        &self.subject_resolver
    }

    fn authorization(&self) -> &AuthorizationService {
        &self.authorization
    }

    fn user_service(
        &self,
    ) -> &UserService<
        UserRepositoryImpl,
        RoleGroupRepositoryImpl,
        RoleRepositoryImpl,
        TemplateRepositoryImpl,
        AssignmentRepositoryImpl,
        AuditRepositoryImpl,
    > {
        &self.user_service
    }

    fn role_group_service(
        &self,
    ) -> &RoleGroupService<
        RoleGroupRepositoryImpl,
        RoleRepositoryImpl,
        TemplateRepositoryImpl,
        AssignmentRepositoryImpl,
        AuditRepositoryImpl,
    > {
        &self.role_group_service
    }

    fn lifecycle_service(
        &self,
    ) -> &LifecycleService<
        AssignmentRepositoryImpl,
        RoleRepositoryImpl,
        PolicyRepositoryImpl,
        TemplateRepositoryImpl,
    > {
        &self.lifecycle_service
    }

    fn metrics_handle(&self) -> Option<&PrometheusHandle> {
        self.prometheus_handle.as_ref()
    }

    async fn check_ready(&self) -> (bool, bool) {
        let db_ok = sqlx::query("SELECT 1")
            .execute(&self.db_pool)
            .await
            .is_ok();
        let cache_ok = self.authorization.cache().ping().await.is_ok();
        (db_ok, cache_ok)
    }
}

/// Decision cache: Redis when configured and enabled, otherwise a no-op.
async fn build_decision_cache(config: &Config) -> Result<Arc<dyn CacheOperations>> {
    match config.redis.as_ref() {
        Some(redis) if config.decision_cache_enabled() => {
            let ttl = Duration::from_secs(config.enforcer.cache_expiration_secs);
            let cache = CacheManager::new(redis, ttl).await?;
            info!(ttl_secs = ttl.as_secs(), "Decision cache enabled (Redis)");
            Ok(Arc::new(cache))
        }
        _ => {
            info!("Decision cache disabled");
            Ok(Arc::new(NoOpCacheManager::new()))
        }
    }
}

/// In-process engine loaded from the store, or the remote engine when configured.
async fn build_engine(
    config: &Config,
    policy_repo: Arc<PolicyRepositoryImpl>,
) -> Result<Arc<dyn PolicyEngine>> {
    if let Some(remote) = config.remote_engine.as_ref() {
        info!(url = %remote.url, "Using remote policy engine");
        return Ok(Arc::new(RemotePolicyEngine::connect(remote)?));
    }

    let options = EngineOptions::from(&config.enforcer);
    let engine = LocalPolicyEngine::load(policy_repo, options).await?;
    info!(
        policies = engine.policy_count().await?,
        indexed = options.indexed,
        batch_path = options.batch_path,
        role_cache = options.role_cache,
        "Policy engine loaded"
    );
    Ok(Arc::new(engine))
}

/// Run the server
pub async fn run(config: Config, prometheus_handle: Option<PrometheusHandle>) -> Result<()> {
    let db_pool = MySqlPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await?;

    info!("Connected to database");

    // Create repositories
    let user_repo = Arc::new(UserRepositoryImpl::new(db_pool.clone()));
    let group_repo = Arc::new(RoleGroupRepositoryImpl::new(db_pool.clone()));
    let role_repo = Arc::new(RoleRepositoryImpl::new(db_pool.clone()));
    let template_repo = Arc::new(TemplateRepositoryImpl::new(db_pool.clone()));
    let assignment_repo = Arc::new(AssignmentRepositoryImpl::new(db_pool.clone()));
    let audit_repo = Arc::new(AuditRepositoryImpl::new(db_pool.clone()));
    let policy_repo = Arc::new(PolicyRepositoryImpl::new(db_pool.clone()));
    let api_token_repo = Arc::new(ApiTokenRepositoryImpl::new(db_pool.clone()));

    let cache = build_decision_cache(&config).await?;
    let engine = build_engine(&config, policy_repo.clone()).await?;
    let authorization = Arc::new(AuthorizationService::new(engine.clone(), cache.clone()));

    let catalog = Arc::new(TemplateCatalog::new(
        template_repo,
        config.enforcer.use_rbac_creation_v2,
    ));
    let templates = catalog.refresh().await?;
    info!(templates, v2 = catalog.uses_v2(), "Default role templates loaded");

    // Login audit runs off the request path.
    let (login_audit, login_rx) = LoginAuditQueue::new(config.audit.queue_capacity);
    let _login_audit_worker = spawn_login_audit_worker(login_rx, audit_repo.clone());

    let jwt_manager = JwtManager::new(config.jwt.clone())?;
    let subject_resolver = Arc::new(SubjectResolver::new(
        jwt_manager,
        config.authorisation.clone(),
        user_repo.clone(),
        api_token_repo,
        login_audit,
    ));

    let merger: Arc<Merger> = Arc::new(AssignmentMerger::new(
        role_repo.clone(),
        catalog.clone(),
        assignment_repo.clone(),
        authorization.clone(),
        engine,
        cache,
    ));
    let audit_sink = Arc::new(AuditSink::new(audit_repo.clone()));

    let user_service = Arc::new(UserService::new(
        user_repo,
        group_repo.clone(),
        role_repo.clone(),
        audit_repo,
        merger.clone(),
        authorization.clone(),
        audit_sink.clone(),
        RequestGate::new(),
    ));
    // Group ids and user ids overlap, so role-groups get their own gate.
    let role_group_service = Arc::new(RoleGroupService::new(
        group_repo,
        role_repo.clone(),
        merger,
        authorization.clone(),
        audit_sink,
        RequestGate::new(),
    ));
    let lifecycle_service = Arc::new(LifecycleService::new(
        assignment_repo,
        role_repo,
        policy_repo,
        catalog,
        authorization.clone(),
    ));

    let gc_scheduler = spawn_gc_scheduler(lifecycle_service.clone(), &config.cleanup)?;
    if gc_scheduler.is_none() {
        info!("RBAC policy cleanup disabled");
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        db_pool,
        subject_resolver,
        authorization,
        user_service,
        role_group_service,
        lifecycle_service,
        prometheus_handle,
    };

    let app = build_router(state);

    let http_addr = config.http_addr();
    let listener = TcpListener::bind(&http_addr).await?;
    info!("HTTP server started on {}", http_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Build the HTTP router with generic state type
///
/// This function is generic over the state type, allowing it to work with
/// both production `AppState` and test implementations that implement `HasServices`.
pub fn build_router<S: HasServices>(state: S) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let timeout = Duration::from_secs(state.config().request_timeout_secs);

    Router::new()
        // Health endpoints
        .route("/health", get(api::health::health))
        .route("/ready", get(api::health::ready::<S>))
        .route("/metrics", get(api::metrics::metrics_handler::<S>))
        // User endpoints
        .route(
            "/user",
            get(api::user::list_all::<S>)
                .post(api::user::create::<S>)
                .put(api::user::update::<S>),
        )
        .route("/user/v2", get(api::user::list::<S>))
        .route("/user/bulk", delete(api::user::bulk_delete::<S>))
        .route("/user/detail/get", get(api::user::detail::<S>))
        .route("/user/check/roles", get(api::user::check_roles::<S>))
        .route(
            "/user/sync/orchestratortocasbin",
            get(api::user::sync_orchestrator::<S>),
        )
        // Role-group endpoints
        .route(
            "/user/role/group",
            get(api::role_group::list_all::<S>)
                .post(api::role_group::create::<S>)
                .put(api::role_group::update::<S>),
        )
        .route("/user/role/group/v2", get(api::role_group::list::<S>))
        .route(
            "/user/role/group/bulk",
            delete(api::role_group::bulk_delete::<S>),
        )
        .route(
            "/user/role/group/search",
            get(api::role_group::search::<S>),
        )
        .route(
            "/user/role/group/{id}",
            get(api::role_group::get::<S>).delete(api::role_group::delete::<S>),
        )
        // Engine administration
        .route("/user/role/cache", get(api::admin::cache_dump::<S>))
        .route(
            "/user/role/cache/invalidate",
            get(api::admin::invalidate_cache::<S>),
        )
        .route(
            "/user/role/template/refresh",
            get(api::admin::refresh_templates::<S>),
        )
        .route(
            "/user/{id}",
            get(api::user::get::<S>).delete(api::user::delete::<S>),
        )
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http().make_span_with(SanitizedMakeSpan))
        .layer(cors)
        .layer(axum::middleware::from_fn(inject_client_ip))
        .with_state(state)
}
