use crate::config::{
    CredentialSource, DEFAULT_BASE_URL, ModelMapEntry, default_model_aliases, env_flag, env_string,
};
use crate::error::{AppError, AppResult};
use crate::store::{SessionStore, SqliteSessionStore, open_sqlite_pool};
use crate::sync::HistorySync;
use crate::upstream::{QwenGateway, UpstreamProfile};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub gateway: QwenGateway,
    pub sessions: Arc<dyn SessionStore>,
    pub history: HistorySync,
    pub profile: Arc<RwLock<UpstreamProfile>>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub base_url: String,
    pub credentials: CredentialSource,
    pub model_aliases: Vec<ModelMapEntry>,
    pub delete_after_turn: bool,
    pub sync_on_startup: bool,
    pub request_timeout_ms: u64,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_string("QWEN_BRIDGE_LISTEN").unwrap_or_else(|| {
            let port = env_string("PORT").unwrap_or_else(|| "5000".to_string());
            format!("0.0.0.0:{}", port.trim())
        });
        let metrics_path =
            env_string("QWEN_BRIDGE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let base_url = env_string("QWEN_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let request_timeout_ms = env_string("QWEN_BRIDGE_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(30_000)
            .max(1);
        Self {
            listen,
            metrics_path,
            database_dsn: resolve_database_dsn(),
            base_url,
            credentials: resolve_credentials(),
            model_aliases: default_model_aliases(),
            delete_after_turn: env_flag("QWEN_BRIDGE_DELETE_AFTER_TURN", false),
            sync_on_startup: env_flag("QWEN_BRIDGE_SYNC_ON_STARTUP", true),
            request_timeout_ms,
        }
    }
}

fn resolve_credentials() -> CredentialSource {
    if let Some(path) = env_string("QWEN_AUTH_TOKEN_FILE") {
        return CredentialSource::File(path.into());
    }
    match env_string("QWEN_AUTH_TOKEN") {
        Some(token) => CredentialSource::Static(token.trim().to_string()),
        None => {
            tracing::warn!("neither QWEN_AUTH_TOKEN nor QWEN_AUTH_TOKEN_FILE is set");
            CredentialSource::Static(String::new())
        }
    }
}

fn resolve_database_dsn() -> String {
    env_string("QWEN_BRIDGE_DATABASE_DSN")
        .or_else(|| env_string("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/sessions.db".to_string())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

/// Builds the state without contacting the upstream; see [`bootstrap`].
pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("qwen-bridge/0.1")
        .connect_timeout(std::time::Duration::from_millis(runtime.request_timeout_ms))
        .build()
        .map_err(|err| AppError::server("http_client_init_failed", err.to_string()))?;

    let pool = open_sqlite_pool(&runtime.database_dsn)
        .await
        .map_err(|err| AppError::server("database_init_failed", err.to_string()))?;
    let sessions: Arc<dyn SessionStore> = Arc::new(
        SqliteSessionStore::new(pool)
            .await
            .map_err(|err| AppError::server("session_store_init_failed", err.to_string()))?,
    );

    let metrics = init_metrics()?;

    let gateway = QwenGateway::new(
        http,
        runtime.base_url.clone(),
        runtime.credentials.clone(),
        runtime.request_timeout_ms,
    );
    let history = HistorySync::new(gateway.clone(), sessions.clone());

    Ok(AppState {
        runtime: Arc::new(runtime),
        gateway,
        sessions,
        history,
        profile: Arc::new(RwLock::new(UpstreamProfile::default())),
        metrics,
    })
}

/// Loads the upstream account profile and, unless disabled, rebuilds the
/// session table from upstream history.
pub async fn bootstrap(state: &AppState) -> AppResult<()> {
    let profile = state
        .gateway
        .fetch_profile()
        .await
        .map_err(|err| AppError::server("upstream_bootstrap_failed", err.to_string()))?;
    tracing::info!(models = profile.models.len(), "upstream profile loaded");
    *state.profile.write().await = profile;

    if state.runtime.sync_on_startup {
        state.history.run().await?;
    }
    Ok(())
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::server("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::server("metrics_init_failed", "metrics recorder not available"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/", get(crate::handlers::index))
        .route("/health", get(crate::handlers::health))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/sessions", get(crate::handlers::list_sessions))
        .route("/v1/sessions/sync", post(crate::handlers::sync_sessions))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
