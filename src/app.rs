use crate::error::{AppError, AppResult};
use crate::store::{RelayStore, SqliteRelayStore};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{any, get};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub store: Arc<dyn RelayStore>,
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
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("RELAYMUX_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path = std::env::var("RELAYMUX_METRICS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = resolve_database_dsn();
        Self {
            listen,
            metrics_path,
            database_dsn,
        }
    }
}

fn resolve_database_dsn() -> String {
    std::env::var("RELAYMUX_DATABASE_DSN")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
        .unwrap_or_else(|| "sqlite://./data/relaymux.db".to_string())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let store = SqliteRelayStore::connect(&runtime.database_dsn)
        .await
        .map_err(|err| {
            AppError::new(StatusCode::BAD_REQUEST, "database_init_failed", err)
        })?;
    load_state_with_store(runtime, Arc::new(store)).await
}

pub async fn load_state_with_store(
    runtime: RuntimeConfig,
    store: Arc<dyn RelayStore>,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("relaymux/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    let metrics = init_metrics()?;
    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        store,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
    use tower_http::trace::TraceLayer;

    let relay_routes = Router::new()
        .route(
            "/v1/chat/completions",
            any(crate::handlers::relay_chat_completions),
        )
        .route("/v1/completions", any(crate::handlers::relay_completions))
        .route("/v1/embeddings", any(crate::handlers::relay_embeddings))
        .route(
            "/v1/embeddings/{model}",
            any(crate::handlers::relay_embeddings_model),
        )
        .route("/v1/moderations", any(crate::handlers::relay_moderations))
        .route("/v1/edits", any(crate::handlers::relay_edits))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::distribute,
        ));

    Router::<AppState>::new()
        .route("/health", get(crate::handlers::health))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(&state.runtime.metrics_path, get(crate::handlers::metrics))
        .merge(relay_routes)
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
