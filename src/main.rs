// Main entry point for the stock metadata generation service

use stockmeta::{
    core::{errors::BatchError, types::*, Config},
    middleware::CredentialPool,
    orchestration::BatchOrchestrator,
    providers::{make_adapter, ProviderKind},
    utils::Metrics,
};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    http_client: reqwest::Client,
    services: Arc<HashMap<ProviderKind, Arc<BatchOrchestrator>>>,
}

impl AppState {
    fn service(&self, kind: ProviderKind) -> Result<Arc<BatchOrchestrator>, ApiError> {
        self.services
            .get(&kind)
            .cloned()
            .ok_or_else(|| internal(format!("no service registered for {kind}")))
    }
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

fn internal(message: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

#[derive(Deserialize)]
struct ProviderQuery {
    #[serde(default)]
    provider: ProviderKind,
}

#[derive(Deserialize)]
struct AddCredentialRequest {
    #[serde(default)]
    provider: ProviderKind,
    api_key: String,
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "stockmeta={}",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== STOCK METADATA GENERATOR ===");

    let metrics = Arc::new(Metrics::new());

    // Shared HTTP client; the per-call deadline lives in the orchestrator, the
    // client timeout is just a transport backstop.
    let http_client = reqwest::Client::builder()
        .timeout(config.request_timeout() + Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(8)
        .build()?;

    let mut services = HashMap::new();
    for kind in ProviderKind::ALL {
        let keys = kind.seed_keys(&config);
        if !keys.is_empty() {
            info!("{}: {} credential(s) seeded from environment", kind, keys.len());
        }
        let pool = Arc::new(CredentialPool::seeded(keys).await);
        let adapter = make_adapter(kind, kind.default_model(&config), http_client.clone());
        let orchestrator = Arc::new(BatchOrchestrator::from_config(
            kind,
            adapter,
            pool,
            &config,
            metrics.clone(),
        ));
        services.insert(kind, orchestrator);
    }

    let state = AppState {
        config: config.clone(),
        metrics,
        http_client,
        services: Arc::new(services),
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/health/credentials", get(health_credentials))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/progress", get(progress_endpoint))
        .route("/generate", post(generate))
        .route("/stop", post(stop))
        .route("/credentials", get(list_credentials).post(add_credential))
        .route("/credentials/:id/validate", post(validate_credential))
        .route("/credentials/:id", delete(remove_credential))
        .with_state(state)
        .layer(DefaultBodyLimit::max(200 * 1024 * 1024)) // 200MB for large batches
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("Server starting on http://{}", addr);
    info!("Endpoints:");
    info!("  GET    /                          - Service info");
    info!("  GET    /health                    - Health check");
    info!("  GET    /health/credentials        - Credential status per provider");
    info!("  GET    /metrics                   - Prometheus metrics");
    info!("  GET    /stats                     - Detailed statistics");
    info!("  GET    /progress?provider=        - Live batch progress");
    info!("  POST   /generate                  - Generate metadata (multipart/form-data)");
    info!("  POST   /stop?provider=            - Stop the running batch");
    info!("  GET    /credentials?provider=     - List credentials");
    info!("  POST   /credentials               - Add a credential");
    info!("  POST   /credentials/:id/validate  - Validate a credential");
    info!("  DELETE /credentials/:id?provider= - Remove a credential");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> &'static str {
    "Stock Metadata Generation Service"
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_credentials(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut providers = serde_json::Map::new();
    for kind in ProviderKind::ALL {
        if let Ok(service) = state.service(kind) {
            let stats = service.stats().await;
            providers.insert(
                kind.name().to_string(),
                serde_json::json!({
                    "total": stats.total_credentials,
                    "valid": stats.valid_credentials,
                }),
            );
        }
    }
    Json(serde_json::json!({ "status": "healthy", "providers": providers }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

async fn stats_endpoint(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mut providers = Vec::new();
    for kind in ProviderKind::ALL {
        providers.push(state.service(kind)?.stats().await);
    }
    Ok(Json(serde_json::json!({
        "providers": providers,
        "process": state.metrics.snapshot(),
    })))
}

async fn progress_endpoint(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<ProgressSnapshot>, ApiError> {
    Ok(Json(state.service(query.provider)?.progress()))
}

/// Generate metadata endpoint
///
/// # Request Format:
/// - multipart/form-data
/// - Field "images": One or more image files
/// - Field "config" (optional): JSON `GenerateConfig`
///
/// # Response:
/// - BatchSummary JSON with all results in input order
async fn generate(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<BatchSummary>, ApiError> {
    let start_time = std::time::Instant::now();
    state.metrics.record_endpoint("/generate");

    let mut images: Vec<ImageInput> = Vec::new();
    let mut request = GenerateConfig::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "images" => {
                let filename = field.file_name().unwrap_or("unknown.jpg").to_string();
                let mime = field
                    .content_type()
                    .unwrap_or("image/jpeg")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("Read error: {e}")))?;

                let media_kind = if mime == "image/svg+xml" {
                    MediaKind::Vector
                } else {
                    MediaKind::Photo
                };
                let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
                images.push(ImageInput {
                    filename,
                    payload: format!("data:{mime};base64,{encoded}"),
                    media_kind,
                });
            }
            "config" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("Config read error: {e}")))?;
                request = serde_json::from_str(&text)
                    .map_err(|e| bad_request(format!("Invalid config JSON: {e}")))?;
            }
            _ => {}
        }
    }

    if images.is_empty() {
        return Err(bad_request("No images provided"));
    }

    // Caller-supplied keys run on a throwaway orchestrator; persistent pools
    // stay untouched.
    let orchestrator = match request.api_keys.as_ref().filter(|keys| !keys.is_empty()) {
        Some(keys) => {
            let pool = Arc::new(CredentialPool::seeded(keys.clone()).await);
            let model = request
                .prompt
                .model
                .clone()
                .unwrap_or_else(|| request.provider.default_model(&state.config));
            let adapter = make_adapter(request.provider, model, state.http_client.clone());
            Arc::new(BatchOrchestrator::from_config(
                request.provider,
                adapter,
                pool,
                &state.config,
                state.metrics.clone(),
            ))
        }
        None => state.service(request.provider)?,
    };

    let total = images.len();
    info!(
        "Generating metadata for {} image(s) via {}",
        total, request.provider
    );

    let results = orchestrator
        .clone()
        .run_batch(images, request.prompt.clone(), request.strategy, None)
        .await
        .map_err(|e| {
            error!("Batch failed: {e}");
            match e {
                BatchError::AlreadyRunning => (
                    StatusCode::CONFLICT,
                    Json(serde_json::json!({ "error": e.to_string() })),
                ),
                BatchError::NoValidCredentials { .. } => bad_request(e.to_string()),
            }
        })?;

    let stopped = orchestrator.progress().stopped;
    let summary = BatchSummary::new(
        total,
        results,
        stopped,
        start_time.elapsed().as_secs_f64() * 1_000.0,
    );
    info!(
        "Request completed in {:.2}s: {} succeeded, {} failed{}",
        start_time.elapsed().as_secs_f64(),
        summary.succeeded,
        summary.failed,
        if stopped { " (stopped)" } else { "" }
    );
    Ok(Json(summary))
}

async fn stop(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.metrics.record_endpoint("/stop");
    state.service(query.provider)?.stop();
    Ok(Json(serde_json::json!({ "stopped": true })))
}

async fn list_credentials(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let views = state.service(query.provider)?.credentials().await;
    Ok(Json(serde_json::json!({
        "provider": query.provider.name(),
        "credentials": views,
    })))
}

async fn add_credential(
    State(state): State<AppState>,
    Json(request): Json<AddCredentialRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if request.api_key.trim().is_empty() {
        return Err(bad_request("api_key must not be empty"));
    }
    let display_name = request.name.unwrap_or_else(|| {
        let tail: String = request
            .api_key
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("key-...{tail}")
    });
    let view = state
        .service(request.provider)?
        .add_credential(request.api_key.trim(), &display_name)
        .await;
    Ok((StatusCode::CREATED, Json(serde_json::json!(view))))
}

async fn validate_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let service = state.service(query.provider)?;
    match service.validate_credential(&id).await {
        Ok(is_valid) => Ok(Json(serde_json::json!({ "id": id, "is_valid": is_valid }))),
        Err(e) => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
    }
}

async fn remove_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<StatusCode, ApiError> {
    if state.service(query.provider)?.remove_credential(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown credential id: {id}") })),
        ))
    }
}
