mod altered;
mod catalog;
mod events;
mod http;
mod jobs;
mod metrics;
mod models;
mod store;

use altered::{AlteredClient, Friend, TokenProvider, token_provider_from_env};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use catalog::{
    BuildRequest, CatalogConfig, CatalogEngine, CatalogError, RenderedItem, Resolution,
    locale::locale_warning,
};
use chrono::{DateTime, Utc};
use events::{BroadcastSink, EventSink};
use futures::Stream;
use jobs::{JobStatus, Orchestrator, OrchestratorConfig, OrchestratorError};
use models::{ApiError, History, Operation, parse_operation_list};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use store::{Store, StoreError};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "altered.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let client = AlteredClient::from_env();
    let tokens = token_provider_from_env(&client);
    let store = Arc::new(Store::open(state_path()).await?);
    let events = BroadcastSink::new(event_buffer_from_env());
    let sink: Arc<dyn EventSink> = Arc::new(events.clone());

    let installed = store.snapshot().await.catalog;
    if let Some(table) = &installed {
        info!(target = "altered.api", entries = table.len(), locale = ?table.locale(), "catalog restored");
    }
    let catalog = Arc::new(CatalogEngine::new(
        client.clone(),
        store.clone(),
        sink.clone(),
        CatalogConfig::from_env(),
        installed,
    ));
    let orchestrator = Orchestrator::new(
        Arc::new(client.clone()),
        tokens.clone(),
        store.clone(),
        sink,
        OrchestratorConfig::from_env(),
    );

    let state = AppState {
        client,
        tokens,
        store,
        events,
        catalog,
        orchestrator,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/jobs", post(start_job))
        .route("/jobs/cancel", post(cancel_job))
        .route("/jobs/status", get(job_status))
        .route("/history", get(get_history).delete(clear_history))
        .route("/history/seen", post(mark_history_seen))
        .route("/catalog", get(catalog_metadata))
        .route("/catalog/build", post(build_catalog))
        .route("/resolve", post(resolve_item))
        .route("/friends", get(list_friends))
        .route("/events", get(event_stream))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "altered.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    client: AlteredClient,
    tokens: Arc<dyn TokenProvider>,
    store: Arc<Store>,
    events: BroadcastSink,
    catalog: Arc<CatalogEngine>,
    orchestrator: Orchestrator,
}

/// Health check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "altered-transfer-rs",
    }))
}

#[derive(Debug, Deserialize)]
struct StartJobRequest {
    recipient_id: String,
    #[serde(default)]
    operations: Vec<Operation>,
    /// `"<quantity> <identifier>"` lines, parsed leniently.
    #[serde(default)]
    card_list: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartJobResponse {
    total: usize,
    started_at: DateTime<Utc>,
}

/// Start a batch transfer.
///
/// - Method: `POST`
/// - Path: `/jobs`
/// - Body: `StartJobRequest`
/// - Response: `202` with the job size, `409` while another job runs
async fn start_job(
    State(state): State<AppState>,
    Json(payload): Json<StartJobRequest>,
) -> Result<(StatusCode, Json<StartJobResponse>), AppError> {
    crate::metrics::inc_requests("/jobs");
    let mut operations = payload.operations;
    if let Some(text) = payload.card_list.as_deref() {
        operations.extend(parse_operation_list(text));
    }
    let ticket = state
        .orchestrator
        .start(payload.recipient_id, operations)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartJobResponse {
            total: ticket.total,
            started_at: ticket.started_at,
        }),
    ))
}

async fn cancel_job(State(state): State<AppState>) -> StatusCode {
    crate::metrics::inc_requests("/jobs/cancel");
    if !state.orchestrator.request_cancel().await {
        debug!(target = "altered.api", "cancel ignored, no job running");
    }
    StatusCode::ACCEPTED
}

async fn job_status(State(state): State<AppState>) -> Json<JobStatus> {
    Json(state.orchestrator.status().await)
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    history: History,
    results_unseen: bool,
}

async fn get_history(State(state): State<AppState>) -> Json<HistoryResponse> {
    let snapshot = state.store.snapshot().await;
    Json(HistoryResponse {
        history: snapshot.history,
        results_unseen: snapshot.results_unseen,
    })
}

async fn mark_history_seen(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.store.mark_results_seen().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_history(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.store.clear_history().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct CatalogResponse {
    #[serde(flatten)]
    metadata: catalog::CatalogMetadata,
    building: bool,
}

async fn catalog_metadata(State(state): State<AppState>) -> Json<CatalogResponse> {
    Json(CatalogResponse {
        metadata: state.catalog.snapshot().await.metadata(),
        building: state.catalog.is_building(),
    })
}

/// Rebuild the hash catalog in the background.
///
/// - Method: `POST`
/// - Path: `/catalog/build`
/// - Body: `{locale?, context_url?}`
/// - Response: `202`, progress is published on `/events`
async fn build_catalog(
    State(state): State<AppState>,
    Json(request): Json<BuildRequest>,
) -> Result<StatusCode, AppError> {
    crate::metrics::inc_requests("/catalog/build");
    state.catalog.spawn_build(request)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    #[serde(flatten)]
    item: RenderedItem,
    #[serde(default)]
    page_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResolveResponse {
    #[serde(flatten)]
    resolution: Resolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    locale_warning: Option<String>,
}

async fn resolve_item(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Json<ResolveResponse> {
    crate::metrics::inc_requests("/resolve");
    let table = state.catalog.snapshot().await;
    let resolution = catalog::resolve_identifier(&request.item, &table);
    let locale_warning = request
        .page_url
        .as_deref()
        .and_then(|url| locale_warning(url, table.locale()));
    Json(ResolveResponse {
        resolution,
        locale_warning,
    })
}

async fn list_friends(State(state): State<AppState>) -> Result<Json<Vec<Friend>>, AppError> {
    crate::metrics::inc_requests("/friends");
    let token = state
        .tokens
        .bearer_token()
        .await
        .map_err(|err| AppError::Unauthorized(err.to_string()))?;
    let friends = state
        .client
        .fetch_friends(&token)
        .await
        .map_err(|err| AppError::Upstream(err.to_string()))?;
    Ok(Json(friends))
}

async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = Event::default()
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().comment("unserializable event"));
                    return Some((Ok(sse), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "altered.api", skipped, "event subscriber lagging");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug)]
enum AppError {
    Orchestrator(OrchestratorError),
    Catalog(CatalogError),
    Store(StoreError),
    Unauthorized(String),
    Upstream(String),
}

impl From<OrchestratorError> for AppError {
    fn from(value: OrchestratorError) -> Self {
        Self::Orchestrator(value)
    }
}

impl From<CatalogError> for AppError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Orchestrator(err) => {
                let (status, code) = match err {
                    OrchestratorError::AlreadyInProgress => {
                        (StatusCode::CONFLICT, "already_in_progress")
                    }
                    OrchestratorError::InvalidJob(_) => (StatusCode::BAD_REQUEST, "invalid_job"),
                    OrchestratorError::NoCredential(_) => {
                        (StatusCode::UNAUTHORIZED, "no_credential")
                    }
                    OrchestratorError::Aborted(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "job_aborted")
                    }
                };
                (status, code, err.to_string())
            }
            AppError::Catalog(err) => {
                let (status, code) = match err {
                    CatalogError::AlreadyInProgress => {
                        (StatusCode::CONFLICT, "already_in_progress")
                    }
                    CatalogError::InvalidLocale(_) => (StatusCode::BAD_REQUEST, "invalid_locale"),
                    CatalogError::RemoteUnavailable(_) | CatalogError::MalformedResponse(_) => {
                        (StatusCode::BAD_GATEWAY, "remote_unavailable")
                    }
                    CatalogError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
                };
                (status, code, err.to_string())
            }
            AppError::Store(err) => (StatusCode::INTERNAL_SERVER_ERROR, "store", err.to_string()),
            AppError::Unauthorized(detail) => {
                (StatusCode::UNAUTHORIZED, "no_credential", detail.clone())
            }
            AppError::Upstream(detail) => {
                (StatusCode::BAD_GATEWAY, "remote_unavailable", detail.clone())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = self.parts();
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn state_path() -> String {
    std::env::var("STATE_PATH").unwrap_or_else(|_| "altered-state.json".to_string())
}

fn event_buffer_from_env() -> usize {
    std::env::var("EVENT_BUFFER")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256)
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}
