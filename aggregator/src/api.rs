use crate::aggregator::{Aggregator, ReadError, Served};
use crate::config::Listener as ListenerConfig;
use crate::registry::RegistryError;
use crate::scheduler::Scheduler;
use crate::session::{SessionError, SessionManager};
use crate::types::{DisplayMetadata, Payload, SourceDescriptor, SourceKind, SourceLocation};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::time::unix_millis;
use std::sync::Arc;
use tokio::net::TcpListener;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_FETCHED_AT: HeaderName = HeaderName::from_static("x-fetched-at");

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Aggregator,
    pub sessions: Arc<SessionManager>,
    pub scheduler: Scheduler,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiServeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/refresh", post(refresh))
        .route("/sources", get(list_sources))
        .route("/sources/{name}", get(get_source))
        .route("/content/{name}", get(get_content))
        .route("/sources-status", get(sources_status))
        .route("/admin/login", post(login))
        .route("/admin/logout", post(logout))
        .route("/admin/verify", get(verify))
        .route("/admin/sources", get(list_dynamic).post(register_source))
        .route("/admin/sources/{name}", delete(remove_source))
        .route("/admin/sources/{name}/hide", post(hide_source))
        .route("/admin/sources/{name}/unhide", post(unhide_source))
        .route("/admin/hidden", get(list_hidden))
        .with_state(state)
}

pub async fn serve<F>(
    listener: &ListenerConfig,
    state: AppState,
    shutdown: F,
) -> Result<(), ApiServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("unknown source {0:?}")]
    UnknownSource(String),

    #[error("{message}")]
    Unavailable { name: String, message: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    BadRequest(String),

    #[error("the refresh worker is not running")]
    WorkerStopped,
}

impl From<ReadError> for ApiError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::UnknownSource(name) => ApiError::UnknownSource(name),
            ReadError::Unavailable { name, message } => ApiError::Unavailable { name, message },
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(_: SessionError) -> Self {
        ApiError::Unauthorized
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownSource(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Registry(RegistryError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Registry(RegistryError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            ApiError::Registry(RegistryError::Persist(e)) => {
                tracing::error!(error = %e, "Failed to persist registry state");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Registry(RegistryError::Interrupted(e)) => {
                tracing::error!(error = %e, "Registry update task failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::WorkerStopped => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = match &self {
            ApiError::UnknownSource(name) | ApiError::Unavailable { name, .. } => {
                json!({ "error": self.to_string(), "sheet": name })
            }
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

/// Extracts and validates `Authorization: Bearer <token>`. Every successful
/// extraction slides the session's expiry.
pub struct AdminSession {
    token: String,
}

impl FromRequestParts<AppState> for AdminSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        state.sessions.authorize(token)?;
        Ok(AdminSession {
            token: token.to_string(),
        })
    }
}

/// `Json` whose rejections are answered as `{error}` with status 400.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
        Ok(JsonBody(value))
    }
}

#[derive(Deserialize, Debug, Default)]
struct ReadParams {
    #[serde(default)]
    refresh: bool,
}

/// Reads a source whose kind matches what the route serves. A name of the
/// other family is reported as unknown.
async fn read_matching(
    state: &AppState,
    name: &str,
    documents: bool,
    force: bool,
) -> Result<Served, ApiError> {
    match state.aggregator.registry().resolve(name) {
        Some(source) if (source.kind() == SourceKind::Document) == documents => {
            Ok(state.aggregator.read(name, force).await?)
        }
        _ => Err(ApiError::UnknownSource(name.to_string())),
    }
}

fn with_cache_headers(mut response: Response, served: &Served) -> Response {
    let headers = response.headers_mut();
    headers.insert(X_CACHE, HeaderValue::from_static(served.status.as_str()));
    if let Some(fetched_at) = served.entry.fetched_at {
        headers.insert(X_FETCHED_AT, HeaderValue::from(unix_millis(fetched_at)));
    }
    response
}

async fn get_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ReadParams>,
) -> Result<Response, ApiError> {
    let served = read_matching(&state, &name, false, params.refresh).await?;
    let response = Json(&served.entry.payload).into_response();
    Ok(with_cache_headers(response, &served))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentResponse<'a> {
    html: &'a str,
    fetched_at: Option<u64>,
}

async fn get_content(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ReadParams>,
) -> Result<Response, ApiError> {
    let served = read_matching(&state, &name, true, params.refresh).await?;
    let html = match &served.entry.payload {
        Payload::Markup(html) => html.as_str(),
        _ => "",
    };
    let response = Json(ContentResponse {
        html,
        fetched_at: served.entry.fetched_at.map(unix_millis),
    })
    .into_response();
    Ok(with_cache_headers(response, &served))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceHealth {
    kind: SourceKind,
    records: usize,
    fetched_at: Option<u64>,
    last_error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    total_sources: usize,
    active_sessions: usize,
    sources: IndexMap<String, SourceHealth>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache = state.aggregator.cache();
    let sources: IndexMap<String, SourceHealth> = state
        .aggregator
        .registry()
        .list_all()
        .into_iter()
        .map(|source| {
            let entry = cache.get(&source.name);
            let health = SourceHealth {
                kind: source.kind(),
                records: entry.as_ref().map_or(0, |e| e.payload.record_count()),
                fetched_at: entry.as_ref().and_then(|e| e.fetched_at).map(unix_millis),
                last_error: entry.and_then(|e| e.last_error),
            };
            (source.name, health)
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.aggregator.uptime().as_secs(),
        total_sources: sources.len(),
        active_sessions: state.sessions.len(),
        sources,
    })
}

#[derive(Deserialize, Debug, Default)]
struct RefreshRequest {
    name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceRefreshed {
    name: String,
    ok: bool,
    records: usize,
    fetched_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Refreshes one source when the body names it, otherwise every source. The
/// body is optional.
async fn refresh(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: RefreshRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RefreshRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let Some(name) = request.name else {
        let summary = state
            .scheduler
            .refresh_all()
            .await
            .ok_or(ApiError::WorkerStopped)?;
        return Ok(Json(summary).into_response());
    };

    let recorded = state
        .aggregator
        .refresh(&name)
        .await
        .ok_or_else(|| ApiError::UnknownSource(name.clone()))?;

    Ok(Json(SourceRefreshed {
        ok: recorded.is_fresh(),
        records: recorded.entry().payload.record_count(),
        fetched_at: recorded.entry().fetched_at.map(unix_millis),
        error: recorded.error().map(str::to_string),
        name,
    })
    .into_response())
}

async fn list_sources(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (documents, sources): (Vec<_>, Vec<_>) = state
        .aggregator
        .registry()
        .list_all()
        .into_iter()
        .partition(|source| source.kind() == SourceKind::Document);

    Json(json!({
        "sources": sources.into_iter().map(|s| s.name).collect::<Vec<_>>(),
        "documents": documents.into_iter().map(|s| s.name).collect::<Vec<_>>(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceStatus {
    kind: SourceKind,
    has_data: bool,
    dynamic: bool,
    hidden: bool,
    label: Option<String>,
    category: Option<String>,
    route: Option<String>,
    edit_url: Option<String>,
}

async fn sources_status(State(state): State<AppState>) -> Json<IndexMap<String, SourceStatus>> {
    let registry = state.aggregator.registry();
    let cache = state.aggregator.cache();

    let statuses = registry
        .list_all()
        .into_iter()
        .map(|source| {
            let metadata = source.metadata.clone().unwrap_or_default();
            let status = SourceStatus {
                kind: source.kind(),
                has_data: cache.get(&source.name).is_some_and(|e| e.has_data()),
                dynamic: !source.is_builtin(),
                hidden: registry.is_hidden(&source.name),
                label: metadata.label,
                category: metadata.category,
                route: metadata.route,
                edit_url: metadata.edit_url,
            };
            (source.name, status)
        })
        .collect();

    Json(statuses)
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    /// Seconds.
    expires_in: u64,
}

async fn login(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let session = state.sessions.login(&request.password)?;
    Ok(Json(LoginResponse {
        token: session.token,
        expires_in: session.expires_in.as_secs(),
    }))
}

async fn logout(State(state): State<AppState>, admin: AdminSession) -> Json<serde_json::Value> {
    state.sessions.logout(&admin.token);
    Json(json!({ "ok": true }))
}

async fn verify(_admin: AdminSession) -> Json<serde_json::Value> {
    Json(json!({ "valid": true }))
}

async fn list_dynamic(
    State(state): State<AppState>,
    _admin: AdminSession,
) -> Json<serde_json::Value> {
    Json(json!({ "sources": state.aggregator.registry().list_dynamic() }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    name: String,
    #[serde(flatten)]
    location: SourceLocation,
    label: Option<String>,
    category: Option<String>,
    route: Option<String>,
    edit_url: Option<String>,
}

#[derive(Serialize)]
struct RegisterResponse {
    ok: bool,
    source: SourceDescriptor,
    records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

async fn register_source(
    State(state): State<AppState>,
    _admin: AdminSession,
    JsonBody(request): JsonBody<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let metadata = DisplayMetadata {
        label: request.label,
        category: request.category,
        route: request.route,
        edit_url: request.edit_url,
        created_at: 0,
    };

    let (source, probe) = state
        .aggregator
        .register_source(&request.name, request.location, metadata)
        .await?;

    let (records, warning) = match probe {
        Ok(payload) => (payload.record_count(), None),
        Err(e) => (0, Some(format!("source saved but could not be fetched yet: {e}"))),
    };

    Ok(Json(RegisterResponse {
        ok: true,
        source,
        records,
        warning,
    }))
}

async fn remove_source(
    State(state): State<AppState>,
    _admin: AdminSession,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.aggregator.remove_source(&name).await?;
    Ok(Json(json!({ "ok": true, "removed": removed.name })))
}

async fn hide_source(
    State(state): State<AppState>,
    _admin: AdminSession,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let changed = state.aggregator.hide_source(&name).await?;
    Ok(Json(json!({ "ok": true, "name": name, "hidden": true, "changed": changed })))
}

async fn unhide_source(
    State(state): State<AppState>,
    _admin: AdminSession,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let changed = state.aggregator.unhide_source(&name).await?;
    Ok(Json(json!({ "ok": true, "name": name, "hidden": false, "changed": changed })))
}

async fn list_hidden(
    State(state): State<AppState>,
    _admin: AdminSession,
) -> Json<serde_json::Value> {
    Json(json!({ "hidden": state.aggregator.registry().hidden() }))
}
