use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::Config,
    engine::MediaEngine,
    error::{ApiError, ConfigError},
    format::{DownloadRequest, MediaFormat},
    history::{HistoryRecord, HistoryStore},
    orchestrator::Orchestrator,
    scratch::ScratchDir,
};

const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
    history: Arc<dyn HistoryStore>,
    download_semaphore: Arc<Semaphore>,
    authorization_digest: [u8; 32],
    config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Config,
        engine: Arc<dyn MediaEngine>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(engine, config.max_download_retries),
            history,
            download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            authorization_digest: digest(&format!("Bearer {}", config.api_key)),
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    format: Option<String>,
    quality: Option<String>,
}

pub fn build_router(state: AppState) -> Result<Router, ConfigError> {
    let cors = build_cors_layer(state.config.allowed_origins.as_deref())?;

    let protected = Router::new()
        .route("/download_get", get(download_get))
        .route("/history", get(history))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Ok(Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors))
}

async fn index(State(state): State<AppState>) -> String {
    format!("{} Backend Running!", state.config.brand_name)
}

async fn healthz() -> &'static str {
    "OK"
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if digest(provided) != state.authorization_digest {
        return Err(ApiError::unauthorized());
    }

    Ok(next.run(request).await)
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

async fn history(State(state): State<AppState>) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    Ok(Json(state.history.list_all().await?))
}

async fn download_get(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let url = query.url.as_deref().map(str::trim).unwrap_or_default();
    let format = query.format.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() || format.is_empty() {
        return Err(ApiError::bad_request("Missing url or format"));
    }
    // Engine pseudo-URLs such as `ytsearch:` are rejected here as well.
    if !is_http_url(url) {
        return Err(ApiError::bad_request("Invalid url: expected an http(s) address"));
    }

    let request = DownloadRequest::new(url, format, query.quality.as_deref())?;

    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Download capacity is unavailable"))?;

    let scratch = ScratchDir::create(&state.config.scratch_root).await?;

    let result = serve_artifact(&state, &request, scratch).await;
    if let Err(error) = &result {
        error!(url = %request.url, format = %request.format, "Download error: {}", error.message);
    }
    result
}

/// Locates, records and streams one artifact. `scratch` moves into the body
/// stream so the directory lives until the last chunk is sent.
async fn serve_artifact(
    state: &AppState,
    request: &DownloadRequest,
    scratch: ScratchDir,
) -> Result<Response, ApiError> {
    let located = state
        .orchestrator
        .fetch(request, &scratch.template())
        .await?;

    state
        .history
        .append(&request.url, request.format, &request.quality)
        .await?;

    let file = tokio::fs::File::open(&located.path)
        .await
        .map_err(|error| ApiError::internal(format!("Could not open downloaded file: {error}")))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read downloaded file: {error}")))?;

    let stream = ReaderStream::new(file).map(move |chunk| {
        let _scratch = &scratch;
        chunk
    });

    let filename = download_filename(&state.config.brand_name, request.format);
    let headers = attachment_headers(&filename, request.format, metadata.len())?;
    Ok((headers, Body::from_stream(stream)).into_response())
}

fn attachment_headers(
    filename: &str,
    format: MediaFormat,
    content_length: u64,
) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("Could not build download header"))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(filename))
            .map_err(|_| ApiError::internal("Could not build download filename"))?,
    );
    Ok(headers)
}

fn download_filename(brand: &str, format: MediaFormat) -> String {
    format!("{brand}.{format}")
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn is_http_url(input: &str) -> bool {
    Url::parse(input)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some())
        .unwrap_or(false)
}

fn build_cors_layer(configured: Option<&[String]>) -> Result<CorsLayer, ConfigError> {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]);

    let Some(origins) = configured.filter(|origins| !origins.is_empty()) else {
        warn!("ALLOWED_ORIGINS is not set. Requests from any origin are allowed.");
        return Ok(base.allow_origin(Any));
    };

    let allowed_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| ConfigError::InvalidOrigin(origin.clone()))
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(allowed_origins);
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    Ok(base.allow_origin(allow_origin))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
