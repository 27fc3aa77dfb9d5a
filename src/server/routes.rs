//! HTTP routing and handlers.
//!
//! ```text
//! POST   /preprocess/body        body image      -> human record
//! POST   /preprocess/garment     garment image   -> garment record
//! POST   /preprocess/text        description     -> text record
//! POST   /generate               ids + params    -> try-on image
//! GET    /cache/stats            JSON snapshot
//! GET    /metrics                Prometheus text
//! GET    /healthz                liveness
//! DELETE /cache/user/{id}        drop a user's body records
//! DELETE /cache/garment/{id}     drop a garment's records
//! DELETE /cache/all              drop everything
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::dto::{
    decode_image, BodyPreprocessRequest, ErrorResponse, GarmentPreprocessRequest, GenerateRequestBody,
    GenerateResponse, InvalidateResponse, PreprocessResponse, TextPreprocessRequest,
};
use super::exposition::MetricsExporter;
use crate::error::{Error, Result};
use crate::service::TryOnService;

/// Shared state behind every connection
pub struct AppState {
    pub service: Arc<TryOnService>,
    pub exporter: MetricsExporter,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(service: Arc<TryOnService>, max_body_bytes: usize) -> Result<Self> {
        Ok(Self {
            service,
            exporter: MetricsExporter::new()?,
            max_body_bytes,
        })
    }
}

// =============================================================================
// Routing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    PreprocessBody,
    PreprocessGarment,
    PreprocessText,
    Generate,
    CacheStats,
    Metrics,
    Health,
    InvalidateUser(&'a str),
    InvalidateGarment(&'a str),
    InvalidateAll,
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let route = match segments.as_slice() {
            ["preprocess", "body"] => Route::PreprocessBody,
            ["preprocess", "garment"] => Route::PreprocessGarment,
            ["preprocess", "text"] => Route::PreprocessText,
            ["generate"] => Route::Generate,
            ["cache", "stats"] => Route::CacheStats,
            ["metrics"] => Route::Metrics,
            ["healthz"] | ["livez"] | ["readyz"] => Route::Health,
            ["cache", "all"] => Route::InvalidateAll,
            ["cache", "user", id] => Route::InvalidateUser(*id),
            ["cache", "garment", id] => Route::InvalidateGarment(*id),
            _ => return None,
        };
        Some(route)
    }

    fn method(&self) -> Method {
        match self {
            Route::PreprocessBody | Route::PreprocessGarment | Route::PreprocessText | Route::Generate => {
                Method::POST
            }
            Route::CacheStats | Route::Metrics | Route::Health => Method::GET,
            Route::InvalidateUser(_) | Route::InvalidateGarment(_) | Route::InvalidateAll => Method::DELETE,
        }
    }

    /// Low-cardinality name used as a metric label
    fn label(&self) -> &'static str {
        match self {
            Route::PreprocessBody => "/preprocess/body",
            Route::PreprocessGarment => "/preprocess/garment",
            Route::PreprocessText => "/preprocess/text",
            Route::Generate => "/generate",
            Route::CacheStats => "/cache/stats",
            Route::Metrics => "/metrics",
            Route::Health => "/healthz",
            Route::InvalidateUser(_) => "/cache/user",
            Route::InvalidateGarment(_) => "/cache/garment",
            Route::InvalidateAll => "/cache/all",
        }
    }
}

/// Serve one request. Never fails: every error becomes a JSON response.
pub async fn handle<B>(state: Arc<AppState>, req: Request<B>) -> std::result::Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let (label, response) = match Route::parse(&path) {
        None => (
            "unmatched",
            message_response(StatusCode::NOT_FOUND, "not_found", format!("no route for {}", path)),
        ),
        Some(route) if route.method() != method => {
            let mut response = message_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                format!("{} does not accept {}", route.label(), method),
            );
            if let Ok(allow) = HeaderValue::from_str(route.method().as_str()) {
                response.headers_mut().insert(ALLOW, allow);
            }
            (route.label(), response)
        }
        Some(route) => {
            let response = match dispatch(&state, route, req).await {
                Ok(response) => response,
                Err(e) => error_response(&e),
            };
            (route.label(), response)
        }
    };

    let status = response.status();
    state
        .exporter
        .record_request(label, status.as_u16(), started.elapsed().as_secs_f64());
    debug!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request served"
    );
    Ok(response)
}

async fn dispatch<B>(state: &AppState, route: Route<'_>, req: Request<B>) -> Result<Response<Full<Bytes>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let service = &state.service;
    match route {
        Route::PreprocessBody => {
            let body: BodyPreprocessRequest = read_json(req, state.max_body_bytes).await?;
            let image = decode_image(&body.image)?;
            let outcome = service.preprocess_body(&body.user_id, &image, body.category).await?;
            Ok(json_response(StatusCode::OK, &PreprocessResponse::from(outcome)))
        }
        Route::PreprocessGarment => {
            let body: GarmentPreprocessRequest = read_json(req, state.max_body_bytes).await?;
            let image = decode_image(&body.image)?;
            let outcome = service.preprocess_garment(&body.garment_id, &image).await?;
            Ok(json_response(StatusCode::OK, &PreprocessResponse::from(outcome)))
        }
        Route::PreprocessText => {
            let body: TextPreprocessRequest = read_json(req, state.max_body_bytes).await?;
            let outcome = service.preprocess_text(&body.garment_id, &body.description).await?;
            Ok(json_response(StatusCode::OK, &PreprocessResponse::from(outcome)))
        }
        Route::Generate => {
            let body: GenerateRequestBody = read_json(req, state.max_body_bytes).await?;
            let outcome = service.generate(body.into()).await?;
            let response = GenerateResponse::from_outcome(&outcome)?;
            Ok(json_response(StatusCode::OK, &response))
        }
        Route::CacheStats => Ok(json_response(StatusCode::OK, &service.stats())),
        Route::Metrics => {
            let (body, content_type) = state.exporter.render(&service.stats())?;
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            Ok(response)
        }
        Route::Health => Ok(json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }))),
        Route::InvalidateUser(user_id) => {
            service.invalidate_user(user_id).await?;
            Ok(invalidated(format!("user:{}", user_id)))
        }
        Route::InvalidateGarment(garment_id) => {
            service.invalidate_garment(garment_id).await?;
            Ok(invalidated(format!("garment:{}", garment_id)))
        }
        Route::InvalidateAll => {
            service.invalidate_all().await?;
            Ok(invalidated("all".to_string()))
        }
    }
}

// =============================================================================
// Body and response helpers
// =============================================================================

async fn read_json<T, B>(req: Request<B>, limit: usize) -> Result<T>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(Error::PayloadTooLarge { limit });
    }

    let collected = Limited::new(req.into_body(), limit).collect().await.map_err(|e| {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            Error::PayloadTooLarge { limit }
        } else {
            Error::BadRequest(format!("failed to read request body: {}", e))
        }
    })?;
    Ok(serde_json::from_slice(&collected.to_bytes())?)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!("Failed to serialize response body: {}", e);
            let mut response = Response::new(Full::new(Bytes::from_static(b"internal error")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn message_response(status: StatusCode, kind: &str, message: String) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorResponse {
            error: message,
            kind: kind.to_string(),
            retryable: false,
        },
    )
}

fn invalidated(cleared: String) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &InvalidateResponse { status: "ok", cleared })
}

/// HTTP status for a service error
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotCached { .. } => StatusCode::NOT_FOUND,
        Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::GenerationBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::Model { .. } | Error::Origin(_) => StatusCode::BAD_GATEWAY,
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> Response<Full<Bytes>> {
    let status = status_for(err);
    if status.is_server_error() {
        warn!(status = status.as_u16(), "Request failed: {}", err);
    } else {
        debug!(status = status.as_u16(), "Request rejected: {}", err);
    }

    let mut response = json_response(status, &ErrorResponse::from_error(err));
    if let Error::GenerationBusy { waited_ms } = err {
        let secs = (waited_ms / 1000).max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
    }
    response
}

// =============================================================================
// Tests
// =============================================================================
