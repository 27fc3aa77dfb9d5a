//! Request and response bodies of the HTTP surface.
//!
//! Images travel as base64-encoded PNG (a `data:` URL prefix is accepted).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::cache::{BodyCategory, RasterImage};
use crate::error::{Error, Result};
use crate::service::{GenerateOutcome, GenerateRequest, InputSources, PreprocessOutcome};

#[derive(Debug, Deserialize)]
pub struct BodyPreprocessRequest {
    pub user_id: String,
    pub image: String,
    #[serde(default)]
    pub category: BodyCategory,
}

#[derive(Debug, Deserialize)]
pub struct GarmentPreprocessRequest {
    pub garment_id: String,
    pub image: String,
}

#[derive(Debug, Deserialize)]
pub struct TextPreprocessRequest {
    pub garment_id: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequestBody {
    pub user_id: String,
    pub garment_id: String,
    #[serde(default)]
    pub category: BodyCategory,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
    pub description: Option<String>,
}

impl From<GenerateRequestBody> for GenerateRequest {
    fn from(body: GenerateRequestBody) -> Self {
        Self {
            user_id: body.user_id,
            garment_id: body.garment_id,
            category: body.category,
            steps: body.steps,
            seed: body.seed,
            description: body.description,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PreprocessResponse {
    pub status: &'static str,
    pub family: String,
    pub key: String,
    pub members: Vec<String>,
    pub size_bytes: u64,
    pub cached: bool,
}

impl From<PreprocessOutcome> for PreprocessResponse {
    fn from(outcome: PreprocessOutcome) -> Self {
        Self {
            status: "ok",
            family: outcome.family,
            key: outcome.key,
            members: outcome.members,
            size_bytes: outcome.size_bytes,
            cached: outcome.cached,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub status: &'static str,
    pub result_image: String,
    pub elapsed_ms: u64,
    pub queue_wait_ms: u64,
    pub ticket: u64,
    pub steps: u32,
    pub seed: u64,
    pub sources: InputSources,
}

impl GenerateResponse {
    pub fn from_outcome(outcome: &GenerateOutcome) -> Result<Self> {
        Ok(Self {
            status: "ok",
            result_image: encode_image(&outcome.image)?,
            elapsed_ms: outcome.elapsed.as_millis() as u64,
            queue_wait_ms: outcome.queue_wait.as_millis() as u64,
            ticket: outcome.ticket,
            steps: outcome.steps,
            seed: outcome.seed,
            sources: outcome.sources,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub status: &'static str,
    pub cleared: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn from_error(err: &Error) -> Self {
        Self {
            error: err.to_string(),
            kind: error_kind(err).to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Stable machine-readable name for an error
pub fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::NotCached { .. } => "not_cached",
        Error::GenerationBusy { .. } => "generation_busy",
        Error::Model { .. } => "model_failure",
        Error::Origin(_) => "origin_failure",
        Error::InvalidKey { .. } => "invalid_key",
        Error::IncompletePayload { .. } => "incomplete_payload",
        Error::BadRequest(_) | Error::Json(_) => "bad_request",
        Error::PayloadTooLarge { .. } => "payload_too_large",
        _ => "internal",
    }
}

/// Decode a base64 image body
pub fn decode_image(encoded: &str) -> Result<RasterImage> {
    let data = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| Error::BadRequest(format!("image is not valid base64: {}", e)))?;
    RasterImage::decode(&bytes).map_err(|e| Error::BadRequest(format!("image could not be decoded: {}", e)))
}

/// Encode an image as base64 PNG
pub fn encode_image(image: &RasterImage) -> Result<String> {
    Ok(STANDARD.encode(image.to_png()?))
}
