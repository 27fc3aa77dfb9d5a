//! Try-On Service
//!
//! Composes the tiered cache, the origin store, the model collaborators and
//! the generation gate. This is where misses turn into origin fetches or
//! model runs; the cache itself never calls either.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::{
    validate_key, BodyCategory, CacheFamily, CacheResult, CacheStats, CacheTier, MaintenanceReport,
    OriginClient, OriginStats, Payload, RasterImage, TieredCache,
};
use crate::error::{Error, Result};
use crate::generation::{GateStats, GenerationGate};
use crate::models::{GenerationInputs, ModelSet};

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Denoising steps when the request does not say
    pub default_steps: u32,
    /// Seed when the request does not say
    pub default_seed: u64,
    /// Upper bound on requested steps
    pub max_steps: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_steps: 20,
            default_seed: 42,
            max_steps: 100,
        }
    }
}

/// A generation request
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub user_id: String,
    pub garment_id: String,
    pub category: BodyCategory,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
    /// Used to encode the text record when neither cache nor origin has it
    pub description: Option<String>,
}

/// Result of a preprocessing call
#[derive(Debug, Clone, Serialize)]
pub struct PreprocessOutcome {
    pub family: String,
    pub key: String,
    pub members: Vec<String>,
    pub size_bytes: u64,
    /// True when the record was already cached and no model ran
    pub cached: bool,
    #[serde(skip)]
    pub payload: Arc<Payload>,
}

/// Tier each generation input came from
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InputSources {
    pub human: CacheTier,
    pub garment: CacheTier,
    pub text: CacheTier,
}

/// Result of a generation call
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub image: RasterImage,
    pub elapsed: Duration,
    pub queue_wait: Duration,
    pub ticket: u64,
    pub steps: u32,
    pub seed: u64,
    pub sources: InputSources,
}

/// Service-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub generation: GateStats,
    pub origin: OriginStats,
}

/// The try-on service
pub struct TryOnService {
    cache: Arc<TieredCache>,
    origin: OriginClient,
    models: ModelSet,
    gate: GenerationGate,
    config: ServiceConfig,
}

impl TryOnService {
    pub fn new(
        cache: Arc<TieredCache>,
        origin: OriginClient,
        models: ModelSet,
        gate: GenerationGate,
        config: ServiceConfig,
    ) -> Self {
        Self {
            cache,
            origin,
            models,
            gate,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn gate(&self) -> &GenerationGate {
        &self.gate
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // =========================================================================
    // Preprocessing
    // =========================================================================

    /// Run body preprocessing and write the result through every tier
    pub async fn preprocess_body(
        &self,
        user_id: &str,
        image: &RasterImage,
        category: BodyCategory,
    ) -> Result<PreprocessOutcome> {
        validate_key(user_id)?;
        let family = CacheFamily::Human(category);
        let payload = self
            .models
            .body
            .preprocess_body(image, category)
            .await
            .map_err(|e| log_model_failure(family, user_id, e))?;
        self.store(family, user_id, payload).await
    }

    /// Run garment preprocessing and write the result through every tier
    pub async fn preprocess_garment(&self, garment_id: &str, image: &RasterImage) -> Result<PreprocessOutcome> {
        validate_key(garment_id)?;
        let family = CacheFamily::Garment;
        let payload = self
            .models
            .garment
            .preprocess_garment(image)
            .await
            .map_err(|e| log_model_failure(family, garment_id, e))?;
        self.store(family, garment_id, payload).await
    }

    /// Encode a garment description, skipping the encoder when the text
    /// record is already cached
    pub async fn preprocess_text(&self, garment_id: &str, description: &str) -> Result<PreprocessOutcome> {
        if let Some(payload) = self.cache.get_text(garment_id).await? {
            info!(garment_id, "Text embeddings already cached");
            return Ok(outcome(CacheFamily::Text, garment_id, payload, true));
        }
        let payload = self.encode_text(garment_id, description).await?;
        self.store(CacheFamily::Text, garment_id, payload).await
    }

    async fn encode_text(&self, garment_id: &str, description: &str) -> Result<Payload> {
        self.models
            .text
            .encode_text(description)
            .await
            .map_err(|e| log_model_failure(CacheFamily::Text, garment_id, e))
    }

    async fn store(&self, family: CacheFamily, key: &str, payload: Payload) -> Result<PreprocessOutcome> {
        let stored = self.cache.put(family, key, payload).await?;
        self.mirror_to_origin(family, key, &stored).await;
        info!(family = %family, key, size_bytes = stored.size_bytes(), "Preprocessed and cached");
        Ok(outcome(family, key, stored, false))
    }

    async fn mirror_to_origin(&self, family: CacheFamily, key: &str, payload: &Payload) {
        if let Err(e) = self.origin.upload(family, key, payload).await {
            warn!(family = %family, key, error = %e, "Origin upload failed, record is local only");
        }
    }

    // =========================================================================
    // Generation
    // =========================================================================

    /// Resolve all three inputs, then run the generator through the gate
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateOutcome> {
        let start = Instant::now();
        let steps = request.steps.unwrap_or(self.config.default_steps);
        if steps == 0 || steps > self.config.max_steps {
            return Err(Error::BadRequest(format!(
                "steps must be between 1 and {}",
                self.config.max_steps
            )));
        }
        let seed = request.seed.unwrap_or(self.config.default_seed);
        let human_family = CacheFamily::Human(request.category);

        let (human, garment, text) = tokio::try_join!(
            self.resolve(human_family, &request.user_id),
            self.resolve(CacheFamily::Garment, &request.garment_id),
            self.resolve_text(&request.garment_id, request.description.as_deref()),
        )?;

        let inputs = GenerationInputs {
            human: &human.payload,
            garment: &garment.payload,
            text: &text.payload,
            category: request.category,
            steps,
            seed,
        };
        let generator = &self.models.generator;
        let (image, receipt) = self
            .gate
            .run(|| async move { generator.generate(inputs).await })
            .await
            .map_err(|e| {
                if !e.is_retryable() {
                    error!(user_id = %request.user_id, garment_id = %request.garment_id, error = %e, "Generation failed");
                }
                e
            })?;

        let elapsed = start.elapsed();
        info!(
            user_id = %request.user_id,
            garment_id = %request.garment_id,
            ticket = receipt.ticket,
            elapsed_ms = elapsed.as_millis() as u64,
            "Generation complete"
        );
        Ok(GenerateOutcome {
            image,
            elapsed,
            queue_wait: receipt.queue_wait,
            ticket: receipt.ticket,
            steps,
            seed,
            sources: InputSources {
                human: human.tier,
                garment: garment.tier,
                text: text.tier,
            },
        })
    }

    /// Cache tiers, then origin; `NotCached` when nobody has the record
    async fn resolve(&self, family: CacheFamily, key: &str) -> Result<CacheResult> {
        let origin = &self.origin;
        self.cache
            .get_or_fetch(family, key, || async move { origin.fetch(family, key).await })
            .await
            .map_err(|e| log_origin_failure(family, key, e))?
            .ok_or_else(|| Error::NotCached {
                family: family.to_string(),
                key: key.to_string(),
            })
    }

    /// Like `resolve`, but a description lets the encoder fill a total miss
    async fn resolve_text(&self, garment_id: &str, description: Option<&str>) -> Result<CacheResult> {
        let family = CacheFamily::Text;
        let fetch = move || async move {
            if let Some(payload) = self.origin.fetch(family, garment_id).await? {
                return Ok::<_, Error>(Some(payload));
            }
            match description {
                Some(description) => {
                    let payload = self.encode_text(garment_id, description).await?;
                    self.mirror_to_origin(family, garment_id, &payload).await;
                    Ok(Some(payload))
                }
                None => Ok(None),
            }
        };
        self.cache
            .get_or_fetch(family, garment_id, fetch)
            .await
            .map_err(|e| log_origin_failure(family, garment_id, e))?
            .ok_or_else(|| Error::NotCached {
                family: family.to_string(),
                key: garment_id.to_string(),
            })
    }

    // =========================================================================
    // Invalidation, maintenance, stats
    // =========================================================================

    pub async fn invalidate_user(&self, user_id: &str) -> Result<()> {
        self.cache.clear_user(user_id).await
    }

    pub async fn invalidate_garment(&self, garment_id: &str) -> Result<()> {
        self.cache.clear_garment(garment_id).await
    }

    pub async fn invalidate_all(&self) -> Result<()> {
        self.cache.clear_all().await
    }

    pub async fn maintenance(&self) -> MaintenanceReport {
        self.cache.maintenance().await
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats(),
            generation: self.gate.stats(),
            origin: self.origin.store().stats(),
        }
    }
}

fn outcome(family: CacheFamily, key: &str, payload: Arc<Payload>, cached: bool) -> PreprocessOutcome {
    PreprocessOutcome {
        family: family.to_string(),
        key: key.to_string(),
        members: payload.names().map(str::to_string).collect(),
        size_bytes: payload.size_bytes(),
        cached,
        payload,
    }
}

fn log_model_failure(family: CacheFamily, key: &str, e: Error) -> Error {
    error!(family = %family, key, error = %e, "Preprocessing failed");
    e
}

fn log_origin_failure(family: CacheFamily, key: &str, e: Error) -> Error {
    if matches!(e, Error::Origin(_) | Error::Model { .. }) {
        error!(family = %family, key, error = %e, "Origin resolution failed");
    }
    e
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, InMemoryOriginStore, L2Config, PixelFormat};
    use crate::generation::GateConfig;
    use crate::models::ReferenceConfig;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        service: TryOnService,
        origin: Arc<InMemoryOriginStore>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache = TieredCache::open(CacheConfig {
            l2: L2Config {
                root: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let origin = Arc::new(InMemoryOriginStore::new());
        let models = ModelSet::reference(ReferenceConfig {
            width: 12,
            height: 16,
            embed_tokens: 2,
            embed_dim: 4,
            pooled_dim: 2,
            ..Default::default()
        });
        let service = TryOnService::new(
            Arc::new(cache),
            OriginClient::new(origin.clone()),
            models,
            GenerationGate::with_config(GateConfig::default()),
            ServiceConfig::default(),
        );
        Fixture {
            service,
            origin,
            _dir: dir,
        }
    }

    fn photo() -> RasterImage {
        RasterImage::new(8, 8, PixelFormat::Rgb8, Bytes::from(vec![90u8; 192])).unwrap()
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            user_id: "u1".into(),
            garment_id: "g1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_preprocess_mirrors_to_origin() {
        let f = fixture();
        let out = f.service.preprocess_garment("g1", &photo()).await.unwrap();
        assert_eq!(out.members, vec!["garm_img", "garm_tensor"]);
        assert!(!out.cached);
        assert_eq!(f.origin.len(), 2);
    }

    #[tokio::test]
    async fn test_preprocess_text_skips_encoder_when_cached() {
        let f = fixture();
        assert!(!f.service.preprocess_text("g1", "denim jacket").await.unwrap().cached);
        assert!(f.service.preprocess_text("g1", "denim jacket").await.unwrap().cached);
    }

    #[tokio::test]
    async fn test_generate_end_to_end() {
        let f = fixture();
        f.service.preprocess_body("u1", &photo(), BodyCategory::UpperBody).await.unwrap();
        f.service.preprocess_garment("g1", &photo()).await.unwrap();
        f.service.preprocess_text("g1", "linen shirt").await.unwrap();

        let out = f.service.generate(request()).await.unwrap();
        assert_eq!((out.image.width(), out.image.height()), (12, 16));
        assert_eq!(out.steps, 20);
        assert_eq!(out.seed, 42);
        assert_eq!(out.ticket, 1);
        assert_eq!(out.sources.human, CacheTier::L1);
    }

    #[tokio::test]
    async fn test_generate_without_data_is_not_cached() {
        let f = fixture();
        assert_matches!(
            f.service.generate(request()).await,
            Err(Error::NotCached { .. })
        );
    }

    #[tokio::test]
    async fn test_generate_falls_back_to_origin() {
        let f = fixture();
        f.service.preprocess_body("u1", &photo(), BodyCategory::UpperBody).await.unwrap();
        f.service.preprocess_garment("g1", &photo()).await.unwrap();
        f.service.preprocess_text("g1", "linen shirt").await.unwrap();
        f.service.invalidate_all().await.unwrap();

        let out = f.service.generate(request()).await.unwrap();
        assert_eq!(out.sources.human, CacheTier::Origin);
        assert_eq!(out.sources.garment, CacheTier::Origin);
        assert_eq!(out.sources.text, CacheTier::Origin);
        assert!(f.service.cache().get_garment("g1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_generate_encodes_missing_text_from_description() {
        let f = fixture();
        f.service.preprocess_body("u1", &photo(), BodyCategory::UpperBody).await.unwrap();
        f.service.preprocess_garment("g1", &photo()).await.unwrap();

        let out = f
            .service
            .generate(GenerateRequest {
                description: Some("wool coat".into()),
                ..request()
            })
            .await
            .unwrap();
        assert_eq!(out.sources.text, CacheTier::Origin);
        assert!(f.service.cache().get_text("g1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_generate_rejects_bad_steps() {
        let f = fixture();
        let result = f
            .service
            .generate(GenerateRequest {
                steps: Some(0),
                ..request()
            })
            .await;
        assert_matches!(result, Err(Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_before_model_runs() {
        let f = fixture();
        assert_matches!(
            f.service.preprocess_garment("bad/key", &photo()).await,
            Err(Error::InvalidKey { .. })
        );
        assert!(f.origin.is_empty());
    }
}
