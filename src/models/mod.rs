//! Model Collaborators
//!
//! Ports for the inference stages the service drives. Implementations own
//! their devices and weights; the service only sees payloads in and payloads
//! out, named after the members each cache family expects.

mod reference;

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::{BodyCategory, Payload, RasterImage};
use crate::error::Result;

pub use reference::{ReferenceConfig, ReferencePipeline};

/// Produces a human-body record: `human_img`, `mask`, `mask_gray`,
/// `pose_img_tensor`
#[async_trait]
pub trait BodyPreprocessor: Send + Sync {
    async fn preprocess_body(&self, image: &RasterImage, category: BodyCategory) -> Result<Payload>;
}

/// Produces a garment record: `garm_img`, `garm_tensor`
#[async_trait]
pub trait GarmentPreprocessor: Send + Sync {
    async fn preprocess_garment(&self, image: &RasterImage) -> Result<Payload>;
}

/// Produces a text record: the five prompt embedding tensors
#[async_trait]
pub trait TextEncoder: Send + Sync {
    async fn encode_text(&self, description: &str) -> Result<Payload>;
}

/// Everything one generation call consumes
#[derive(Debug, Clone, Copy)]
pub struct GenerationInputs<'a> {
    pub human: &'a Payload,
    pub garment: &'a Payload,
    pub text: &'a Payload,
    pub category: BodyCategory,
    pub steps: u32,
    pub seed: u64,
}

/// The accelerator-bound try-on generation step.
///
/// Must only be invoked through the generation gate.
#[async_trait]
pub trait TryOnGenerator: Send + Sync {
    async fn generate(&self, inputs: GenerationInputs<'_>) -> Result<RasterImage>;
}

/// The full set of collaborators a service runs with
#[derive(Clone)]
pub struct ModelSet {
    pub body: Arc<dyn BodyPreprocessor>,
    pub garment: Arc<dyn GarmentPreprocessor>,
    pub text: Arc<dyn TextEncoder>,
    pub generator: Arc<dyn TryOnGenerator>,
}

impl ModelSet {
    /// Every stage served by the CPU reference pipeline
    pub fn reference(config: ReferenceConfig) -> Self {
        let pipeline = Arc::new(ReferencePipeline::new(config));
        Self {
            body: pipeline.clone(),
            garment: pipeline.clone(),
            text: pipeline.clone(),
            generator: pipeline,
        }
    }
}
