//! CPU reference pipeline.
//!
//! Deterministic stand-ins for every model stage so the service runs end to
//! end without accelerators. Outputs have the member names, kinds and
//! relative shapes of the real pipeline; the numbers are synthetic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbImage;

use super::{BodyPreprocessor, GarmentPreprocessor, GenerationInputs, TextEncoder, TryOnGenerator};
use crate::cache::{BodyCategory, Payload, PixelFormat, RasterImage, Tensor};
use crate::error::{Error, Result};

const NEGATIVE_PROMPT: &str = "monochrome, lowres, bad anatomy, worst quality, low quality";

/// Reference pipeline configuration
#[derive(Debug, Clone)]
pub struct ReferenceConfig {
    /// Working width of every image member
    pub width: u32,
    /// Working height of every image member
    pub height: u32,
    /// Tokens per prompt embedding
    pub embed_tokens: usize,
    /// Width of each token embedding
    pub embed_dim: usize,
    /// Width of pooled embeddings
    pub pooled_dim: usize,
    /// Artificial latency of each generation call
    pub generate_delay: Duration,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            width: 192,
            height: 256,
            embed_tokens: 77,
            embed_dim: 64,
            pooled_dim: 32,
            generate_delay: Duration::ZERO,
        }
    }
}

/// Deterministic CPU implementation of every model port
pub struct ReferencePipeline {
    config: ReferenceConfig,
    generations: AtomicU64,
    running: AtomicU64,
    peak_running: AtomicU64,
}

impl ReferencePipeline {
    pub fn new(config: ReferenceConfig) -> Self {
        Self {
            config,
            generations: AtomicU64::new(0),
            running: AtomicU64::new(0),
            peak_running: AtomicU64::new(0),
        }
    }

    /// Completed or started generation calls
    pub fn generations(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    /// Most generation calls ever observed running at once
    pub fn peak_concurrency(&self) -> u64 {
        self.peak_running.load(Ordering::SeqCst)
    }

    fn working_rgb(&self, image: &RasterImage) -> Result<RgbImage> {
        let rgb = to_rgb(image)?;
        Ok(imageops::resize(
            &rgb,
            self.config.width,
            self.config.height,
            FilterType::Triangle,
        ))
    }

    fn embedding(&self, text: &str, shape: Vec<usize>) -> Result<Tensor> {
        let numel: usize = shape.iter().product();
        let mut rng = XorShift::seeded(fnv1a(text.as_bytes()));
        let values: Vec<f32> = (0..numel).map(|_| rng.next_unit()).collect();
        Tensor::from_f32(shape, &values)
    }
}

#[async_trait]
impl BodyPreprocessor for ReferencePipeline {
    async fn preprocess_body(&self, image: &RasterImage, category: BodyCategory) -> Result<Payload> {
        let human = self.working_rgb(image)?;
        let (w, h) = human.dimensions();
        let (top, bottom) = garment_rows(category, h);
        let (left, right) = (w / 5, w - w / 5);
        let inside = |x: u32, y: u32| (left..right).contains(&x) && (top..bottom).contains(&y);

        let mut mask = Vec::with_capacity((w * h) as usize);
        let mut gray = Vec::with_capacity((w * h * 3) as usize);
        for (x, y, px) in human.enumerate_pixels() {
            if inside(x, y) {
                mask.push(255u8);
                gray.extend_from_slice(&[127, 127, 127]);
            } else {
                mask.push(0u8);
                gray.extend_from_slice(&px.0);
            }
        }

        let pose = normalized_chw(&human)?;
        Ok(Payload::new()
            .with("human_img", rgb_artifact(&human)?)
            .with("mask", RasterImage::new(w, h, PixelFormat::Luma8, Bytes::from(mask))?)
            .with("mask_gray", RasterImage::new(w, h, PixelFormat::Rgb8, Bytes::from(gray))?)
            .with("pose_img_tensor", pose))
    }
}

#[async_trait]
impl GarmentPreprocessor for ReferencePipeline {
    async fn preprocess_garment(&self, image: &RasterImage) -> Result<Payload> {
        let garment = self.working_rgb(image)?;
        let tensor = normalized_chw(&garment)?;
        Ok(Payload::new()
            .with("garm_img", rgb_artifact(&garment)?)
            .with("garm_tensor", tensor))
    }
}

#[async_trait]
impl TextEncoder for ReferencePipeline {
    async fn encode_text(&self, description: &str) -> Result<Payload> {
        let description = description.trim();
        if description.is_empty() {
            return Err(Error::Model {
                stage: "text".into(),
                reason: "empty garment description".into(),
            });
        }
        let prompt = format!("model wearing {}", description);
        let prompt_c = format!("a photo of {}", description);
        let tokens = vec![1, self.config.embed_tokens, self.config.embed_dim];
        let pooled = vec![1, self.config.pooled_dim];

        Ok(Payload::new()
            .with("prompt_embeds", self.embedding(&prompt, tokens.clone())?)
            .with("negative_prompt_embeds", self.embedding(NEGATIVE_PROMPT, tokens.clone())?)
            .with("pooled_prompt_embeds", self.embedding(&format!("pooled:{}", prompt), pooled.clone())?)
            .with(
                "negative_pooled_prompt_embeds",
                self.embedding(&format!("pooled:{}", NEGATIVE_PROMPT), pooled)?,
            )
            .with("prompt_embeds_c", self.embedding(&prompt_c, tokens)?))
    }
}

#[async_trait]
impl TryOnGenerator for ReferencePipeline {
    async fn generate(&self, inputs: GenerationInputs<'_>) -> Result<RasterImage> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);

        if !self.config.generate_delay.is_zero() {
            tokio::time::sleep(self.config.generate_delay).await;
        }
        let result = blend(inputs);
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn model_error(reason: impl Into<String>) -> Error {
    Error::Model {
        stage: "generate".into(),
        reason: reason.into(),
    }
}

fn blend(inputs: GenerationInputs<'_>) -> Result<RasterImage> {
    let human = inputs
        .human
        .image("human_img")
        .ok_or_else(|| model_error("human_img missing"))?;
    let mask = inputs.human.image("mask").ok_or_else(|| model_error("mask missing"))?;
    let garment = inputs
        .garment
        .image("garm_img")
        .ok_or_else(|| model_error("garm_img missing"))?;
    if inputs.text.tensor("prompt_embeds").is_none() {
        return Err(model_error("prompt_embeds missing"));
    }

    let human = to_rgb(human)?;
    let (w, h) = human.dimensions();
    let garment = imageops::resize(&to_rgb(garment)?, w, h, FilterType::Triangle);
    let mask = to_rgb(mask)?;
    if mask.dimensions() != (w, h) {
        return Err(model_error("mask and human image sizes differ"));
    }

    let alpha = inputs.steps.min(50) as f32 / 50.0;
    let mut rng = XorShift::seeded(inputs.seed ^ 0x9E37_79B9_7F4A_7C15);
    let mut out = Vec::with_capacity((w * h * 3) as usize);
    for (x, y, px) in human.enumerate_pixels() {
        let covered = mask.get_pixel(x, y).0[0] > 127;
        let g = garment.get_pixel(x, y).0;
        for c in 0..3 {
            let value = if covered {
                g[c] as f32 * alpha + px.0[c] as f32 * (1.0 - alpha)
            } else {
                px.0[c] as f32
            };
            let noise = (rng.next_u64() % 3) as f32 - 1.0;
            out.push((value + noise).round().clamp(0.0, 255.0) as u8);
        }
    }
    RasterImage::new(w, h, PixelFormat::Rgb8, Bytes::from(out))
}

/// Rows the garment region spans for a category
fn garment_rows(category: BodyCategory, height: u32) -> (u32, u32) {
    let (top, bottom) = match category {
        BodyCategory::UpperBody => (0.20, 0.60),
        BodyCategory::LowerBody => (0.50, 0.95),
        BodyCategory::Dresses => (0.20, 0.95),
    };
    ((height as f32 * top) as u32, (height as f32 * bottom) as u32)
}

fn to_rgb(image: &RasterImage) -> Result<RgbImage> {
    let (w, h) = (image.width(), image.height());
    let pixels = image.pixels();
    let raw: Vec<u8> = match image.format() {
        PixelFormat::Rgb8 => pixels.to_vec(),
        PixelFormat::Rgba8 => pixels
            .chunks_exact(4)
            .flat_map(|p| [p[0], p[1], p[2]])
            .collect(),
        PixelFormat::Luma8 => pixels.iter().flat_map(|&v| [v, v, v]).collect(),
    };
    RgbImage::from_raw(w, h, raw).ok_or_else(|| model_error("pixel buffer does not match dimensions"))
}

fn rgb_artifact(image: &RgbImage) -> Result<RasterImage> {
    let (w, h) = image.dimensions();
    RasterImage::new(w, h, PixelFormat::Rgb8, Bytes::from(image.as_raw().clone()))
}

/// `[1, 3, h, w]` tensor of pixels scaled to [-1, 1]
fn normalized_chw(image: &RgbImage) -> Result<Tensor> {
    let (w, h) = image.dimensions();
    let plane = (w * h) as usize;
    let mut values = vec![0f32; plane * 3];
    for (i, px) in image.pixels().enumerate() {
        for c in 0..3 {
            values[c * plane + i] = px.0[c] as f32 / 127.5 - 1.0;
        }
    }
    Tensor::from_f32(vec![1, 3, h as usize, w as usize], &values)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

struct XorShift(u64);

impl XorShift {
    fn seeded(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform in [-1, 1)
    fn next_unit(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 23) as f32 - 1.0
    }
}

// =============================================================================
// Tests
// =============================================================================
