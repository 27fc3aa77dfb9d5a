//! VTON Cache - Tiered Preprocessing Cache for Virtual Try-On
//!
//! Caches the per-user, per-garment and per-description intermediates of a
//! diffusion try-on pipeline so repeat generations skip preprocessing, and
//! serializes access to the single accelerator-bound generation step.
//!
//! # Architecture
//!
//! ```text
//! HTTP (hyper) → TryOnService → TieredCache (L1 memory → L2 disk)
//!                     │                │
//!                     │                └── OriginStore (L3, warm-up source)
//!                     └── GenerationGate → TryOnGenerator
//! ```
//!
//! # Modules
//!
//! - [`cache`] - L1/L2 tiers, stampede guard, origin port, facade
//! - [`error`] - Error types
//! - [`generation`] - FIFO admission for the generation step
//! - [`models`] - Model collaborator traits and the CPU reference pipeline
//! - [`server`] - HTTP routes and Prometheus exposition
//! - [`service`] - Request orchestration over cache, origin and models

pub mod cache;
pub mod error;
pub mod generation;
pub mod models;
pub mod server;
pub mod service;

// Re-export commonly used types
pub use cache::{BodyCategory, CacheConfig, CacheFamily, CacheTier, Payload, TieredCache};
pub use error::{Error, Result};
pub use generation::{GateConfig, GenerationGate};
pub use models::ModelSet;
pub use service::{GenerateRequest, ServiceConfig, TryOnService};
