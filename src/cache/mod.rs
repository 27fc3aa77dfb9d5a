//! Tiered Preprocessing Cache
//!
//! Stages the expensive intermediate artifacts of the try-on pipeline (body
//! masks and pose tensors, garment tensors, text embeddings) so repeat
//! requests skip GPU preprocessing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         TieredCache (facade)                             │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  per family: human_{upper_body,lower_body,dresses} │ garment │ text      │
//! │  ┌────────────────┐   ┌──────────────────┐                               │
//! │  │ L1Cache (LRU,  │   │ ConcurrencyGuard │   one miss resolution per key │
//! │  │ adaptive TTL)  │   │ (lock + Notify)  │                               │
//! │  └────────────────┘   └──────────────────┘                               │
//! │                 │                                                         │
//! │        L2DiskTier (directory per record, quota sweep)                    │
//! │                 │                                                         │
//! │        OriginStore (object storage, driven by the service layer)         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - A miss is a normal outcome, never an error
//! - Disk-tier failures degrade to a miss or a memory-only entry
//! - Population writes L1 before L2
//! - Independent keys never wait on each other

mod artifact;
mod compression;
mod entry;
mod family;
mod guard;
mod l1;
mod l2;
mod l3;
mod manager;
mod metrics;

pub use artifact::{Artifact, ArtifactKind, ArtifactStore, DType, PixelFormat, RasterImage, Tensor};
pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager, Compressor};
pub use entry::{ttl_multiplier, CacheEntry, Payload, HOT_ACCESS_THRESHOLD, VERY_HOT_ACCESS_THRESHOLD};
pub use family::{
    validate_key, BodyCategory, CacheFamily, GARMENT_MEMBERS, HUMAN_MEMBERS, MAX_KEY_LEN, TEXT_MEMBERS,
};
pub use guard::{ConcurrencyGuard, GuardConfig, GuardStats, Resolution};
pub use l1::{L1Cache, L1Config, L1Stats, DEFAULT_BASE_TTL};
pub use l2::{L2Config, L2DiskTier, L2Stats, SweepReport, DEFAULT_L2_QUOTA, DEFAULT_TARGET_RATIO};
pub use l3::{object_key, InMemoryOriginStore, LocalOriginStore, OriginClient, OriginStats, OriginStore};
pub use manager::{CacheConfig, CacheResult, CacheTier, MaintenanceReport, TieredCache};
pub use metrics::{CacheStats, CacheTotals, FamilyMetrics, FamilyStats};
