//! Cache Families
//!
//! Independent namespaces of the cache. Each family has its own L1 capacity,
//! its own L2 directory and a fixed set of members a record must carry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum accepted cache key length in bytes
pub const MAX_KEY_LEN: usize = 128;

/// Members of a human-body record
pub const HUMAN_MEMBERS: &[&str] = &["human_img", "mask", "mask_gray", "pose_img_tensor"];

/// Members of a garment record
pub const GARMENT_MEMBERS: &[&str] = &["garm_img", "garm_tensor"];

/// Members of a text-embedding record
pub const TEXT_MEMBERS: &[&str] = &[
    "prompt_embeds",
    "negative_prompt_embeds",
    "pooled_prompt_embeds",
    "negative_pooled_prompt_embeds",
    "prompt_embeds_c",
];

/// Body region a human record was preprocessed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BodyCategory {
    /// Tops
    #[default]
    #[serde(alias = "upper")]
    UpperBody,
    /// Trousers, skirts
    #[serde(alias = "lower")]
    LowerBody,
    /// Full-length garments
    #[serde(alias = "full", alias = "full_body")]
    Dresses,
}

impl BodyCategory {
    /// All categories, in a stable order
    pub const ALL: [BodyCategory; 3] = [
        BodyCategory::UpperBody,
        BodyCategory::LowerBody,
        BodyCategory::Dresses,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyCategory::UpperBody => "upper_body",
            BodyCategory::LowerBody => "lower_body",
            BodyCategory::Dresses => "dresses",
        }
    }
}

impl fmt::Display for BodyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BodyCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upper_body" | "upper" => Ok(BodyCategory::UpperBody),
            "lower_body" | "lower" => Ok(BodyCategory::LowerBody),
            "dresses" | "full" | "full_body" => Ok(BodyCategory::Dresses),
            other => Err(Error::BadRequest(format!("unknown body category '{}'", other))),
        }
    }
}

/// Cache family (namespace)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheFamily {
    /// Human-body preprocessing for one body category
    Human(BodyCategory),
    /// Garment preprocessing
    Garment,
    /// Garment text embeddings
    Text,
}

impl CacheFamily {
    /// Every family, in a stable order
    pub const ALL: [CacheFamily; 5] = [
        CacheFamily::Human(BodyCategory::UpperBody),
        CacheFamily::Human(BodyCategory::LowerBody),
        CacheFamily::Human(BodyCategory::Dresses),
        CacheFamily::Garment,
        CacheFamily::Text,
    ];

    /// Directory name under the L2 root and prefix in the origin store.
    ///
    /// Stable across restarts: L2 is the warm-restart cache.
    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheFamily::Human(BodyCategory::UpperBody) => "human_upper_body",
            CacheFamily::Human(BodyCategory::LowerBody) => "human_lower_body",
            CacheFamily::Human(BodyCategory::Dresses) => "human_dresses",
            CacheFamily::Garment => "garment",
            CacheFamily::Text => "text",
        }
    }

    /// Members every record of this family must carry
    pub fn expected_members(&self) -> &'static [&'static str] {
        match self {
            CacheFamily::Human(_) => HUMAN_MEMBERS,
            CacheFamily::Garment => GARMENT_MEMBERS,
            CacheFamily::Text => TEXT_MEMBERS,
        }
    }

    /// Position in [`CacheFamily::ALL`]
    pub fn index(&self) -> usize {
        match self {
            CacheFamily::Human(BodyCategory::UpperBody) => 0,
            CacheFamily::Human(BodyCategory::LowerBody) => 1,
            CacheFamily::Human(BodyCategory::Dresses) => 2,
            CacheFamily::Garment => 3,
            CacheFamily::Text => 4,
        }
    }

    /// Families keyed by user id
    pub fn human_families() -> impl Iterator<Item = CacheFamily> {
        BodyCategory::ALL.into_iter().map(CacheFamily::Human)
    }

    /// Families keyed by garment id
    pub fn garment_families() -> impl Iterator<Item = CacheFamily> {
        [CacheFamily::Garment, CacheFamily::Text].into_iter()
    }
}

impl fmt::Display for CacheFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Reject keys that cannot safely name a directory.
pub fn validate_key(key: &str) -> Result<()> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if key.len() > MAX_KEY_LEN {
        Some("key longer than 128 bytes")
    } else if key.starts_with('.') {
        Some("key must not start with '.'")
    } else if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        Some("only [A-Za-z0-9._-] are allowed")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

// =============================================================================
// Tests
// =============================================================================
