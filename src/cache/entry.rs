//! Cache Entry Types
//!
//! A cache entry is a named bundle of artifacts (the payload) plus the
//! bookkeeping that drives LRU ordering and adaptive TTL.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::artifact::{Artifact, RasterImage, Tensor};
use super::family::CacheFamily;
use crate::error::{Error, Result};

/// Accesses after which an entry's TTL doubles
pub const HOT_ACCESS_THRESHOLD: u64 = 10;

/// Accesses after which an entry's TTL quadruples
pub const VERY_HOT_ACCESS_THRESHOLD: u64 = 50;

/// Named members of a cache record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    members: BTreeMap<String, Artifact>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, artifact: impl Into<Artifact>) -> Self {
        self.insert(name, artifact);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, artifact: impl Into<Artifact>) {
        self.members.insert(name.into(), artifact.into());
    }

    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.members.get(name)
    }

    pub fn image(&self, name: &str) -> Option<&RasterImage> {
        self.get(name).and_then(Artifact::as_image)
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.get(name).and_then(Artifact::as_tensor)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Artifact)> {
        self.members.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Sum of the exact footprint of every member
    pub fn size_bytes(&self) -> u64 {
        self.members.values().map(Artifact::size_bytes).sum()
    }

    /// Members `family` requires that are absent here
    pub fn missing_members(&self, family: CacheFamily) -> Vec<String> {
        family
            .expected_members()
            .iter()
            .filter(|name| !self.members.contains_key(**name))
            .map(|name| name.to_string())
            .collect()
    }

    /// Fail unless every member `family` requires is present
    pub fn ensure_complete(&self, family: CacheFamily) -> Result<()> {
        let missing = self.missing_members(family);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::IncompletePayload {
                family: family.to_string(),
                missing,
            })
        }
    }
}

impl FromIterator<(String, Artifact)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Artifact)>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

/// TTL multiplier for an access count
pub fn ttl_multiplier(access_count: u64) -> u32 {
    if access_count >= VERY_HOT_ACCESS_THRESHOLD {
        4
    } else if access_count >= HOT_ACCESS_THRESHOLD {
        2
    } else {
        1
    }
}

/// A cached unit of work product held by the memory tier
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: String,
    payload: Arc<Payload>,
    size_bytes: u64,
    created_at: Instant,
    accessed_at: Instant,
    access_count: u64,
    base_ttl: Duration,
}

impl CacheEntry {
    /// Create a fresh entry: one access, both timestamps now
    pub fn new(key: impl Into<String>, payload: Arc<Payload>, base_ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            size_bytes: payload.size_bytes(),
            payload,
            created_at: now,
            accessed_at: now,
            access_count: 1,
            base_ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &Arc<Payload> {
        &self.payload
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn accessed_at(&self) -> Instant {
        self.accessed_at
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn base_ttl(&self) -> Duration {
        self.base_ttl
    }

    /// Base TTL stretched by access frequency
    pub fn effective_ttl(&self) -> Duration {
        self.base_ttl.saturating_mul(ttl_multiplier(self.access_count))
    }

    /// Age measured from creation, not from the last access
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.effective_ttl()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Record a hit and return the new access count
    pub fn record_access(&mut self) -> u64 {
        self.accessed_at = Instant::now();
        self.access_count += 1;
        self.access_count
    }
}

// =============================================================================
// Tests
// =============================================================================
