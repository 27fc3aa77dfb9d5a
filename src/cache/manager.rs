//! Tiered Cache - Facade over L1, L2 and the Concurrency Guard
//!
//! Lookup order is L1, then L2 under the key's guard, then (only when the
//! caller supplies one) an origin fetch. Population writes L1 first and L2
//! second, so L1 is never older than L2 for the same key.
//!
//! Every family owns its own L1, guard and counters. L2 is shared and
//! namespaced by family directory.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::entry::Payload;
use super::family::{validate_key, BodyCategory, CacheFamily};
use super::guard::{ConcurrencyGuard, GuardConfig, Resolution};
use super::l1::{L1Cache, L1Config, DEFAULT_BASE_TTL};
use super::l2::{L2Config, L2DiskTier, SweepReport};
use super::metrics::{CacheStats, FamilyMetrics, FamilyStats};
use crate::error::{Error, Result};

/// Tier a lookup was answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// L1 - process memory
    L1,
    /// L2 - local disk
    L2,
    /// L3 - origin fetch supplied by the caller
    Origin,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "L1 (memory)"),
            CacheTier::L2 => write!(f, "L2 (disk)"),
            CacheTier::Origin => write!(f, "L3 (origin)"),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// L1 capacity of each human-body family
    pub l1_max_users: usize,
    /// L1 capacity of the garment and text families
    pub l1_max_garments: usize,
    /// TTL before access-frequency stretching
    pub base_ttl: Duration,
    /// L2 configuration
    pub l2: L2Config,
    /// Stampede guard configuration
    pub guard: GuardConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_users: 10,
            l1_max_garments: 100,
            base_ttl: DEFAULT_BASE_TTL,
            l2: L2Config::default(),
            guard: GuardConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Base TTL from a whole number of hours, rejecting values that do not
    /// fit in a `Duration` of seconds
    pub fn base_ttl_from_hours(hours: u64) -> Result<Duration> {
        hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| Error::Config(format!("TTL of {} hours is out of range", hours)))
    }

    /// L1 configuration for a family
    pub fn l1_for(&self, family: CacheFamily) -> L1Config {
        let capacity = match family {
            CacheFamily::Human(_) => self.l1_max_users,
            CacheFamily::Garment | CacheFamily::Text => self.l1_max_garments,
        };
        L1Config {
            capacity,
            base_ttl: self.base_ttl,
        }
    }
}

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheResult {
    /// The cached payload
    pub payload: Arc<Payload>,
    /// Which tier answered
    pub tier: CacheTier,
    /// Lookup latency
    pub latency: Duration,
}

/// Outcome of a maintenance pass
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MaintenanceReport {
    pub l2_sweep: SweepReport,
    pub l2_stale_reclaimed: usize,
    pub lock_slots_swept: usize,
}

struct FamilyTier {
    family: CacheFamily,
    l1: L1Cache,
    guard: ConcurrencyGuard,
    metrics: FamilyMetrics,
    /// Bumped by `clear_all`; an L2 read promotes only within one epoch
    epoch: AtomicU64,
}

/// Tiered cache facade
pub struct TieredCache {
    tiers: Vec<FamilyTier>,
    l2: Arc<L2DiskTier>,
    config: CacheConfig,
}

impl TieredCache {
    /// Open the cache, creating the L2 root if needed
    pub fn open(config: CacheConfig) -> Result<Self> {
        let l2 = Arc::new(L2DiskTier::open(config.l2.clone())?);
        let tiers = CacheFamily::ALL
            .iter()
            .map(|&family| FamilyTier {
                family,
                l1: L1Cache::with_config(family.dir_name(), config.l1_for(family)),
                guard: ConcurrencyGuard::with_config(config.guard.clone()),
                metrics: FamilyMetrics::new(),
                epoch: AtomicU64::new(0),
            })
            .collect();

        info!(
            l1_max_users = config.l1_max_users,
            l1_max_garments = config.l1_max_garments,
            base_ttl_secs = config.base_ttl.as_secs(),
            "Tiered cache ready"
        );
        Ok(Self { tiers, l2, config })
    }

    fn tier(&self, family: CacheFamily) -> &FamilyTier {
        &self.tiers[family.index()]
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn l1(&self, family: CacheFamily) -> &L1Cache {
        &self.tier(family).l1
    }

    pub fn l2(&self) -> &L2DiskTier {
        &self.l2
    }

    pub fn guard(&self, family: CacheFamily) -> &ConcurrencyGuard {
        &self.tier(family).guard
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// L1 then L2. `None` means the caller must produce the payload and
    /// `put` it.
    pub async fn get(&self, family: CacheFamily, key: &str) -> Result<Option<Arc<Payload>>> {
        let result = self.lookup(family, key, None::<NoFetch>).await?;
        Ok(result.map(|r| r.payload))
    }

    /// L1, L2, then `fetch`. A fetched payload is written through both
    /// tiers before returning. Concurrent callers for the same key share one
    /// L2 read and one fetch.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        family: CacheFamily,
        key: &str,
        fetch: F,
    ) -> Result<Option<CacheResult>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Payload>>>,
    {
        self.lookup(family, key, Some(fetch)).await
    }

    async fn lookup<F, Fut>(
        &self,
        family: CacheFamily,
        key: &str,
        fetch: Option<F>,
    ) -> Result<Option<CacheResult>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Payload>>>,
    {
        validate_key(key)?;
        let start = Instant::now();
        let tier = self.tier(family);

        let check = || tier.l1.get(key).map(|entry| Arc::clone(entry.payload()));
        let load = move || async move {
            let epoch = tier.epoch.load(Ordering::Acquire);
            if let Some(payload) = self.load_l2(family, key).await {
                let payload = Arc::new(payload);
                self.promote(tier, key, &payload, epoch);
                return Ok::<_, Error>(Some((payload, CacheTier::L2)));
            }

            let Some(fetch) = fetch else {
                return Ok(None);
            };
            match fetch().await? {
                Some(payload) => {
                    payload.ensure_complete(family)?;
                    let payload = self.store_tiers(family, key, payload).await;
                    Ok(Some((payload, CacheTier::Origin)))
                }
                None => Ok(None),
            }
        };

        let resolution = tier
            .guard
            .resolve(key, || check().map(|p| (p, CacheTier::L1)), load)
            .await?;

        let found = match resolution {
            Resolution::Cached((payload, _)) => {
                tier.metrics.record_l1_hit();
                Some((payload, CacheTier::L1))
            }
            Resolution::Loaded((payload, source)) => {
                match source {
                    CacheTier::L1 => tier.metrics.record_l1_hit(),
                    CacheTier::L2 => tier.metrics.record_l2_hit(),
                    CacheTier::Origin => tier.metrics.record_origin_hit(),
                }
                Some((payload, source))
            }
            Resolution::Miss => {
                tier.metrics.record_miss();
                None
            }
        };

        let latency = start.elapsed();
        match &found {
            Some((_, source)) => debug!(family = %family, key, tier = %source, ?latency, "Cache hit"),
            None => debug!(family = %family, key, ?latency, "Cache miss"),
        }
        Ok(found.map(|(payload, tier)| CacheResult {
            payload,
            tier,
            latency,
        }))
    }

    /// Copy an L2 read into L1 unless a `clear_all` ran since `epoch`
    fn promote(&self, tier: &FamilyTier, key: &str, payload: &Arc<Payload>, epoch: u64) -> bool {
        if tier.epoch.load(Ordering::Acquire) != epoch {
            debug!(family = %tier.family, key, "Cache cleared during L2 read, not promoting");
            return false;
        }
        tier.l1.put(key, Arc::clone(payload));
        true
    }

    async fn load_l2(&self, family: CacheFamily, key: &str) -> Option<Payload> {
        let l2 = Arc::clone(&self.l2);
        let owned_key = key.to_string();
        match tokio::task::spawn_blocking(move || l2.load(family, &owned_key)).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(family = %family, key, error = %e, "L2 read task failed, treating as miss");
                None
            }
        }
    }

    // =========================================================================
    // Population
    // =========================================================================

    /// Write a payload through L1 and L2.
    ///
    /// Fails only for a malformed key or a payload missing members its
    /// family requires. L2 write failures are logged; L1 still serves the
    /// entry.
    pub async fn put(&self, family: CacheFamily, key: &str, payload: Payload) -> Result<Arc<Payload>> {
        validate_key(key)?;
        payload.ensure_complete(family)?;
        let tier = self.tier(family);
        let stored = tier
            .guard
            .run_exclusive(key, move || self.store_tiers(family, key, payload))
            .await;
        Ok(stored)
    }

    /// L1 first, then L2. Callers hold the key's guard lock.
    async fn store_tiers(&self, family: CacheFamily, key: &str, payload: Payload) -> Arc<Payload> {
        let tier = self.tier(family);
        let payload = Arc::new(payload);
        tier.l1.put(key, Arc::clone(&payload));
        tier.metrics.record_put();

        let l2 = Arc::clone(&self.l2);
        let owned_key = key.to_string();
        let on_disk = Arc::clone(&payload);
        let saved = tokio::task::spawn_blocking(move || l2.save(family, &owned_key, &on_disk))
            .await
            .map_err(|e| Error::Internal(format!("L2 write task failed: {}", e)))
            .and_then(|r| r);

        if let Err(e) = saved {
            tier.metrics.record_l2_write_failure();
            warn!(family = %family, key, error = %e, "L2 write failed, entry is memory-only");
        }
        payload
    }

    // =========================================================================
    // Family shortcuts
    // =========================================================================

    pub async fn get_human(&self, user_id: &str, category: BodyCategory) -> Result<Option<Arc<Payload>>> {
        self.get(CacheFamily::Human(category), user_id).await
    }

    pub async fn put_human(
        &self,
        user_id: &str,
        category: BodyCategory,
        payload: Payload,
    ) -> Result<Arc<Payload>> {
        self.put(CacheFamily::Human(category), user_id, payload).await
    }

    pub async fn get_garment(&self, garment_id: &str) -> Result<Option<Arc<Payload>>> {
        self.get(CacheFamily::Garment, garment_id).await
    }

    pub async fn put_garment(&self, garment_id: &str, payload: Payload) -> Result<Arc<Payload>> {
        self.put(CacheFamily::Garment, garment_id, payload).await
    }

    pub async fn get_text(&self, garment_id: &str) -> Result<Option<Arc<Payload>>> {
        self.get(CacheFamily::Text, garment_id).await
    }

    pub async fn put_text(&self, garment_id: &str, payload: Payload) -> Result<Arc<Payload>> {
        self.put(CacheFamily::Text, garment_id, payload).await
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove one key from both tiers, waiting out any in-flight load
    pub async fn clear_key(&self, family: CacheFamily, key: &str) -> Result<()> {
        validate_key(key)?;
        let tier = self.tier(family);
        tier.guard
            .run_exclusive(key, move || async move {
                tier.l1.remove(key);
                let l2 = Arc::clone(&self.l2);
                let owned_key = key.to_string();
                tokio::task::spawn_blocking(move || l2.clear(family, &owned_key))
                    .await
                    .map_err(|e| Error::Internal(format!("L2 clear task failed: {}", e)))?
            })
            .await
    }

    /// Remove a user's body records for every category
    pub async fn clear_user(&self, user_id: &str) -> Result<()> {
        for family in CacheFamily::human_families() {
            self.clear_key(family, user_id).await?;
        }
        info!(user_id, "Cleared user cache");
        Ok(())
    }

    /// Remove a garment's image and text records
    pub async fn clear_garment(&self, garment_id: &str) -> Result<()> {
        for family in CacheFamily::garment_families() {
            self.clear_key(family, garment_id).await?;
        }
        info!(garment_id, "Cleared garment cache");
        Ok(())
    }

    /// Empty every family's L1 and all L2 content.
    ///
    /// Does not take the per-key locks. The epoch is bumped on both sides of
    /// the L2 removal so a read that overlapped it never repopulates L1.
    pub async fn clear_all(&self) -> Result<()> {
        self.bump_epochs();
        for tier in &self.tiers {
            tier.l1.clear();
        }
        let l2 = Arc::clone(&self.l2);
        let cleared = tokio::task::spawn_blocking(move || l2.clear_all())
            .await
            .map_err(|e| Error::Internal(format!("L2 clear task failed: {}", e)));
        self.bump_epochs();
        cleared??;
        info!("Cleared all caches");
        Ok(())
    }

    fn bump_epochs(&self) {
        for tier in &self.tiers {
            tier.epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    // =========================================================================
    // Maintenance & stats
    // =========================================================================

    /// Abandoned staging reclaim, quota sweep and idle lock-slot sweep
    pub async fn maintenance(&self) -> MaintenanceReport {
        let l2 = Arc::clone(&self.l2);
        let (l2_stale_reclaimed, l2_sweep) = tokio::task::spawn_blocking(move || {
            let reclaimed = l2.reclaim_stale();
            (reclaimed, l2.evict_if_over_quota())
        })
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "L2 maintenance task failed");
            (0, SweepReport::default())
        });
        let lock_slots_swept = self.tiers.iter().map(|t| t.guard.sweep()).sum();
        MaintenanceReport {
            l2_sweep,
            l2_stale_reclaimed,
            lock_slots_swept,
        }
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> CacheStats {
        let families = self
            .tiers
            .iter()
            .map(|t| {
                FamilyStats::assemble(
                    t.family.dir_name().to_string(),
                    &t.metrics,
                    t.l1.stats(),
                    t.guard.stats(),
                )
            })
            .collect();
        CacheStats::new(families, self.l2.stats())
    }
}

type NoFetch = fn() -> std::future::Ready<Result<Option<Payload>>>;

// =============================================================================
// Tests
// =============================================================================
