//! Cache Metrics Collection
//!
//! Per-family lookup counters and the serializable snapshots served by the
//! stats and Prometheus endpoints.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::guard::GuardStats;
use super::l1::L1Stats;
use super::l2::L2Stats;

/// Lookup outcome counters for one family
#[derive(Debug, Default)]
pub struct FamilyMetrics {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    origin_hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    l2_write_failures: AtomicU64,
}

impl FamilyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_origin_hit(&self) {
        self.origin_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_write_failure(&self) {
        self.l2_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn l1_hits(&self) -> u64 {
        self.l1_hits.load(Ordering::Relaxed)
    }

    pub fn l2_hits(&self) -> u64 {
        self.l2_hits.load(Ordering::Relaxed)
    }

    pub fn origin_hits(&self) -> u64 {
        self.origin_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn l2_write_failures(&self) -> u64 {
        self.l2_write_failures.load(Ordering::Relaxed)
    }

    /// Lookups answered by any tier, over all lookups
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.l1_hits() + self.l2_hits() + self.origin_hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Snapshot of one family
#[derive(Debug, Clone, Serialize)]
pub struct FamilyStats {
    pub family: String,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub origin_hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub hit_ratio: f64,
    pub l2_write_failures: u64,
    pub stampede_prevented: u64,
    pub wait_timeouts: u64,
    pub l1: L1Stats,
    pub guard: GuardStats,
}

impl FamilyStats {
    pub fn assemble(family: String, metrics: &FamilyMetrics, l1: L1Stats, guard: GuardStats) -> Self {
        Self {
            family,
            l1_hits: metrics.l1_hits(),
            l2_hits: metrics.l2_hits(),
            origin_hits: metrics.origin_hits(),
            misses: metrics.misses(),
            puts: metrics.puts(),
            hit_ratio: metrics.hit_ratio(),
            l2_write_failures: metrics.l2_write_failures(),
            stampede_prevented: guard.stampede_prevented,
            wait_timeouts: guard.wait_timeouts,
            l1,
            guard,
        }
    }
}

/// Sums across families
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheTotals {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub origin_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub stampede_prevented: u64,
    pub l1_entries: usize,
    pub l1_bytes: u64,
}

/// Snapshot of the whole cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub generated_at: DateTime<Utc>,
    pub totals: CacheTotals,
    pub families: Vec<FamilyStats>,
    pub l2: L2Stats,
}

impl CacheStats {
    pub fn new(families: Vec<FamilyStats>, l2: L2Stats) -> Self {
        let totals = families.iter().fold(CacheTotals::default(), |mut acc, f| {
            acc.l1_hits += f.l1_hits;
            acc.l2_hits += f.l2_hits;
            acc.origin_hits += f.origin_hits;
            acc.misses += f.misses;
            acc.evictions += f.l1.evictions;
            acc.stampede_prevented += f.stampede_prevented;
            acc.l1_entries += f.l1.entries;
            acc.l1_bytes += f.l1.size_bytes;
            acc
        });
        Self {
            generated_at: Utc::now(),
            totals,
            families,
            l2,
        }
    }

    pub fn family(&self, name: &str) -> Option<&FamilyStats> {
        self.families.iter().find(|f| f.family == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = FamilyMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_l1_hit();
        metrics.record_l2_hit();
        metrics.record_origin_hit();
        metrics.record_miss();
        assert!((metrics.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_totals_sum_families() {
        let a = FamilyMetrics::new();
        a.record_l1_hit();
        a.record_miss();
        let b = FamilyMetrics::new();
        b.record_l2_hit();

        let l1 = L1Stats {
            entries: 2,
            capacity: 10,
            size_bytes: 100,
            hits: 0,
            misses: 0,
            evictions: 3,
            expirations: 0,
        };
        let guard = GuardStats {
            stampede_prevented: 4,
            ..Default::default()
        };
        let stats = CacheStats::new(
            vec![
                FamilyStats::assemble("garment".into(), &a, l1, guard),
                FamilyStats::assemble("text".into(), &b, l1, GuardStats::default()),
            ],
            L2Stats::default(),
        );

        assert_eq!(stats.totals.l1_hits, 1);
        assert_eq!(stats.totals.l2_hits, 1);
        assert_eq!(stats.totals.misses, 1);
        assert_eq!(stats.totals.evictions, 6);
        assert_eq!(stats.totals.stampede_prevented, 4);
        assert_eq!(stats.totals.l1_entries, 4);
        assert_eq!(stats.family("text").unwrap().l2_hits, 1);
        assert!(stats.family("nope").is_none());

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["families"][0]["stampede_prevented"], 4);
    }
}
