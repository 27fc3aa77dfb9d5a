//! Prometheus exposition of service statistics.
//!
//! The cache, gate and origin keep their own atomic counters; this module
//! mirrors a [`ServiceStats`] snapshot into a private registry on every
//! scrape. Counters only ever move forward by the delta since the previous
//! scrape, so a counter never goes backwards even if a family is cleared.

use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::error::{Error, Result};
use crate::service::ServiceStats;

/// Request latency buckets (seconds), generation calls run long
const REQUEST_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn registered<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| Error::Internal(format!("failed to register metric: {}", e)))?;
    Ok(collector)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| Error::Internal(format!("invalid metric {}: {}", name, e)))?;
    registered(registry, vec)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help).map_err(|e| Error::Internal(format!("invalid metric {}: {}", name, e)))?;
    registered(registry, c)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntGaugeVec> {
    let vec = IntGaugeVec::new(Opts::new(name, help), labels)
        .map_err(|e| Error::Internal(format!("invalid metric {}: {}", name, e)))?;
    registered(registry, vec)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let g = IntGauge::new(name, help).map_err(|e| Error::Internal(format!("invalid metric {}: {}", name, e)))?;
    registered(registry, g)
}

/// Move a counter forward to `target`
fn advance(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

/// Prometheus registry and the collectors backing `/metrics`
pub struct MetricsExporter {
    registry: Registry,
    sync: Mutex<()>,

    lookups: IntCounterVec,
    puts: IntCounterVec,
    l1_evictions: IntCounterVec,
    l1_expirations: IntCounterVec,
    stampede_prevented: IntCounterVec,
    lock_wait_timeouts: IntCounterVec,
    l2_write_failures: IntCounterVec,
    l1_entries: IntGaugeVec,
    l1_bytes: IntGaugeVec,
    l1_capacity: IntGaugeVec,
    lock_slots: IntGaugeVec,

    l2_usage_bytes: IntGauge,
    l2_quota_bytes: IntGauge,
    l2_ops: IntCounterVec,
    l2_evicted_bytes: IntCounter,

    generation_tickets: IntCounter,
    generation_completed: IntCounter,
    generation_timeouts: IntCounter,
    generation_queued: IntGauge,
    generation_running: IntGauge,

    origin_ops: IntCounterVec,

    http_requests: IntCounterVec,
    http_duration: HistogramVec,
}

impl MetricsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let r = &registry;

        let http_duration = HistogramVec::new(
            HistogramOpts::new("vton_http_request_duration_seconds", "HTTP request duration in seconds")
                .buckets(REQUEST_LATENCY_BUCKETS.to_vec()),
            &["route"],
        )
        .map_err(|e| Error::Internal(format!("invalid histogram: {}", e)))?;

        Ok(Self {
            lookups: counter_vec(
                r,
                "vton_cache_lookups_total",
                "Cache lookups by family and serving tier",
                &["family", "outcome"],
            )?,
            puts: counter_vec(r, "vton_cache_puts_total", "Records written to the cache", &["family"])?,
            l1_evictions: counter_vec(r, "vton_cache_l1_evictions_total", "LRU evictions from L1", &["family"])?,
            l1_expirations: counter_vec(
                r,
                "vton_cache_l1_expirations_total",
                "L1 entries dropped after their TTL",
                &["family"],
            )?,
            stampede_prevented: counter_vec(
                r,
                "vton_cache_stampede_prevented_total",
                "Lookups satisfied by another caller's load",
                &["family"],
            )?,
            lock_wait_timeouts: counter_vec(
                r,
                "vton_cache_lock_wait_timeouts_total",
                "Per-key waits that gave up and loaded directly",
                &["family"],
            )?,
            l2_write_failures: counter_vec(
                r,
                "vton_cache_l2_write_failures_total",
                "Records that reached L1 but failed to persist",
                &["family"],
            )?,
            l1_entries: gauge_vec(r, "vton_cache_l1_entries", "Entries resident in L1", &["family"])?,
            l1_bytes: gauge_vec(r, "vton_cache_l1_bytes", "Payload bytes resident in L1", &["family"])?,
            l1_capacity: gauge_vec(r, "vton_cache_l1_capacity", "L1 entry capacity", &["family"])?,
            lock_slots: gauge_vec(r, "vton_cache_lock_slots", "Per-key lock slots held", &["family"])?,

            l2_usage_bytes: gauge(r, "vton_cache_l2_usage_bytes", "Bytes stored on the disk tier")?,
            l2_quota_bytes: gauge(r, "vton_cache_l2_quota_bytes", "Disk tier quota")?,
            l2_ops: counter_vec(r, "vton_cache_l2_operations_total", "Disk tier operations", &["op"])?,
            l2_evicted_bytes: counter(r, "vton_cache_l2_evicted_bytes_total", "Bytes removed by quota sweeps")?,

            generation_tickets: counter(r, "vton_generation_tickets_total", "Generation requests admitted to the queue")?,
            generation_completed: counter(r, "vton_generation_completed_total", "Generation requests that ran")?,
            generation_timeouts: counter(
                r,
                "vton_generation_queue_timeouts_total",
                "Generation requests that gave up waiting",
            )?,
            generation_queued: gauge(r, "vton_generation_queued", "Generation requests waiting for the slot")?,
            generation_running: gauge(r, "vton_generation_running", "Generation requests holding the slot")?,

            origin_ops: counter_vec(r, "vton_origin_operations_total", "Origin store operations", &["op"])?,

            http_requests: counter_vec(
                r,
                "vton_http_requests_total",
                "HTTP requests by route and status",
                &["route", "status"],
            )?,
            http_duration: registered(r, http_duration)?,

            sync: Mutex::new(()),
            registry,
        })
    }

    /// Record one served HTTP request
    pub fn record_request(&self, route: &str, status: u16, duration_secs: f64) {
        let status = status.to_string();
        self.http_requests.with_label_values(&[route, status.as_str()]).inc();
        self.http_duration.with_label_values(&[route]).observe(duration_secs);
    }

    /// Mirror a stats snapshot into the registry
    pub fn observe(&self, stats: &ServiceStats) {
        let _sync = self.sync.lock();

        for family in &stats.cache.families {
            let name = family.family.as_str();
            for (outcome, value) in [
                ("l1_hit", family.l1_hits),
                ("l2_hit", family.l2_hits),
                ("origin_hit", family.origin_hits),
                ("miss", family.misses),
            ] {
                advance(&self.lookups.with_label_values(&[name, outcome]), value);
            }
            advance(&self.puts.with_label_values(&[name]), family.puts);
            advance(&self.l1_evictions.with_label_values(&[name]), family.l1.evictions);
            advance(&self.l1_expirations.with_label_values(&[name]), family.l1.expirations);
            advance(&self.stampede_prevented.with_label_values(&[name]), family.stampede_prevented);
            advance(&self.lock_wait_timeouts.with_label_values(&[name]), family.wait_timeouts);
            advance(&self.l2_write_failures.with_label_values(&[name]), family.l2_write_failures);

            self.l1_entries.with_label_values(&[name]).set(family.l1.entries as i64);
            self.l1_bytes.with_label_values(&[name]).set(family.l1.size_bytes as i64);
            self.l1_capacity.with_label_values(&[name]).set(family.l1.capacity as i64);
            self.lock_slots.with_label_values(&[name]).set(family.guard.slots as i64);
        }

        let l2 = &stats.cache.l2;
        self.l2_usage_bytes.set(l2.usage_bytes as i64);
        self.l2_quota_bytes.set(l2.quota_bytes as i64);
        for (op, value) in [
            ("hit", l2.hits),
            ("miss", l2.misses),
            ("save", l2.saves),
            ("save_failure", l2.save_failures),
            ("corrupt", l2.corrupt_records),
            ("sweep", l2.sweeps),
            ("evicted_file", l2.evicted_files),
        ] {
            advance(&self.l2_ops.with_label_values(&[op]), value);
        }
        advance(&self.l2_evicted_bytes, l2.evicted_bytes);

        let gen = &stats.generation;
        advance(&self.generation_tickets, gen.tickets_issued);
        advance(&self.generation_completed, gen.completed);
        advance(&self.generation_timeouts, gen.timeouts);
        self.generation_queued.set(gen.queued as i64);
        self.generation_running.set(gen.running as i64);

        let origin = &stats.origin;
        for (op, value) in [("read", origin.reads), ("write", origin.writes), ("delete", origin.deletes)] {
            advance(&self.origin_ops.with_label_values(&[op]), value);
        }
    }

    /// Render the registry in Prometheus text format
    pub fn render(&self, stats: &ServiceStats) -> Result<(Vec<u8>, String)> {
        self.observe(stats);

        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| Error::Internal(format!("failed to encode metrics: {}", e)))?;
        Ok((buffer, encoder.format_type().to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
