//! Generation Gate
//!
//! Single-admission gate around the accelerator-bound generation call. The
//! slot is a tokio `Mutex`, whose waiters are woken in FIFO order, so
//! requests run strictly in the order they queued.
//!
//! Every request draws a monotonically increasing ticket when it joins the
//! queue. A bounded queue wait turns saturation into a retryable
//! [`Error::GenerationBusy`] instead of an unbounded stall.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Gate configuration
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Longest a request may wait for the slot; `None` waits forever
    pub queue_timeout: Option<Duration>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl GateConfig {
    /// Build from seconds, where 0 means no bound
    pub fn from_secs(secs: u64) -> Self {
        Self {
            queue_timeout: (secs > 0).then(|| Duration::from_secs(secs)),
        }
    }
}

/// What a request learned about its trip through the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateReceipt {
    /// Queue position (1-based, process-wide)
    pub ticket: u64,
    /// Time spent waiting for the slot
    pub queue_wait: Duration,
}

/// Gate statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GateStats {
    pub tickets_issued: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub queued: u64,
    pub running: u64,
}

/// Decrements a gauge when dropped, so cancellation cannot leak counts
struct GaugeGuard<'a>(&'a AtomicU64);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// FIFO single-slot admission gate
pub struct GenerationGate {
    slot: Mutex<()>,
    config: GateConfig,
    tickets: AtomicU64,
    completed: AtomicU64,
    timeouts: AtomicU64,
    queued: AtomicU64,
    running: AtomicU64,
}

impl GenerationGate {
    pub fn new() -> Self {
        Self::with_config(GateConfig::default())
    }

    pub fn with_config(config: GateConfig) -> Self {
        Self {
            slot: Mutex::new(()),
            config,
            tickets: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            running: AtomicU64::new(0),
        }
    }

    /// Run `f` once the slot is free. Nothing else runs through the gate
    /// while `f` does.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<(T, GateReceipt)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        let enqueued = Instant::now();

        let slot = {
            let _queued = GaugeGuard::enter(&self.queued);
            debug!(ticket, queued = self.queued.load(Ordering::Relaxed), "Waiting for generation slot");
            match self.config.queue_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.slot.lock()).await {
                    Ok(slot) => slot,
                    Err(_) => {
                        self.timeouts.fetch_add(1, Ordering::Relaxed);
                        let waited_ms = enqueued.elapsed().as_millis() as u64;
                        warn!(ticket, waited_ms, "Generation queue wait expired");
                        return Err(Error::GenerationBusy { waited_ms });
                    }
                },
                None => self.slot.lock().await,
            }
        };

        let receipt = GateReceipt {
            ticket,
            queue_wait: enqueued.elapsed(),
        };
        info!(ticket, queue_wait_ms = receipt.queue_wait.as_millis() as u64, "Generation admitted");

        let output = {
            let _running = GaugeGuard::enter(&self.running);
            f().await
        };
        drop(slot);
        self.completed.fetch_add(1, Ordering::Relaxed);

        Ok((output?, receipt))
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            tickets_issued: self.tickets.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

impl Default for GenerationGate {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
