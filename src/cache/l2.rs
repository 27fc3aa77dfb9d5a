//! L2 Cache - Local Disk Tier
//!
//! Persistent, directory-per-record store on local fast storage. Survives
//! process restarts and is what a cold L1 warms itself from.
//!
//! # Layout
//!
//! ```text
//! <root>/<family>/<key>/<member>.<ext>     ext: png | tensor | bin
//! <root>/<family>/.staging-<key>-<uuid>/   save in progress
//! <root>/<family>/.retired-<key>-<uuid>/   previous record being replaced
//! ```
//!
//! # Design
//!
//! - Saves write every member into a staging directory and rename it into
//!   place, so a record directory is either complete or absent
//! - A record counts as a hit only when every member its family expects is
//!   present and decodes; anything else is a miss and gets cleaned up
//! - Quota enforcement is an eventually-consistent sweep run after each save:
//!   oldest-by-mtime records go first until usage reaches the target ratio
//! - Staging and retired directories are never swept as records. Ones left
//!   behind by a crashed process are reclaimed once older than
//!   `stale_after`, on open and during maintenance
//! - A sweep never removes the record its own save just wrote, and when
//!   unsweepable bytes alone exceed the target it only trims back to the
//!   quota

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::artifact::{ArtifactKind, ArtifactStore};
use super::entry::Payload;
use super::family::{validate_key, CacheFamily};
use crate::error::Result;

/// Default quota (50 GB)
pub const DEFAULT_L2_QUOTA: u64 = 50 * 1024 * 1024 * 1024;

/// Default fraction of the quota a sweep shrinks usage down to
pub const DEFAULT_TARGET_RATIO: f64 = 0.5;

/// Default age after which an abandoned staging or retired directory is reclaimed
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// L2 tier configuration
#[derive(Debug, Clone)]
pub struct L2Config {
    /// Root directory
    pub root: PathBuf,
    /// Usage ceiling in bytes
    pub quota_bytes: u64,
    /// Sweep target as a fraction of `quota_bytes`
    pub target_ratio: f64,
    /// Age after which a staging or retired directory counts as abandoned
    pub stale_after: Duration,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/cache/vton/l2"),
            quota_bytes: DEFAULT_L2_QUOTA,
            target_ratio: DEFAULT_TARGET_RATIO,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

impl L2Config {
    /// Usage a sweep brings the tier down to
    pub fn target_bytes(&self) -> u64 {
        (self.quota_bytes as f64 * self.target_ratio.clamp(0.0, 1.0)) as u64
    }
}

/// Outcome of one quota sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub usage_before: u64,
    pub usage_after: u64,
    pub records_removed: u64,
    pub files_removed: u64,
    pub bytes_removed: u64,
    /// Bytes in staging or retired directories, which no sweep removes
    pub unsweepable_bytes: u64,
}

/// One file found while walking the tier
#[derive(Debug)]
struct DiskFile {
    modified: SystemTime,
    size: u64,
    record_dir: PathBuf,
    sweepable: bool,
}

/// L2 tier - persistent local disk store
pub struct L2DiskTier {
    config: L2Config,
    /// Serializes sweeps; a save that finds one running skips its own
    sweep_lock: Mutex<()>,
    last_usage: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    corrupt_records: AtomicU64,
    saves: AtomicU64,
    save_failures: AtomicU64,
    sweeps: AtomicU64,
    evicted_files: AtomicU64,
    evicted_bytes: AtomicU64,
    stale_reclaimed: AtomicU64,
}

impl L2DiskTier {
    /// Open (creating if needed) the tier rooted at `config.root`
    pub fn open(config: L2Config) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        let tier = Self {
            config,
            sweep_lock: Mutex::new(()),
            last_usage: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            corrupt_records: AtomicU64::new(0),
            saves: AtomicU64::new(0),
            save_failures: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            evicted_files: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
            stale_reclaimed: AtomicU64::new(0),
        };
        tier.reclaim_stale();
        let usage = tier.usage_bytes();
        info!(
            root = %tier.config.root.display(),
            usage_bytes = usage,
            quota_bytes = tier.config.quota_bytes,
            "Opened L2 disk tier"
        );
        Ok(tier)
    }

    pub fn config(&self) -> &L2Config {
        &self.config
    }

    fn family_dir(&self, family: CacheFamily) -> PathBuf {
        self.config.root.join(family.dir_name())
    }

    /// Directory holding one record
    pub fn record_dir(&self, family: CacheFamily, key: &str) -> PathBuf {
        self.family_dir(family).join(key)
    }

    // =========================================================================
    // Save / Load
    // =========================================================================

    /// Persist every payload member, replacing any previous record for the
    /// key, then run the quota check. Returns the bytes written.
    pub fn save(&self, family: CacheFamily, key: &str, payload: &Payload) -> Result<u64> {
        validate_key(key)?;
        for name in payload.names() {
            validate_key(name)?;
        }

        match self.write_record(family, key, payload) {
            Ok(written) => {
                self.saves.fetch_add(1, Ordering::Relaxed);
                debug!(family = %family, key, bytes = written, "Saved L2 record");
                self.sweep(Some(self.record_dir(family, key).as_path()));
                Ok(written)
            }
            Err(e) => {
                self.save_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn write_record(&self, family: CacheFamily, key: &str, payload: &Payload) -> Result<u64> {
        let family_dir = self.family_dir(family);
        fs::create_dir_all(&family_dir)?;

        let staging = family_dir.join(format!("{}{}-{}", STAGING_PREFIX, key, uuid::Uuid::new_v4()));
        fs::create_dir(&staging)?;

        let written = match write_members(&staging, payload) {
            Ok(written) => written,
            Err(e) => {
                remove_dir_logged(&staging);
                return Err(e);
            }
        };

        let target = family_dir.join(key);
        let retired = family_dir.join(format!("{}{}-{}", RETIRED_PREFIX, key, uuid::Uuid::new_v4()));
        let replaced = match fs::rename(&target, &retired) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                remove_dir_logged(&staging);
                return Err(e.into());
            }
        };

        if let Err(e) = fs::rename(&staging, &target) {
            remove_dir_logged(&staging);
            if replaced {
                remove_dir_logged(&retired);
            }
            return Err(e.into());
        }
        if replaced {
            remove_dir_logged(&retired);
        }
        Ok(written)
    }

    /// Read a record. Absent, incomplete and undecodable records are all a
    /// miss; the latter two are removed.
    pub fn load(&self, family: CacheFamily, key: &str) -> Option<Payload> {
        if validate_key(key).is_err() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let dir = self.record_dir(family, key);
        match read_members(&dir) {
            Ok(Some(payload)) => {
                let missing = payload.missing_members(family);
                if missing.is_empty() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(family = %family, key, "L2 hit");
                    return Some(payload);
                }
                warn!(family = %family, key, ?missing, "Incomplete L2 record, discarding");
                self.discard_corrupt(&dir);
            }
            Ok(None) => {
                debug!(family = %family, key, "L2 miss");
            }
            Err(e) => {
                warn!(family = %family, key, error = %e, "Unreadable L2 record, discarding");
                self.discard_corrupt(&dir);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn discard_corrupt(&self, dir: &Path) {
        self.corrupt_records.fetch_add(1, Ordering::Relaxed);
        remove_dir_logged(dir);
    }

    /// Whether a record directory exists (says nothing about validity)
    pub fn contains(&self, family: CacheFamily, key: &str) -> bool {
        validate_key(key).is_ok() && self.record_dir(family, key).is_dir()
    }

    // =========================================================================
    // Quota
    // =========================================================================

    /// Total bytes of every file under the root
    pub fn usage_bytes(&self) -> u64 {
        let usage = scan(&self.config.root).iter().map(|f| f.size).sum();
        self.last_usage.store(usage, Ordering::Relaxed);
        usage
    }

    /// Usage as of the last scan
    pub fn last_known_usage(&self) -> u64 {
        self.last_usage.load(Ordering::Relaxed)
    }

    /// If usage exceeds the quota, delete records oldest-modified first until
    /// usage is at or below the target. Never fails: I/O errors are logged
    /// and the sweep moves on.
    pub fn evict_if_over_quota(&self) -> SweepReport {
        self.sweep(None)
    }

    fn sweep(&self, keep: Option<&Path>) -> SweepReport {
        let Some(_sweep) = self.sweep_lock.try_lock() else {
            debug!("L2 sweep already running");
            return SweepReport::default();
        };

        let mut files = scan(&self.config.root);
        let usage: u64 = files.iter().map(|f| f.size).sum();
        let unsweepable: u64 = files.iter().filter(|f| !f.sweepable).map(|f| f.size).sum();
        self.last_usage.store(usage, Ordering::Relaxed);

        let mut report = SweepReport {
            usage_before: usage,
            usage_after: usage,
            unsweepable_bytes: unsweepable,
            ..Default::default()
        };
        if usage <= self.config.quota_bytes {
            return report;
        }
        if unsweepable >= self.config.quota_bytes {
            warn!(
                usage_bytes = usage,
                unsweepable_bytes = unsweepable,
                quota_bytes = self.config.quota_bytes,
                "L2 over quota on staging data alone, no records removed"
            );
            return report;
        }

        // Records cannot bring usage below the staging floor; trimming to
        // the quota is the most a sweep may take then.
        let target = if unsweepable > self.config.target_bytes() {
            self.config.quota_bytes
        } else {
            self.config.target_bytes()
        };
        info!(
            usage_bytes = usage,
            quota_bytes = self.config.quota_bytes,
            target_bytes = target,
            unsweepable_bytes = unsweepable,
            "L2 over quota, sweeping"
        );

        files.sort_by_key(|f| f.modified);
        let mut current = usage;
        let mut removed_dirs: Vec<PathBuf> = Vec::new();

        for file in files.iter().filter(|f| f.sweepable) {
            if current <= target {
                break;
            }
            if removed_dirs.contains(&file.record_dir) || keep == Some(file.record_dir.as_path()) {
                continue;
            }

            let (count, bytes) = files
                .iter()
                .filter(|f| f.record_dir == file.record_dir)
                .fold((0u64, 0u64), |(n, b), f| (n + 1, b + f.size));

            match fs::remove_dir_all(&file.record_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(dir = %file.record_dir.display(), error = %e, "L2 sweep could not remove record");
                    removed_dirs.push(file.record_dir.clone());
                    continue;
                }
            }

            current = current.saturating_sub(bytes);
            report.records_removed += 1;
            report.files_removed += count;
            report.bytes_removed += bytes;
            removed_dirs.push(file.record_dir.clone());
        }

        report.usage_after = current;
        self.last_usage.store(current, Ordering::Relaxed);
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.evicted_files.fetch_add(report.files_removed, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(report.bytes_removed, Ordering::Relaxed);

        info!(
            records = report.records_removed,
            files = report.files_removed,
            bytes = report.bytes_removed,
            usage_after = report.usage_after,
            "L2 sweep complete"
        );
        report
    }

    /// Remove staging and retired directories untouched for `stale_after`.
    /// Returns how many were removed.
    pub fn reclaim_stale(&self) -> usize {
        let now = SystemTime::now();
        let mut reclaimed = 0;
        for family_dir in subdirs(&self.config.root) {
            for dir in subdirs(&family_dir) {
                let is_work_dir = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(STAGING_PREFIX) || n.starts_with(RETIRED_PREFIX));
                if !is_work_dir {
                    continue;
                }
                let idle = now.duration_since(last_modified(&dir)).unwrap_or(Duration::ZERO);
                if idle < self.config.stale_after {
                    continue;
                }
                match remove_dir_if_exists(&dir) {
                    Ok(()) => {
                        info!(dir = %dir.display(), idle_secs = idle.as_secs(), "Reclaimed abandoned L2 directory");
                        reclaimed += 1;
                    }
                    Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to reclaim L2 directory"),
                }
            }
        }
        self.stale_reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
        reclaimed
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove one record; no-op if absent
    pub fn clear(&self, family: CacheFamily, key: &str) -> Result<()> {
        validate_key(key)?;
        remove_dir_if_exists(&self.record_dir(family, key))
    }

    /// Remove every record of a family
    pub fn clear_family(&self, family: CacheFamily) -> Result<()> {
        remove_dir_if_exists(&self.family_dir(family))
    }

    /// Remove everything under the root, keeping the root itself
    pub fn clear_all(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.config.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                remove_dir_if_exists(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        self.last_usage.store(0, Ordering::Relaxed);
        Ok(())
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn save_failures(&self) -> u64 {
        self.save_failures.load(Ordering::Relaxed)
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> L2Stats {
        L2Stats {
            usage_bytes: self.last_known_usage(),
            quota_bytes: self.config.quota_bytes,
            target_bytes: self.config.target_bytes(),
            hits: self.hits(),
            misses: self.misses(),
            corrupt_records: self.corrupt_records.load(Ordering::Relaxed),
            saves: self.saves(),
            save_failures: self.save_failures(),
            sweeps: self.sweeps(),
            evicted_files: self.evicted_files.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            stale_reclaimed: self.stale_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// L2 tier statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct L2Stats {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
    pub target_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub corrupt_records: u64,
    pub saves: u64,
    pub save_failures: u64,
    pub sweeps: u64,
    pub evicted_files: u64,
    pub evicted_bytes: u64,
    pub stale_reclaimed: u64,
}

// =============================================================================
// Filesystem helpers
// =============================================================================

fn write_members(dir: &Path, payload: &Payload) -> Result<u64> {
    let mut written = 0u64;
    for (name, artifact) in payload.iter() {
        let body = ArtifactStore::encode_body(artifact)?;
        let path = dir.join(format!("{}.{}", name, artifact.kind().extension()));
        fs::write(&path, &body)?;
        written += body.len() as u64;
    }
    Ok(written)
}

/// `Ok(None)` when the directory is absent or holds no recognized member
fn read_members(dir: &Path) -> Result<Option<Payload>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut payload = Payload::new();
    for entry in entries {
        let path = entry?.path();
        let (Some(stem), Some(ext)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        let Some(kind) = ArtifactKind::from_extension(ext) else {
            continue;
        };
        let body = fs::read(&path)?;
        payload.insert(stem, ArtifactStore::decode_body(kind, &body)?);
    }

    Ok(if payload.is_empty() { None } else { Some(payload) })
}

/// Every file two levels below the root. Files inside staging or retired
/// directories count toward usage but are not sweepable.
fn scan(root: &Path) -> Vec<DiskFile> {
    let mut files = Vec::new();
    for family_dir in subdirs(root) {
        for record_dir in subdirs(&family_dir) {
            let sweepable = record_dir
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| !n.starts_with('.'));

            let Ok(entries) = fs::read_dir(&record_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                files.push(DiskFile {
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    size: meta.len(),
                    record_dir: record_dir.clone(),
                    sweepable,
                });
            }
        }
    }
    files
}

/// Newest mtime of a directory and the files directly inside it
fn last_modified(dir: &Path) -> SystemTime {
    let own = fs::metadata(dir)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let Ok(entries) = fs::read_dir(dir) else {
        return own;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().and_then(|m| m.modified()).ok())
        .fold(own, |newest, t| newest.max(t))
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_dir_logged(dir: &Path) {
    if let Err(e) = remove_dir_if_exists(dir) {
        warn!(dir = %dir.display(), error = %e, "Failed to remove L2 directory");
    }
}

// =============================================================================
// Tests
// =============================================================================
