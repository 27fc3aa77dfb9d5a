//! L3 - Origin Store
//!
//! Object storage the preprocessing artifacts are mirrored to, so a cold
//! process (or another replica) can warm itself without rerunning models.
//!
//! The cache facade never talks to the origin; the service layer does, which
//! keeps the tiers free of network and model dependencies.
//!
//! # Object layout
//!
//! ```text
//! <family-dir>/<cache-key>/<member>   value: ArtifactStore envelope
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, warn};

use super::artifact::ArtifactStore;
use super::entry::Payload;
use super::family::{validate_key, CacheFamily};
use crate::error::{Error, Result};

/// Origin storage backend
#[async_trait]
pub trait OriginStore: Send + Sync {
    /// Get an object, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Put an object, replacing any previous value
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete an object; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Get storage statistics
    fn stats(&self) -> OriginStats;
}

/// Origin backend statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct OriginStats {
    /// Total objects stored (when the backend can tell)
    pub object_count: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

#[derive(Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl OpCounters {
    fn snapshot(&self, object_count: u64) -> OriginStats {
        OriginStats {
            object_count,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Object key for one record member
pub fn object_key(family: CacheFamily, key: &str, member: &str) -> String {
    format!("{}/{}/{}", family.dir_name(), key, member)
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory origin for tests and single-process deployments
#[derive(Default)]
pub struct InMemoryOriginStore {
    objects: DashMap<String, Bytes>,
    ops: OpCounters,
}

impl InMemoryOriginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl OriginStore for InMemoryOriginStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.objects.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.objects.remove(key).is_some())
    }

    fn stats(&self) -> OriginStats {
        self.ops.snapshot(self.objects.len() as u64)
    }
}

// =============================================================================
// Directory backend
// =============================================================================

/// Origin backed by a directory, e.g. a mounted bucket
pub struct LocalOriginStore {
    root: PathBuf,
    ops: OpCounters,
}

impl LocalOriginStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            ops: OpCounters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an object key onto a path, refusing anything that could leave
    /// the root.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            validate_key(segment).map_err(|_| Error::Origin(format!("invalid object key '{}'", key)))?;
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl OriginStore for LocalOriginStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Origin(format!("read {}: {}", key, e))),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::Origin(format!("object key '{}' has no parent", key)))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Origin(format!("mkdir for {}: {}", key, e)))?;

        let tmp = parent.join(format!(".upload-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::Origin(format!("write {}: {}", key, e)))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Origin(format!("commit {}: {}", key, e)));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Origin(format!("delete {}: {}", key, e))),
        }
    }

    fn stats(&self) -> OriginStats {
        self.ops.snapshot(0)
    }
}

// =============================================================================
// Record-level client
// =============================================================================

/// Moves whole cache records in and out of an [`OriginStore`]
#[derive(Clone)]
pub struct OriginClient {
    store: Arc<dyn OriginStore>,
    artifacts: Arc<ArtifactStore>,
}

impl OriginClient {
    pub fn new(store: Arc<dyn OriginStore>) -> Self {
        Self::with_artifact_store(store, ArtifactStore::new())
    }

    pub fn with_artifact_store(store: Arc<dyn OriginStore>, artifacts: ArtifactStore) -> Self {
        Self {
            store,
            artifacts: Arc::new(artifacts),
        }
    }

    pub fn store(&self) -> &Arc<dyn OriginStore> {
        &self.store
    }

    /// Upload every member of a record, members in parallel
    pub async fn upload(&self, family: CacheFamily, key: &str, payload: &Payload) -> Result<()> {
        validate_key(key)?;
        let mut puts = Vec::with_capacity(payload.len());
        for (member, artifact) in payload.iter() {
            let envelope = self.artifacts.serialize(artifact)?;
            let object = object_key(family, key, member);
            puts.push(async move { self.store.put(&object, envelope).await });
        }
        join_all(puts).await.into_iter().collect::<Result<Vec<()>>>()?;
        debug!(family = %family, key, members = payload.len(), "Uploaded record to origin");
        Ok(())
    }

    /// Fetch a complete record. `None` when any expected member is absent.
    pub async fn fetch(&self, family: CacheFamily, key: &str) -> Result<Option<Payload>> {
        validate_key(key)?;
        let members = family.expected_members();
        let gets = members.iter().map(|member| {
            let object = object_key(family, key, member);
            async move { self.store.get(&object).await }
        });
        let bodies = join_all(gets).await;

        let mut payload = Payload::new();
        let mut missing = Vec::new();
        for (member, body) in members.iter().zip(bodies) {
            match body? {
                Some(bytes) => {
                    let artifact = self
                        .artifacts
                        .deserialize(&bytes)
                        .map_err(|e| Error::Origin(format!("{}: {}", object_key(family, key, member), e)))?;
                    payload.insert(*member, artifact);
                }
                None => missing.push(*member),
            }
        }

        if missing.is_empty() {
            Ok(Some(payload))
        } else {
            if !payload.is_empty() {
                warn!(family = %family, key, ?missing, "Origin record is incomplete");
            }
            Ok(None)
        }
    }

    /// Delete every expected member of a record
    pub async fn delete(&self, family: CacheFamily, key: &str) -> Result<()> {
        validate_key(key)?;
        let deletes = family.expected_members().iter().map(|member| {
            let object = object_key(family, key, member);
            async move { self.store.delete(&object).await }
        });
        join_all(deletes).await.into_iter().collect::<Result<Vec<bool>>>()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::artifact::{Artifact, Tensor};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn garment_payload() -> Payload {
        Payload::new()
            .with("garm_img", Artifact::Blob(Bytes::from_static(b"image-bytes")))
            .with(
                "garm_tensor",
                Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap(),
            )
    }

    #[tokio::test]
    async fn test_in_memory_put_get_delete() {
        let store = InMemoryOriginStore::new();
        store.put("garment/g1/garm_img", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(
            store.get("garment/g1/garm_img").await.unwrap(),
            Some(Bytes::from_static(b"x"))
        );
        assert!(store.delete("garment/g1/garm_img").await.unwrap());
        assert!(!store.delete("garment/g1/garm_img").await.unwrap());
        assert!(store.get("garment/g1/garm_img").await.unwrap().is_none());

        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.deletes, 2);
        assert_eq!(stats.object_count, 0);
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalOriginStore::new(dir.path()).unwrap();

        store.put("text/g1/prompt_embeds", Bytes::from_static(b"abc")).await.unwrap();
        assert!(dir.path().join("text/g1/prompt_embeds").is_file());
        assert_eq!(
            store.get("text/g1/prompt_embeds").await.unwrap(),
            Some(Bytes::from_static(b"abc"))
        );
        assert!(store.get("text/g2/prompt_embeds").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalOriginStore::new(dir.path()).unwrap();
        assert_matches!(
            store.put("../outside", Bytes::new()).await,
            Err(Error::Origin(_))
        );
        assert_matches!(store.get("a//b").await, Err(Error::Origin(_)));
    }

    #[tokio::test]
    async fn test_client_upload_fetch() {
        let client = OriginClient::new(Arc::new(InMemoryOriginStore::new()));
        let payload = garment_payload();

        client.upload(CacheFamily::Garment, "g1", &payload).await.unwrap();
        let fetched = client.fetch(CacheFamily::Garment, "g1").await.unwrap();
        assert_eq!(fetched, Some(payload));
        assert_eq!(client.store().stats().object_count, 2);
    }

    #[tokio::test]
    async fn test_client_incomplete_record_is_none() {
        let store = Arc::new(InMemoryOriginStore::new());
        let client = OriginClient::new(store.clone());
        client.upload(CacheFamily::Garment, "g1", &garment_payload()).await.unwrap();
        store.delete("garment/g1/garm_tensor").await.unwrap();

        assert!(client.fetch(CacheFamily::Garment, "g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_client_corrupt_object_is_error() {
        let store = Arc::new(InMemoryOriginStore::new());
        let client = OriginClient::new(store.clone());
        client.upload(CacheFamily::Garment, "g1", &garment_payload()).await.unwrap();
        store
            .put("garment/g1/garm_img", Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        assert_matches!(
            client.fetch(CacheFamily::Garment, "g1").await,
            Err(Error::Origin(_))
        );
    }

    #[tokio::test]
    async fn test_client_delete() {
        let store = Arc::new(InMemoryOriginStore::new());
        let client = OriginClient::new(store.clone());
        client.upload(CacheFamily::Garment, "g1", &garment_payload()).await.unwrap();
        client.delete(CacheFamily::Garment, "g1").await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_stats_count_operations() {
        let store = InMemoryOriginStore::new();
        tokio_test::block_on(async {
            tokio_test::assert_ok!(store.put("text/g1/prompt_embeds", Bytes::from_static(b"e")).await);
            tokio_test::assert_ok!(store.get("text/g1/prompt_embeds").await);
            tokio_test::assert_ok!(store.get("text/g2/prompt_embeds").await);
            tokio_test::assert_ok!(store.delete("text/g1/prompt_embeds").await);
        });

        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.object_count, 0);
    }
}
