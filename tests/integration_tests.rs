//! VTON Cache Integration Tests
//!
//! End-to-end behaviour across the public API:
//! - Tiered cache: round trip, LRU with disk fallback, TTL, quota sweep
//! - Stampede prevention and per-key isolation
//! - Generation gate ordering through the service
//! - HTTP surface

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use vton_cache::cache::{
    BodyCategory, CacheConfig, CacheEntry, CacheFamily, CacheTier, L1Cache, L1Config, L2Config, Payload,
    PixelFormat, RasterImage, Tensor, TieredCache,
};

/// Deterministic, poorly-compressible bytes
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn garment(seed: u64, side: u32) -> Payload {
    let pixels = noise(seed, (side * side * 3) as usize);
    let image = RasterImage::new(side, side, PixelFormat::Rgb8, Bytes::from(pixels)).unwrap();
    let tensor = Tensor::from_f32(vec![1, 4], &[seed as f32, 1.0, 2.0, 3.0]).unwrap();
    Payload::new().with("garm_img", image).with("garm_tensor", tensor)
}

fn config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        l2: L2Config {
            root: dir.path().to_path_buf(),
            ..Default::default()
        },
        ..Default::default()
    }
}

// =============================================================================
// Tiered cache
// =============================================================================

mod cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let cache = TieredCache::open(config(&dir)).unwrap();

        let payload = garment(7, 16);
        cache.put_garment("g1", payload.clone()).await.unwrap();
        let got = cache.get_garment("g1").await.unwrap().unwrap();
        assert_eq!(got.as_ref(), &payload);

        // and through disk alone
        let reopened = TieredCache::open(config(&dir)).unwrap();
        let got = reopened.get_garment("g1").await.unwrap().unwrap();
        assert_eq!(got.image("garm_img").unwrap().pixels(), payload.image("garm_img").unwrap().pixels());
        assert_eq!(got.tensor("garm_tensor"), payload.tensor("garm_tensor"));
    }

    #[tokio::test]
    async fn test_lru_victim_is_least_recently_accessed_and_served_from_l2() {
        let dir = TempDir::new().unwrap();
        let cache = TieredCache::open(CacheConfig {
            l1_max_garments: 3,
            ..config(&dir)
        })
        .unwrap();

        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            cache.put_garment(key, garment(i as u64, 4)).await.unwrap();
        }
        // "a" was inserted first but touched last
        cache.get_garment("a").await.unwrap().unwrap();
        cache.put_garment("d", garment(9, 4)).await.unwrap();

        let l1 = cache.l1(CacheFamily::Garment);
        assert!(!l1.contains("b"));
        assert!(l1.contains("a"));

        let result = cache
            .get_or_fetch(CacheFamily::Garment, "b", || async { Ok(None) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.tier, CacheTier::L2);
        assert_eq!(result.payload.as_ref(), &garment(1, 4));
        assert!(l1.contains("b"));
    }

    #[tokio::test]
    async fn test_restart_scenario() {
        let dir = TempDir::new().unwrap();
        let payload = garment(3, 8);
        {
            let cache = TieredCache::open(config(&dir)).unwrap();
            cache.put_garment("g1", payload.clone()).await.unwrap();
            assert_eq!(cache.get_garment("g1").await.unwrap().unwrap().as_ref(), &payload);
        }

        let cache = TieredCache::open(config(&dir)).unwrap();
        assert!(cache.l1(CacheFamily::Garment).is_empty());
        let got = cache.get_garment("g1").await.unwrap().unwrap();
        assert_eq!(got.as_ref(), &payload);
        assert!(cache.l1(CacheFamily::Garment).contains("g1"));

        let family = cache.stats().family("garment").cloned().unwrap();
        assert_eq!(family.l2_hits, 1);
        assert_eq!(family.l1_hits, 0);
    }

    #[tokio::test]
    async fn test_clear_all_then_every_key_misses() {
        let dir = TempDir::new().unwrap();
        let cache = TieredCache::open(config(&dir)).unwrap();

        cache.put_garment("g1", garment(1, 4)).await.unwrap();
        cache.put_garment("g2", garment(2, 4)).await.unwrap();
        cache.clear_all().await.unwrap();

        assert!(cache.get_garment("g1").await.unwrap().is_none());
        assert!(cache.get_garment("g2").await.unwrap().is_none());
        for family in CacheFamily::ALL {
            assert!(cache.l1(family).is_empty());
        }
        assert_eq!(cache.l2().usage_bytes(), 0);
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_quota_sweep_removes_oldest_records() {
        // Measure one record, then size the quota around it
        let probe_dir = TempDir::new().unwrap();
        let probe = TieredCache::open(config(&probe_dir)).unwrap();
        probe.put_garment("probe", garment(100, 32)).await.unwrap();
        let record = probe.l2().usage_bytes();
        assert!(record > 0);

        let dir = TempDir::new().unwrap();
        let cache = TieredCache::open(CacheConfig {
            l2: L2Config {
                root: dir.path().to_path_buf(),
                quota_bytes: record * 3 + record / 2,
                target_ratio: 0.5,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

        for i in 1..=4u64 {
            cache.put_garment(&format!("g{}", i), garment(100 + i, 32)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let l2 = cache.l2();
        assert!(l2.usage_bytes() <= l2.config().target_bytes());
        assert!(l2.contains(CacheFamily::Garment, "g4"));
        for key in ["g1", "g2", "g3"] {
            assert!(!l2.contains(CacheFamily::Garment, key));
        }
        assert!(cache.stats().l2.sweeps >= 1);
    }

    #[test]
    fn test_expired_l1_entry_is_a_miss_below_capacity() {
        let l1 = L1Cache::with_config(
            "garment",
            L1Config {
                capacity: 10,
                base_ttl: Duration::from_millis(30),
            },
        );
        l1.put("g1", Arc::new(garment(1, 2)));
        assert!(l1.get("g1").is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(l1.get("g1").is_none());
        assert_eq!(l1.expirations(), 1);
    }

    #[test]
    fn test_hot_entries_live_longer() {
        let base = Duration::from_secs(60);
        let mut entry = CacheEntry::new("g1", Arc::new(garment(1, 2)), base);
        assert_eq!(entry.access_count(), 1);

        for _ in 0..8 {
            entry.record_access();
        }
        assert_eq!(entry.access_count(), 9);
        assert_eq!(entry.effective_ttl(), base);

        entry.record_access();
        assert_eq!(entry.effective_ttl(), base * 2);

        for _ in 0..40 {
            entry.record_access();
        }
        assert_eq!(entry.access_count(), 50);
        assert_eq!(entry.effective_ttl(), base * 4);
    }
}

// =============================================================================
// Stampede prevention
// =============================================================================

mod stampede_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_resolve_once() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(TieredCache::open(config(&dir)).unwrap());
        let fetches = Arc::new(AtomicU64::new(0));
        const N: u64 = 8;

        let tasks: Vec<_> = (0..N)
            .map(|_| {
                let (cache, fetches) = (cache.clone(), fetches.clone());
                tokio::spawn(async move {
                    cache
                        .get_or_fetch(CacheFamily::Garment, "hot", || async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok(Some(garment(42, 4)))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let result = task.await.unwrap().unwrap().unwrap();
            assert_eq!(result.payload.as_ref(), &garment(42, 4));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        let family = cache.stats().family("garment").cloned().unwrap();
        assert_eq!(family.stampede_prevented, N - 1);
        assert_eq!(family.origin_hits, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_distinct_keys_do_not_block_each_other() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(TieredCache::open(config(&dir)).unwrap());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow_cache = cache.clone();
        let slow = tokio::spawn(async move {
            slow_cache
                .get_or_fetch(CacheFamily::Garment, "slow", || async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(Some(garment(1, 4)))
                })
                .await
        });
        started_rx.await.unwrap();

        // While "slow" is held mid-load, another key resolves immediately
        let fast = tokio::time::timeout(
            Duration::from_secs(2),
            cache.get_or_fetch(CacheFamily::Garment, "fast", || async { Ok(Some(garment(2, 4))) }),
        )
        .await
        .expect("independent key was blocked")
        .unwrap()
        .unwrap();
        assert_eq!(fast.payload.as_ref(), &garment(2, 4));

        release_tx.send(()).unwrap();
        assert!(slow.await.unwrap().unwrap().is_some());
    }
}

// =============================================================================
// Service and generation gate
// =============================================================================

mod service_tests {
    use super::*;
    use parking_lot::Mutex;
    use vton_cache::cache::{InMemoryOriginStore, OriginClient};
    use vton_cache::generation::{GateConfig, GenerationGate};
    use vton_cache::models::{ModelSet, ReferenceConfig, ReferencePipeline};
    use vton_cache::service::{GenerateRequest, ServiceConfig, TryOnService};

    pub(crate) fn small_models(delay: Duration) -> (ModelSet, Arc<ReferencePipeline>) {
        let pipeline = Arc::new(ReferencePipeline::new(ReferenceConfig {
            width: 12,
            height: 16,
            embed_tokens: 2,
            embed_dim: 4,
            pooled_dim: 2,
            generate_delay: delay,
        }));
        let models = ModelSet {
            body: pipeline.clone(),
            garment: pipeline.clone(),
            text: pipeline.clone(),
            generator: pipeline.clone(),
        };
        (models, pipeline)
    }

    pub(crate) fn service(dir: &TempDir, delay: Duration) -> (Arc<TryOnService>, Arc<ReferencePipeline>) {
        let cache = Arc::new(TieredCache::open(config(dir)).unwrap());
        let (models, pipeline) = small_models(delay);
        let service = TryOnService::new(
            cache,
            OriginClient::new(Arc::new(InMemoryOriginStore::new())),
            models,
            GenerationGate::with_config(GateConfig::default()),
            ServiceConfig::default(),
        );
        (Arc::new(service), pipeline)
    }

    pub(crate) fn photo(seed: u64) -> RasterImage {
        RasterImage::new(10, 10, PixelFormat::Rgb8, Bytes::from(noise(seed, 300))).unwrap()
    }

    async fn preprocess_all(service: &TryOnService) {
        service
            .preprocess_body("u1", &photo(1), BodyCategory::UpperBody)
            .await
            .unwrap();
        service.preprocess_garment("g1", &photo(2)).await.unwrap();
        service.preprocess_text("g1", "red shirt").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_gate_serializes_generation_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let (service, pipeline) = service(&dir, Duration::from_millis(40));
        preprocess_all(&service).await;

        let finished = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..4u64 {
            let (service, finished) = (service.clone(), finished.clone());
            tasks.push(tokio::spawn(async move {
                let outcome = service
                    .generate(GenerateRequest {
                        user_id: "u1".into(),
                        garment_id: "g1".into(),
                        seed: Some(i),
                        ..Default::default()
                    })
                    .await
                    .unwrap();
                finished.lock().push(i);
                outcome
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut tickets = Vec::new();
        for task in tasks {
            tickets.push(task.await.unwrap().ticket);
        }

        assert_eq!(pipeline.peak_concurrency(), 1);
        assert_eq!(pipeline.generations(), 4);
        assert_eq!(*finished.lock(), vec![0, 1, 2, 3]);
        assert!(tickets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(service.stats().generation.completed, 4);
    }

    #[tokio::test]
    async fn test_invalidated_records_rewarm_from_origin() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir, Duration::ZERO);
        preprocess_all(&service).await;

        service.invalidate_garment("g1").await.unwrap();
        assert!(service.cache().get_garment("g1").await.unwrap().is_none());

        let outcome = service
            .generate(GenerateRequest {
                user_id: "u1".into(),
                garment_id: "g1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.sources.human, CacheTier::L1);
        assert_eq!(outcome.sources.garment, CacheTier::Origin);
        assert_eq!(outcome.sources.text, CacheTier::Origin);
        assert_eq!(outcome.steps, 20);
        assert_eq!(outcome.seed, 42);

        // back in the cache tiers now
        assert!(service.cache().get_garment("g1").await.unwrap().is_some());
    }
}

// =============================================================================
// HTTP surface
// =============================================================================

mod http_tests {
    use super::service_tests::{photo, service};
    use super::*;
    use http_body_util::{BodyExt, Full};
    use hyper::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;
    use vton_cache::server::{decode_image, encode_image, handle, serve_listener, AppState};

    fn state(dir: &TempDir, max_body_bytes: usize) -> Arc<AppState> {
        let (service, _) = service(dir, Duration::ZERO);
        Arc::new(AppState::new(service, max_body_bytes).unwrap())
    }

    async fn call(state: &Arc<AppState>, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let bytes = body.map(|b| serde_json::to_vec(&b).unwrap()).unwrap_or_default();
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap();
        let response = handle(state.clone(), request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_full_flow_over_http() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir, 1024 * 1024);

        let (status, body) = call(
            &state,
            Method::POST,
            "/preprocess/body",
            Some(json!({ "user_id": "u1", "image": encode_image(&photo(1)).unwrap() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["family"], "human_upper_body");

        let (status, body) = call(
            &state,
            Method::POST,
            "/preprocess/garment",
            Some(json!({ "garment_id": "g1", "image": encode_image(&photo(2)).unwrap() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["members"].as_array().unwrap().len(), 2);

        let (status, _) = call(
            &state,
            Method::POST,
            "/preprocess/text",
            Some(json!({ "garment_id": "g1", "description": "blue denim jacket" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &state,
            Method::POST,
            "/generate",
            Some(json!({ "user_id": "u1", "garment_id": "g1", "steps": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["steps"], 10);
        assert_eq!(body["sources"]["garment"], "l1");
        let image = decode_image(body["result_image"].as_str().unwrap()).unwrap();
        assert!(image.width() > 0);

        let (status, body) = call(&state, Method::GET, "/cache/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generation"]["completed"], 1);
    }

    #[tokio::test]
    async fn test_generate_without_records_is_404() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir, 1024 * 1024);

        let (status, body) = call(
            &state,
            Method::POST,
            "/generate",
            Some(json!({ "user_id": "nobody", "garment_id": "nothing" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_cached");
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_request_errors() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir, 256);

        let (status, body) = call(&state, Method::GET, "/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, _) = call(&state, Method::GET, "/generate", None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, body) = call(&state, Method::POST, "/preprocess/text", Some(json!({ "garment_id": "g1" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");

        let (status, body) = call(
            &state,
            Method::POST,
            "/preprocess/text",
            Some(json!({ "garment_id": "../etc", "description": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_key");

        let huge = "x".repeat(1024);
        let (status, body) = call(
            &state,
            Method::POST,
            "/preprocess/text",
            Some(json!({ "garment_id": "g1", "description": huge })),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["kind"], "payload_too_large");
    }

    #[tokio::test]
    async fn test_invalidate_routes() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir, 1024 * 1024);
        let (status, _) = call(
            &state,
            Method::POST,
            "/preprocess/text",
            Some(json!({ "garment_id": "g1", "description": "scarf" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&state, Method::DELETE, "/cache/garment/g1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], "garment:g1");
        assert!(state.service.cache().get_text("g1").await.unwrap().is_none());

        let (status, _) = call(&state, Method::DELETE, "/cache/user/u1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, Method::DELETE, "/cache/all", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir, 1024 * 1024);
        call(&state, Method::GET, "/healthz", None).await;

        let request = Request::builder()
            .uri("/metrics")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handle(state.clone(), request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("vton_cache_l1_capacity"));
        assert!(text.contains("vton_http_requests_total"));
    }

    #[tokio::test]
    async fn test_server_accepts_connections_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir, 1024 * 1024);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_listener(listener, state, shutdown.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"ok\""));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
