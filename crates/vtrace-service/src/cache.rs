//! Fingerprint-keyed result cache with single-flight builds.
//!
//! At most one computation per fingerprint is ever in flight: concurrent
//! requesters join the same shared future. Failed builds leave no marker
//! behind, so a later retry is never blocked by a stale failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use vtrace_models::{ConversionError, Fingerprint, VectorResult};

type BuildResult = Result<Arc<VectorResult>, ConversionError>;
type BuildFuture = Shared<BoxFuture<'static, BuildResult>>;

struct CacheEntry {
    result: Arc<VectorResult>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    hit_count: u64,
    last_hit: Instant,
}

struct CacheInner {
    entries: HashMap<Fingerprint, CacheEntry>,
    pending: HashMap<Fingerprint, BuildFuture>,
    /// Bumped by `clear()`; in-flight builds from an older generation
    /// are not stored on completion.
    generation: u64,
}

/// In-memory result cache, bounded by least-recently-hit eviction of
/// completed entries. Pending builds are never evicted.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Mutex<CacheInner>>,
    capacity: usize,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                pending: HashMap::new(),
                generation: 0,
            })),
            capacity: capacity.max(1),
        }
    }

    /// Return the cached result for `fingerprint`, join the in-flight
    /// build for it, or start `compute` as the sole build.
    pub async fn get_or_compute<F>(&self, fingerprint: Fingerprint, compute: F) -> BuildResult
    where
        F: Future<Output = BuildResult> + Send + 'static,
    {
        let (build, started_build) = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(entry) = inner.entries.get_mut(&fingerprint) {
                entry.hit_count += 1;
                entry.last_hit = Instant::now();
                debug!(fingerprint = %fingerprint, hits = entry.hit_count, "result cache hit");
                return Ok(Arc::clone(&entry.result));
            }

            if let Some(pending) = inner.pending.get(&fingerprint) {
                debug!(fingerprint = %fingerprint, "joining in-flight computation");
                (pending.clone(), false)
            } else {
                let store = Arc::clone(&self.inner);
                let capacity = self.capacity;
                let generation = inner.generation;
                let key = fingerprint.clone();
                let build: BuildFuture = async move {
                    let result = compute.await;
                    settle(&store, capacity, &key, generation, &result);
                    result
                }
                .boxed()
                .shared();
                inner.pending.insert(fingerprint, build.clone());
                (build, true)
            }
        };

        if started_build {
            // Drive the build independently so it completes (and is
            // stored) even if every requester stops polling.
            tokio::spawn(build.clone().map(|_| ()));
        }
        build.await
    }

    /// Drop all entries and pending markers. In-flight computations keep
    /// running but are no longer cached on completion.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.pending.clear();
        inner.generation += 1;
        debug!(dropped, "result cache cleared");
    }

    /// Number of completed entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Store a finished build and forget its pending marker.
fn settle(
    store: &Mutex<CacheInner>,
    capacity: usize,
    key: &Fingerprint,
    generation: u64,
    result: &BuildResult,
) {
    let mut inner = store.lock().unwrap();
    if inner.generation != generation {
        // The cache was cleared while this build ran.
        return;
    }

    inner.pending.remove(key);
    if let Ok(value) = result {
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                result: Arc::clone(value),
                created_at: Utc::now(),
                hit_count: 0,
                last_hit: Instant::now(),
            },
        );

        while inner.entries.len() > capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_hit)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(victim) => {
                    inner.entries.remove(&victim);
                    debug!(fingerprint = %victim, "evicted least-recently-hit entry");
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use vtrace_models::{ConversionConfig, ImagePayload};

    fn fingerprint(n: u8) -> Fingerprint {
        let image = ImagePayload::new(1, 1, vec![n; 4]).unwrap();
        Fingerprint::compute(&image, &ConversionConfig::default())
    }

    fn result(ms: u64) -> Arc<VectorResult> {
        Arc::new(VectorResult {
            svg: "<svg/>".to_string(),
            path_count: 1,
            node_count: 1,
            processing_time_ms: ms,
        })
    }

    #[tokio::test]
    async fn concurrent_requests_compute_once() {
        let cache = ResultCache::new(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = fingerprint(1);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key, async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(result(7))
                    })
                    .await
            }));
        }

        let mut outputs = Vec::new();
        for handle in handles {
            outputs.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Every caller shares the same result object.
        for output in &outputs[1..] {
            assert!(Arc::ptr_eq(&outputs[0], output));
        }
    }

    #[tokio::test]
    async fn failed_build_leaves_no_marker() {
        let cache = ResultCache::new(8);
        let key = fingerprint(2);

        let out = cache
            .get_or_compute(key.clone(), async {
                Err(ConversionError::worker_lost("gone"))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(cache.len(), 0);

        // A retry is not blocked by the earlier failure.
        let out = cache.get_or_compute(key, async { Ok(result(1)) }).await;
        assert!(out.is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn completed_entry_is_served_without_recompute() {
        let cache = ResultCache::new(8);
        let key = fingerprint(3);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            cache
                .get_or_compute(key.clone(), async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(result(1))
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_forgets_in_flight_builds() {
        let cache = ResultCache::new(8);
        let key = fingerprint(4);

        let slow = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(key, async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(result(1))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.clear();

        // The in-flight build still settles for its requesters...
        assert!(slow.await.unwrap().is_ok());
        // ...but is not stored in the cleared cache.
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_hit() {
        let cache = ResultCache::new(2);

        for n in 0..2u8 {
            cache
                .get_or_compute(fingerprint(n), async move { Ok(result(n as u64)) })
                .await
                .unwrap();
        }

        // Touch entry 0 so entry 1 is the eviction candidate.
        cache
            .get_or_compute(fingerprint(0), async { unreachable!() })
            .await
            .unwrap();

        cache
            .get_or_compute(fingerprint(2), async { Ok(result(2)) })
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        // Entry 1 was evicted; recomputing it runs the closure again.
        let recomputed = Arc::new(AtomicUsize::new(0));
        let marker = Arc::clone(&recomputed);
        cache
            .get_or_compute(fingerprint(1), async move {
                marker.fetch_add(1, Ordering::SeqCst);
                Ok(result(1))
            })
            .await
            .unwrap();
        assert_eq!(recomputed.load(Ordering::SeqCst), 1);
    }
}
