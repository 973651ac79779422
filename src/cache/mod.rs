//! Conversion Cache: content-addressed `fingerprint -> artifact` lookup
//! with at-most-one concurrent compute per key (spec §4.1).

pub mod backend;

use crate::codec::ImageMetadata;
use crate::error::{AppError, AppResult};
use crate::options::Fingerprint;
use crate::sync_ext::{CondvarExt, MutexExt};
use backend::CacheBackend;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone)]
struct EntryMeta {
    metadata: ImageMetadata,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
}

/// Outcome of an in-flight computation, observed by every follower once the
/// elected producer finishes (spec §4.1 "Coalescing").
type ProducerOutcome = Result<(Arc<Vec<u8>>, ImageMetadata), AppError>;

struct InFlight {
    lock: Mutex<Option<ProducerOutcome>>,
    cv: Condvar,
}

impl InFlight {
    fn new() -> Arc<Self> {
        Arc::new(InFlight {
            lock: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn resolve(&self, outcome: ProducerOutcome) {
        let mut guard = self.lock.lock_unpoisoned();
        *guard = Some(outcome);
        self.cv.notify_all();
    }

    fn wait(&self) -> ProducerOutcome {
        let mut guard = self.lock.lock_unpoisoned();
        while guard.is_none() {
            guard = self.cv.wait_unpoisoned(guard);
        }
        guard.clone().expect("checked Some above")
    }
}

struct Inner {
    entries: HashMap<Fingerprint, EntryMeta>,
    in_flight: HashMap<Fingerprint, Arc<InFlight>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub size_bytes: u64,
    pub max_bytes: u64,
    pub evictions: u64,
}

pub struct CacheConfig {
    pub max_bytes: u64,
    pub max_entries: usize,
    pub max_age: chrono::Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_bytes: 100 * 1024 * 1024,
            max_entries: 1000,
            max_age: chrono::Duration::hours(24),
        }
    }
}

/// The Cache Store singleton. Backend-independent; `backend` only stores
/// artifact bytes, all bookkeeping (size, LRU, in-flight) lives here.
pub struct CacheStore {
    inner: Mutex<Inner>,
    backend: Box<dyn CacheBackend>,
    config: CacheConfig,
}

impl CacheStore {
    pub fn new(backend: Box<dyn CacheBackend>, config: CacheConfig) -> Self {
        CacheStore {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            backend,
            config,
        }
    }

    /// `get_or_compute(fingerprint, producer)` (spec §4.1). Returns the
    /// artifact and whether it was already cached. Backend failures are
    /// surfaced as `CACHE_UNAVAILABLE` to the caller, who treats them as a
    /// miss and proceeds with direct computation (spec §4.1 "Failure"; the
    /// scheduler is the caller that applies that policy, see `worker`).
    pub fn get_or_compute<F>(
        &self,
        fingerprint: Fingerprint,
        producer: F,
    ) -> AppResult<(Arc<Vec<u8>>, ImageMetadata, bool)>
    where
        F: FnOnce() -> AppResult<(Vec<u8>, ImageMetadata)>,
    {
        loop {
            let (existing_flight, is_hit_meta) = {
                let mut guard = self.inner.lock_unpoisoned();
                if let Some(meta) = guard.entries.get_mut(&fingerprint) {
                    meta.last_accessed_at = Utc::now();
                    guard.hits += 1;
                    (None, Some(meta.metadata.clone()))
                } else if let Some(flight) = guard.in_flight.get(&fingerprint) {
                    (Some(flight.clone()), None)
                } else {
                    guard.misses += 1;
                    let flight = InFlight::new();
                    guard.in_flight.insert(fingerprint, flight);
                    (None, None)
                }
            };

            if let Some(metadata) = is_hit_meta {
                let bytes = self
                    .backend
                    .get(fingerprint)
                    .map_err(|e| AppError::cache_unavailable(e.to_string()))?
                    .ok_or_else(|| AppError::cache_unavailable("entry missing from backend"))?;
                return Ok((Arc::new(bytes), metadata, true));
            }

            if let Some(flight) = existing_flight {
                let outcome = flight.wait();
                match outcome {
                    Ok((bytes, metadata)) => {
                        self.inner.lock_unpoisoned().hits += 1;
                        return Ok((bytes, metadata, true));
                    }
                    Err(_) => continue, // producer failed; retry as a fresh miss
                }
            }

            // We are the elected producer for this fingerprint.
            let flight = {
                let guard = self.inner.lock_unpoisoned();
                guard.in_flight.get(&fingerprint).expect("just inserted").clone()
            };

            let result = producer();
            match result {
                Ok((bytes, metadata)) => {
                    let bytes = Arc::new(bytes);
                    self.insert(fingerprint, &bytes, metadata.clone());
                    {
                        let mut guard = self.inner.lock_unpoisoned();
                        guard.in_flight.remove(&fingerprint);
                    }
                    flight.resolve(Ok((bytes.clone(), metadata.clone())));
                    return Ok((bytes, metadata, false));
                }
                Err(err) => {
                    {
                        let mut guard = self.inner.lock_unpoisoned();
                        guard.in_flight.remove(&fingerprint);
                    }
                    flight.resolve(Err(AppError::new(err.kind(), err.message.clone())));
                    return Err(err);
                }
            }
        }
    }

    fn insert(&self, fingerprint: Fingerprint, bytes: &[u8], metadata: ImageMetadata) {
        if self.backend.put(fingerprint, bytes).is_err() {
            return; // cache failure is swallowed here; caller already has the bytes
        }
        let mut guard = self.inner.lock_unpoisoned();
        let now = Utc::now();
        guard.entries.insert(
            fingerprint,
            EntryMeta {
                metadata,
                size_bytes: bytes.len() as u64,
                created_at: now,
                last_accessed_at: now,
            },
        );
        self.evict_locked(&mut guard);
    }

    /// LRU eviction among entries not currently referenced by an in-flight
    /// computation (spec §4.1 "Eviction"). Invariant: after this returns,
    /// `size_bytes <= max_bytes` and `entries <= max_entries`.
    fn evict_locked(&self, guard: &mut Inner) {
        loop {
            let total: u64 = guard.entries.values().map(|e| e.size_bytes).sum();
            if total <= self.config.max_bytes && guard.entries.len() <= self.config.max_entries {
                break;
            }
            let victim = guard
                .entries
                .iter()
                .filter(|(fp, _)| !guard.in_flight.contains_key(*fp))
                .min_by_key(|(_, meta)| meta.last_accessed_at)
                .map(|(fp, _)| *fp);
            match victim {
                Some(fp) => {
                    guard.entries.remove(&fp);
                    let _ = self.backend.delete(fp);
                    guard.evictions += 1;
                }
                None => break, // everything left is in-flight; cannot evict further
            }
        }
    }

    /// Periodic age-based sweep (spec §4.1 "Eviction"). Intended to be
    /// called from a background thread at `cleanup_interval`.
    pub fn sweep_expired(&self) -> u64 {
        let mut guard = self.inner.lock_unpoisoned();
        let cutoff = Utc::now() - self.config.max_age;
        let stale: Vec<Fingerprint> = guard
            .entries
            .iter()
            .filter(|(fp, meta)| meta.created_at < cutoff && !guard.in_flight.contains_key(*fp))
            .map(|(fp, _)| *fp)
            .collect();
        let count = stale.len() as u64;
        for fp in stale {
            guard.entries.remove(&fp);
            let _ = self.backend.delete(fp);
            guard.evictions += 1;
        }
        count
    }

    pub fn invalidate(&self, fingerprint: Fingerprint) {
        let mut guard = self.inner.lock_unpoisoned();
        if guard.entries.remove(&fingerprint).is_some() {
            let _ = self.backend.delete(fingerprint);
        }
    }

    pub fn clear(&self) -> (usize, u64) {
        let mut guard = self.inner.lock_unpoisoned();
        let count = guard.entries.len();
        let freed: u64 = guard.entries.values().map(|e| e.size_bytes).sum();
        guard.entries.clear();
        let _ = self.backend.clear();
        (count, freed)
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.lock_unpoisoned();
        CacheStats {
            hits: guard.hits,
            misses: guard.misses,
            entries: guard.entries.len(),
            size_bytes: guard.entries.values().map(|e| e.size_bytes).sum(),
            max_bytes: self.config.max_bytes,
            evictions: guard.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ProcessingOptions;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Barrier;

    fn store(max_bytes: u64, max_entries: usize) -> CacheStore {
        CacheStore::new(
            Box::new(backend::MemoryBackend::new()),
            CacheConfig {
                max_bytes,
                max_entries,
                max_age: chrono::Duration::hours(24),
            },
        )
    }

    fn meta() -> ImageMetadata {
        ImageMetadata {
            original_format: "png".into(),
            produced_format: "png".into(),
            width: 1,
            height: 1,
            byte_size: 4,
        }
    }

    #[test]
    fn miss_then_hit_reports_was_hit_correctly() {
        let cache = store(1024, 10);
        let fp = Fingerprint::compute(b"a", &ProcessingOptions::default());
        let (_, _, was_hit) = cache.get_or_compute(fp, || Ok((vec![1, 2, 3], meta()))).unwrap();
        assert!(!was_hit);
        let (_, _, was_hit) = cache.get_or_compute(fp, || panic!("should not run")).unwrap();
        assert!(was_hit);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn producer_runs_at_most_once_for_concurrent_callers() {
        let cache = Arc::new(store(1024 * 1024, 100));
        let fp = Fingerprint::compute(b"concurrent", &ProcessingOptions::default());
        let calls = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_compute(fp, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok((vec![9, 9, 9], meta()))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for (bytes, _, _) in &results {
            assert_eq!(**bytes, vec![9, 9, 9]);
        }
    }

    #[test]
    fn eviction_keeps_size_within_budget() {
        let cache = store(50, 100);
        for i in 0..10u8 {
            let fp = Fingerprint::compute(&[i], &ProcessingOptions::default());
            cache
                .get_or_compute(fp, || Ok((vec![0u8; 20], meta())))
                .unwrap();
        }
        let stats = cache.stats();
        assert!(stats.size_bytes <= 50, "size_bytes={}", stats.size_bytes);
    }

    #[test]
    fn producer_failure_is_not_cached_and_is_retried() {
        let cache = store(1024, 10);
        let fp = Fingerprint::compute(b"fails", &ProcessingOptions::default());
        let attempt = Arc::new(AtomicU32::new(0));
        {
            let attempt = attempt.clone();
            let err = cache
                .get_or_compute(fp, || {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::codec_failed("boom"))
                })
                .unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::CodecFailed);
        }
        let (_, _, was_hit) = cache.get_or_compute(fp, || Ok((vec![1], meta()))).unwrap();
        assert!(!was_hit);
        assert_eq!(attempt.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = store(1024, 10);
        let fp = Fingerprint::compute(b"z", &ProcessingOptions::default());
        cache.get_or_compute(fp, || Ok((vec![1], meta()))).unwrap();
        cache.invalidate(fp);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn clear_reports_freed_bytes() {
        let cache = store(1024, 10);
        let fp = Fingerprint::compute(b"w", &ProcessingOptions::default());
        cache
            .get_or_compute(fp, || Ok((vec![0u8; 16], meta())))
            .unwrap();
        let (count, freed) = cache.clear();
        assert_eq!(count, 1);
        assert_eq!(freed, 16);
        assert_eq!(cache.stats().entries, 0);
    }
}
