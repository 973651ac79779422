//! End-to-end scenarios over the Scheduler/Registry/Cache/Worker stack
//! (spec §8 "Testable properties"), wired the way the teacher's top-level
//! `tests/*.rs` exercise the engine through its public facade rather than
//! internals.

use imgflux::cache::backend::MemoryBackend;
use imgflux::cache::{CacheConfig, CacheStore};
use imgflux::bus::ProgressBus;
use imgflux::domain::{JobState, TaskState};
use imgflux::options::ProcessingOptions;
use imgflux::ratelimit::{RateLimitConfig, RateLimiter};
use imgflux::registry::JobRegistry;
use imgflux::scheduler::{RawFile, Scheduler};
use imgflux::validator::{Validator, ValidatorConfig};
use imgflux::worker::WorkerPool;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    let img = image::DynamicImage::new_rgb8(w, h);
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

fn build_scheduler(max_concurrent: usize, max_backlog: usize) -> (Scheduler, Arc<CacheStore>) {
    build_scheduler_with_validator(max_concurrent, max_backlog, ValidatorConfig::default())
}

fn build_scheduler_with_validator(
    max_concurrent: usize,
    max_backlog: usize,
    validator_config: ValidatorConfig,
) -> (Scheduler, Arc<CacheStore>) {
    let registry = Arc::new(JobRegistry::new());
    let cache = Arc::new(CacheStore::new(
        Box::new(MemoryBackend::new()),
        CacheConfig {
            max_bytes: 10 * 1024 * 1024,
            max_entries: 1000,
            max_age: chrono::Duration::hours(24),
        },
    ));
    let bus = Arc::new(ProgressBus::default());
    let validator = Arc::new(Validator::new(validator_config));
    let pool = Arc::new(WorkerPool::new(max_concurrent, max_backlog, registry.clone(), cache.clone(), bus.clone()));
    (Scheduler::new(registry, validator, pool, bus), cache)
}

fn wait_for_terminal(scheduler: &Scheduler, job_id: uuid::Uuid) {
    let start = Instant::now();
    loop {
        let snapshot = scheduler.progress(job_id).unwrap();
        if snapshot.job.state.is_terminal() {
            return;
        }
        if start.elapsed() > Duration::from_secs(5) {
            panic!("job never reached a terminal state");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn batch_of_three_all_succeed() {
    let (scheduler, _cache) = build_scheduler(2, 16);
    let files = vec![
        RawFile { filename: "a.png".into(), bytes: png_bytes(4, 4), declared_mime: None },
        RawFile { filename: "b.png".into(), bytes: png_bytes(6, 6), declared_mime: None },
        RawFile { filename: "c.png".into(), bytes: png_bytes(8, 8), declared_mime: None },
    ];
    let outcome = scheduler.start_batch(ProcessingOptions::default(), files).unwrap();
    let job_id = outcome.job_id.unwrap();
    wait_for_terminal(&scheduler, job_id);

    let snapshot = scheduler.progress(job_id).unwrap();
    assert_eq!(snapshot.job.state, JobState::Completed);
    assert_eq!(snapshot.job.counters.succeeded, 3);
    assert_eq!(snapshot.job.counters.failed, 0);
    assert!(snapshot.job.counters.is_consistent());
}

#[test]
fn batch_with_one_rejection_and_one_codec_failure() {
    // Deep scan disabled so a file with a valid magic-byte header but
    // undecodable body is admitted and only fails once the worker actually
    // invokes the codec, exercising the "per-file errors never fail the
    // whole job" property (spec §8) rather than admission rejection.
    let mut validator_config = ValidatorConfig::default();
    validator_config.deep_scan_enabled = false;
    let (scheduler, _cache) = build_scheduler_with_validator(2, 16, validator_config);
    let files = vec![
        RawFile { filename: "good.png".into(), bytes: png_bytes(4, 4), declared_mime: None },
        RawFile { filename: "rejected.txt".into(), bytes: b"plain text".to_vec(), declared_mime: Some("text/plain".into()) },
        // Declares PNG and passes the magic-byte sniff boundary loosely enough to be admitted,
        // but is not actually decodable -> CODEC_FAILED at the worker stage.
        RawFile {
            filename: "corrupt.png".into(),
            bytes: {
                let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
                bytes.extend_from_slice(b"not really png data after the header");
                bytes
            },
            declared_mime: Some("image/png".into()),
        },
    ];
    let outcome = scheduler.start_batch(ProcessingOptions::default(), files).unwrap();
    assert_eq!(outcome.admitted.len(), 3);
    assert!(outcome.admitted[0].accepted);
    assert!(!outcome.admitted[1].accepted);
    assert!(outcome.admitted[2].accepted, "admission only sniffs headers, deep codec failure surfaces later");

    let job_id = outcome.job_id.unwrap();
    wait_for_terminal(&scheduler, job_id);
    let snapshot = scheduler.progress(job_id).unwrap();
    assert_eq!(snapshot.job.counters.total, 2, "only the two admitted files became tasks");
    assert_eq!(snapshot.job.counters.succeeded, 1);
    assert_eq!(snapshot.job.counters.failed, 1);
    assert!(snapshot.job.counters.is_consistent());

    let failed_task = snapshot
        .job
        .tasks
        .iter()
        .find(|t| t.state == TaskState::Failed)
        .unwrap();
    assert_eq!(failed_task.outcome.error_code, Some("CODEC_FAILED"));
}

#[test]
fn cache_coalesces_identical_concurrent_single_file_requests() {
    let cache = Arc::new(CacheStore::new(Box::new(MemoryBackend::new()), CacheConfig::default()));
    let options = ProcessingOptions::default();
    let bytes = png_bytes(16, 16);
    let fingerprint = imgflux::options::Fingerprint::compute(&bytes, &options);

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let calls = calls.clone();
            let bytes = bytes.clone();
            let options = options.clone();
            std::thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_compute(fingerprint, || {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        imgflux::codec::convert(&bytes, &options)
                    })
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn cancel_mid_batch_drains_pending_tasks_as_skipped() {
    let (scheduler, _cache) = build_scheduler(0, 16); // zero workers: nothing drains the queue
    let files: Vec<RawFile> = (0..3)
        .map(|i| RawFile { filename: format!("f{i}.png"), bytes: png_bytes(4, 4), declared_mime: None })
        .collect();
    let outcome = scheduler.start_batch(ProcessingOptions::default(), files).unwrap();
    let job_id = outcome.job_id.unwrap();

    let before = scheduler.progress(job_id).unwrap();
    assert!(before.job.tasks.iter().all(|t| t.state == TaskState::Pending));

    let prior = scheduler.cancel(job_id).unwrap();
    assert_eq!(prior, JobState::Running);

    wait_for_terminal(&scheduler, job_id);
    let snapshot = scheduler.progress(job_id).unwrap();
    assert_eq!(snapshot.job.state, JobState::Cancelled);
    assert!(snapshot.job.tasks.iter().all(|t| t.state == TaskState::SkippedCancel));
}

#[test]
fn eviction_keeps_cache_within_a_small_budget() {
    let cache = CacheStore::new(
        Box::new(MemoryBackend::new()),
        CacheConfig { max_bytes: 200, max_entries: 100, max_age: chrono::Duration::hours(24) },
    );
    for i in 0..20u32 {
        let bytes = png_bytes(2 + (i % 3), 2);
        let fingerprint = imgflux::options::Fingerprint::compute(&bytes, &ProcessingOptions::default());
        cache
            .get_or_compute(fingerprint, || imgflux::codec::convert(&bytes, &ProcessingOptions::default()))
            .unwrap();
    }
    let stats = cache.stats();
    assert!(stats.size_bytes <= 200, "size_bytes={}", stats.size_bytes);
    assert!(stats.evictions > 0, "a 200-byte budget over 20 PNGs must evict something");
}

#[test]
fn rate_limiter_denies_past_burst_then_recovers() {
    let limiter = RateLimiter::new(RateLimitConfig { capacity: 2.0, refill_rate_per_sec: 1000.0 });
    assert!(limiter.check("client", 1.0).allowed);
    assert!(limiter.check("client", 1.0).allowed);
    assert!(!limiter.check("client", 1.0).allowed);
    std::thread::sleep(Duration::from_millis(5));
    assert!(limiter.check("client", 1.0).allowed, "fast refill rate should have topped the bucket back up");
}
