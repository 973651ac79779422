//! Composition root: constructs the process-wide singletons (cache,
//! registry, bus, limiter, validator, worker pool) and wires them into the
//! Scheduler and the HTTP router, the way `TranscodingEngine::new` wires
//! the teacher's own singletons into one facade (`ffui_core::engine::
//! TranscodingEngine::new`).

use crate::bus::ProgressBus;
use crate::cache::backend::{CacheBackend, DiskBackend, MemoryBackend};
use crate::cache::CacheStore;
use crate::config::{AppConfig, CacheBackendKind};
use crate::http::state::AppState;
use crate::ratelimit::RateLimiter;
use crate::registry::JobRegistry;
use crate::scheduler::Scheduler;
use crate::validator::Validator;
use crate::worker::WorkerPool;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Everything the binary needs to serve traffic and run background sweeps.
pub struct App {
    pub state: AppState,
    pub config: Arc<AppConfig>,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);

        let backend: Box<dyn CacheBackend> = match config.cache.backend {
            CacheBackendKind::Memory => Box::new(MemoryBackend::new()),
            CacheBackendKind::Disk => Box::new(DiskBackend::new(config.cache.disk_dir.as_str())?),
        };
        let cache = Arc::new(CacheStore::new(backend, config.cache_config()));

        let registry = Arc::new(JobRegistry::new());
        let bus = Arc::new(ProgressBus::default());
        let validator = Arc::new(Validator::new(config.validator_config()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));

        let worker_pool = Arc::new(WorkerPool::new(
            config.processing.max_concurrent_files,
            config.processing.max_queue_size,
            registry.clone(),
            cache.clone(),
            bus.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            validator.clone(),
            worker_pool,
            bus.clone(),
        ));

        let state = AppState {
            scheduler,
            cache,
            validator,
            rate_limiter,
            bus,
            config: config.clone(),
        };

        Ok(App { state, config })
    }

    /// Spawn the periodic cache sweep and job-reap janitors (spec §4.1
    /// "Sweeps run at a configurable interval on a single background
    /// worker", §4.4 `reap`).
    pub fn spawn_background_sweeps(&self) {
        let cache = self.state.cache.clone();
        let interval = Duration::from_secs(self.config.cache.cleanup_interval_minutes.max(1) * 60);
        std::thread::Builder::new()
            .name("imgflux-cache-sweep".into())
            .spawn(move || loop {
                std::thread::sleep(interval);
                let expired = cache.sweep_expired();
                if expired > 0 {
                    tracing::info!(expired, "cache sweep removed expired entries");
                }
            })
            .expect("failed to spawn cache sweep thread");

        let scheduler = self.state.scheduler.clone();
        let retention = chrono::Duration::hours(self.config.server.job_retention_hours);
        std::thread::Builder::new()
            .name("imgflux-job-reap".into())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_secs(300));
                let reaped = scheduler.cleanup(retention);
                if reaped > 0 {
                    tracing::info!(reaped, "reaped terminal jobs past retention");
                }
            })
            .expect("failed to spawn job reap thread");
    }

    pub fn router(&self) -> axum::Router {
        crate::http::routes::build_router(self.state.clone())
    }
}
