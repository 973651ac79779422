//! Shared application state handed to every axum handler (spec §4.8).

use crate::bus::ProgressBus;
use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::ratelimit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::validator::Validator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub cache: Arc<CacheStore>,
    pub validator: Arc<Validator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub bus: Arc<ProgressBus>,
    pub config: Arc<AppConfig>,
}
