//! Limit resolution with a short per-process cache.
//!
//! Resolution order for a (service, feature) request:
//!
//! 1. enabled feature-scoped `slot_limits` row
//! 2. enabled service-wide row (`feature IS NULL`)
//! 3. static default for the feature key
//! 4. static default for the `__all__` key
//! 5. unlimited
//!
//! The scope a limit was found at is also the scope slots are counted in, so a
//! service-wide limit caps every feature of that service together.

use crate::config::SlotBrokerConfig;
use crate::constants::slot_defaults;
use crate::database::SlotStore;
use crate::error::PipelineResult;
use crate::models::SlotLimit;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A limit ready for the acquire loop
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLimit {
    pub service: String,
    /// Counting scope; `None` when the limit is service-wide
    pub feature: Option<String>,
    pub max_slots: i32,
    pub wait_interval: Duration,
    /// `None` waits without bound
    pub wait_timeout: Option<Duration>,
    pub slot_ttl: Duration,
}

impl ResolvedLimit {
    fn from_row(row: SlotLimit) -> Option<Self> {
        if row.max_slots <= 0 {
            return None;
        }
        Some(Self {
            service: row.service,
            feature: row.feature,
            max_slots: row.max_slots,
            wait_interval: seconds(row.wait_interval_seconds).max(slot_defaults::MIN_INTERVAL),
            wait_timeout: row.wait_timeout_seconds.map(seconds),
            slot_ttl: seconds(row.slot_ttl_seconds).max(slot_defaults::MIN_INTERVAL),
        })
    }

    fn from_default(
        config: &SlotBrokerConfig,
        service: &str,
        feature: Option<&str>,
        max_slots: i32,
    ) -> Self {
        Self {
            service: service.to_string(),
            feature: feature.map(str::to_string),
            max_slots,
            wait_interval: config.wait_interval(),
            wait_timeout: config.wait_timeout(),
            slot_ttl: config.slot_ttl(),
        }
    }
}

struct CachedLimit {
    /// `None` caches "unlimited"
    limit: Option<ResolvedLimit>,
    expires_at: Instant,
}

type CacheKey = (String, Option<String>);

pub struct LimitResolver {
    store: Arc<dyn SlotStore>,
    config: RwLock<SlotBrokerConfig>,
    cache: DashMap<CacheKey, CachedLimit>,
}

impl LimitResolver {
    pub fn new(store: Arc<dyn SlotStore>, config: SlotBrokerConfig) -> Self {
        Self {
            store,
            config: RwLock::new(config),
            cache: DashMap::new(),
        }
    }

    /// Resolve the effective limit; `Ok(None)` means unlimited
    pub async fn resolve(
        &self,
        service: &str,
        feature: Option<&str>,
    ) -> PipelineResult<Option<ResolvedLimit>> {
        let key = (service.to_string(), feature.map(str::to_string));
        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.limit.clone());
            }
        }

        let resolved = self.load(service, feature).await?;
        let ttl = self.config.read().limit_cache_ttl();
        debug!(
            service = %service,
            feature = ?feature,
            max_slots = resolved.as_ref().map(|l| l.max_slots),
            "Slot limit resolved"
        );
        self.cache.insert(
            key,
            CachedLimit {
                limit: resolved.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(resolved)
    }

    async fn load(
        &self,
        service: &str,
        feature: Option<&str>,
    ) -> PipelineResult<Option<ResolvedLimit>> {
        if feature.is_some() {
            if let Some(row) = self.store.get_slot_limit(service, feature).await? {
                return Ok(ResolvedLimit::from_row(row));
            }
        }
        if let Some(row) = self.store.get_slot_limit(service, None).await? {
            return Ok(ResolvedLimit::from_row(row));
        }

        let config = self.config.read();
        if feature.is_some() {
            if let Some(max) = config.default_limit(service, feature) {
                return Ok(Some(ResolvedLimit::from_default(
                    &config, service, feature, max,
                )));
            }
        }
        Ok(config
            .default_limit(service, None)
            .map(|max| ResolvedLimit::from_default(&config, service, None, max)))
    }

    /// Drop every cached resolution
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    /// Drop the cached resolution for one scope
    pub fn invalidate_scope(&self, service: &str, feature: Option<&str>) {
        self.cache
            .remove(&(service.to_string(), feature.map(str::to_string)));
    }

    /// Swap in new static defaults and forget everything resolved under the old ones
    pub fn apply_config(&self, config: SlotBrokerConfig) {
        *self.config.write() = config;
        self.invalidate();
    }

    pub fn config(&self) -> SlotBrokerConfig {
        self.config.read().clone()
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
