//! # Slot Broker
//!
//! Admission control over (service, feature) pairs shared by every worker process
//! that talks to the same store.
//!
//! ## Overview
//!
//! A caller asks for a slot before invoking a rate-limited provider and releases it
//! afterwards. The broker resolves the effective limit, then loops:
//!
//! 1. reclaim expired slots in the scope (bounded batch)
//! 2. atomically count live slots and insert a new one if below the limit
//! 3. otherwise sleep for the wait interval, or the remaining wait time if shorter
//!
//! until a slot is granted or the wait timeout elapses. Slots carry a TTL so capacity
//! held by a crashed worker comes back through [`SlotBroker::purge_expired`] without
//! anyone releasing it.
//!
//! ## Invariant
//!
//! For every scope with `max_slots = N`, the number of active unexpired slots never
//! exceeds N. The count-and-insert step is the only place a slot is created and the
//! store performs it atomically.

pub mod limits;

pub use limits::{LimitResolver, ResolvedLimit};

use crate::config::SlotBrokerConfig;
use crate::constants::slot_defaults;
use crate::database::SlotStore;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::log_slot_operation;
use crate::models::{normalize_key, SlotRequest, SlotToken};
use crate::state_machine::SlotStatus;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

/// Per-call overrides for `acquire`
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub wait_timeout: Option<Duration>,
    pub slot_ttl: Option<Duration>,
    pub metadata: Option<Value>,
}

impl AcquireOptions {
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    pub fn slot_ttl(mut self, ttl: Duration) -> Self {
        self.slot_ttl = Some(ttl);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub struct SlotBroker {
    store: Arc<dyn SlotStore>,
    limits: LimitResolver,
}

impl SlotBroker {
    pub fn new(store: Arc<dyn SlotStore>, config: SlotBrokerConfig) -> Self {
        info!(
            wait_interval_seconds = config.wait_interval_seconds,
            slot_ttl_seconds = config.slot_ttl_seconds,
            default_services = config.defaults.len(),
            "🎟️ Slot broker initialized"
        );
        Self {
            limits: LimitResolver::new(store.clone(), config),
            store,
        }
    }

    /// Acquire a slot, waiting for capacity up to the effective wait timeout.
    ///
    /// Returns an unlimited token without touching the store when no limit applies.
    #[instrument(skip(self, options), fields(service = %service, feature = ?feature))]
    pub async fn acquire(
        &self,
        service: &str,
        feature: Option<&str>,
        resource_id: Option<&str>,
        options: AcquireOptions,
    ) -> PipelineResult<SlotToken> {
        let service_key = normalize_key(service);
        let feature_key = feature.map(normalize_key);

        let Some(limit) = self
            .limits
            .resolve(&service_key, feature_key.as_deref())
            .await?
        else {
            debug!("No slot limit configured, admitting without a lease");
            return Ok(SlotToken::unlimited(
                &service_key,
                feature_key.as_deref(),
                resource_id,
            ));
        };

        let wait_timeout = options.wait_timeout.or(limit.wait_timeout);
        let request = SlotRequest {
            service: limit.service.clone(),
            feature: limit.feature.clone(),
            resource_id: resource_id.map(str::to_string),
            max_slots: limit.max_slots,
            ttl: options
                .slot_ttl
                .unwrap_or(limit.slot_ttl)
                .max(slot_defaults::MIN_INTERVAL),
            metadata: options.metadata,
        };

        let started = Instant::now();
        let deadline = wait_timeout.map(|t| started + t);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            self.reclaim_scope(&request).await;

            if let Some(slot) = self.store.try_acquire_slot(&request).await? {
                let slot_id = slot.id.to_string();
                log_slot_operation(
                    "acquire",
                    &request.service,
                    request.feature.as_deref(),
                    Some(&slot_id),
                    "active",
                    None,
                );
                debug!(
                    attempts = attempts,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Slot granted"
                );
                return Ok(SlotToken {
                    service: request.service,
                    feature: request.feature,
                    slot_id: Some(slot.id),
                    resource_id: request.resource_id,
                    unlimited: false,
                });
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    let waited = now.duration_since(started);
                    warn!(
                        attempts = attempts,
                        waited_ms = waited.as_millis() as u64,
                        max_slots = limit.max_slots,
                        "⏳ Slot admission timed out"
                    );
                    return Err(PipelineError::AdmissionTimeout {
                        service: request.service,
                        feature: request.feature,
                        waited,
                    });
                }
                Some(deadline) => limit.wait_interval.min(deadline - now),
                None => limit.wait_interval,
            };

            debug!(
                attempts = attempts,
                pause_ms = pause.as_millis() as u64,
                "Slot scope full, waiting"
            );
            sleep(pause).await;
        }
    }

    /// Release a slot with a final status. Releasing an unlimited token or an already
    /// released slot is a no-op; returns whether this call changed anything.
    #[instrument(skip(self, token, metadata), fields(slot_id = ?token.slot_id, status = %status))]
    pub async fn release(
        &self,
        token: &SlotToken,
        status: SlotStatus,
        metadata: Option<&Value>,
    ) -> PipelineResult<bool> {
        let Some(slot_id) = token.slot_id.filter(|_| token.is_real()) else {
            return Ok(false);
        };

        let status = if status.is_release_status() {
            status
        } else {
            SlotStatus::Released
        };

        match self.store.release_slot(slot_id, status, metadata).await? {
            Some(slot) => {
                log_slot_operation(
                    "release",
                    &slot.service,
                    slot.feature.as_deref(),
                    Some(&slot_id.to_string()),
                    &status.to_string(),
                    None,
                );
                Ok(true)
            }
            None => {
                debug!("Slot already released, ignoring");
                Ok(false)
            }
        }
    }

    /// Merge observability metadata (e.g. a remote job id) into an active slot
    pub async fn update_metadata(&self, token: &SlotToken, partial: &Value) -> PipelineResult<bool> {
        match token.slot_id.filter(|_| token.is_real()) {
            Some(slot_id) if !is_empty_object(partial) => {
                self.store.merge_slot_metadata(slot_id, partial).await
            }
            _ => Ok(false),
        }
    }

    /// Mark up to `batch_size` expired active slots as expired across every scope
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, batch_size: i64) -> PipelineResult<u64> {
        let purged = self.store.expire_slots(None, batch_size.max(1)).await?;
        if purged > 0 {
            info!(purged = purged, "🧹 Expired slots reclaimed");
        }
        Ok(purged)
    }

    /// Run `work` inside a lease: released as `Released` on success and `Error` on failure
    ///
    /// ```rust
    /// # use scenepipe_core::config::SlotBrokerConfig;
    /// # use scenepipe_core::database::MemoryStore;
    /// # use scenepipe_core::slot_broker::{AcquireOptions, SlotBroker};
    /// # use std::sync::Arc;
    /// # tokio_test::block_on(async {
    /// let broker = SlotBroker::new(Arc::new(MemoryStore::new()), SlotBrokerConfig::default());
    /// let clip = broker
    ///     .reserve("runninghub", Some("video"), Some("scene-1"), AcquireOptions::default(), |_token| async {
    ///         Ok("mem://clip-1")
    ///     })
    ///     .await?;
    /// assert_eq!(clip, "mem://clip-1");
    /// # Ok::<(), scenepipe_core::PipelineError>(())
    /// # }).unwrap();
    /// ```
    pub async fn reserve<F, Fut, T>(
        &self,
        service: &str,
        feature: Option<&str>,
        resource_id: Option<&str>,
        options: AcquireOptions,
        work: F,
    ) -> PipelineResult<T>
    where
        F: FnOnce(SlotToken) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let token = self.acquire(service, feature, resource_id, options).await?;
        match work(token.clone()).await {
            Ok(value) => {
                self.release(&token, SlotStatus::Released, None).await?;
                Ok(value)
            }
            Err(err) => {
                let meta = serde_json::json!({ "error": err.to_string() });
                if let Err(release_err) =
                    self.release(&token, SlotStatus::Error, Some(&meta)).await
                {
                    warn!(error = %release_err, "Failed to release slot after work error");
                }
                Err(err)
            }
        }
    }

    /// Swap in new static defaults; cached resolutions are dropped
    pub fn apply_config(&self, config: SlotBrokerConfig) {
        self.limits.apply_config(config);
    }

    /// Forget cached limits so the next acquire re-reads the store
    pub fn invalidate_limits(&self) {
        self.limits.invalidate();
    }

    pub fn limits(&self) -> &LimitResolver {
        &self.limits
    }

    /// Opportunistic, scope-local expiry. Failures here never block admission.
    async fn reclaim_scope(&self, request: &SlotRequest) {
        let scope = (request.service.as_str(), request.feature.as_deref());
        match self
            .store
            .expire_slots(Some(scope), slot_defaults::OPPORTUNISTIC_PURGE_BATCH)
            .await
        {
            Ok(0) => {}
            Ok(reclaimed) => debug!(reclaimed = reclaimed, "Reclaimed expired slots in scope"),
            Err(e) => warn!(error = %e, "Opportunistic slot reclaim failed"),
        }
    }
}

fn is_empty_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Null => true,
        _ => false,
    }
}
