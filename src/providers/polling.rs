//! Bounded polling for providers that front asynchronous remote jobs.
//!
//! A provider implementation submits a job, then hands the job id and a status probe to
//! [`JobPoller::wait`]. The poller sleeps between probes with growing intervals and maps
//! the final observation onto a [`ProviderOutcome`]. A job still pending when attempts
//! run out comes back as `Queued`, so the executor keeps the item Running and picks it
//! up again through [`Provider::poll`](super::Provider::poll) later.

use super::ProviderOutcome;
use crate::error::ProviderError;
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// What a single probe of a remote job reported
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    Succeeded {
        resource_ref: String,
        meta: Map<String, Value>,
    },
    /// The remote side dropped the job for capacity reasons
    AdmissionLimited(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::ZERO,
            interval: Duration::from_secs(5),
            multiplier: 1.5,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl PollPolicy {
    /// Sleep before probe `attempt` (zero-based, probe 0 waits `initial_delay`)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 1);
        let scaled = self.interval.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobPoller {
    policy: PollPolicy,
}

impl JobPoller {
    pub fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Probe `job_id` until it settles or attempts run out.
    ///
    /// Probe errors other than admission limiting are returned immediately.
    pub async fn wait<F, Fut>(&self, job_id: &str, mut probe: F) -> Result<ProviderOutcome, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<PollStatus, ProviderError>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut meta = Map::new();
        meta.insert("job_id".into(), Value::String(job_id.to_string()));

        for attempt in 0..attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                sleep(delay).await;
            }

            match probe(attempt).await? {
                PollStatus::Pending => {
                    debug!(job_id = %job_id, attempt = attempt + 1, "Remote job still pending");
                }
                PollStatus::Succeeded {
                    resource_ref,
                    meta: probe_meta,
                } => {
                    meta.extend(probe_meta);
                    meta.insert("poll_attempts".into(), Value::from(attempt + 1));
                    return Ok(ProviderOutcome::Completed { resource_ref, meta });
                }
                PollStatus::AdmissionLimited(reason) => {
                    return Err(ProviderError::AdmissionLimited(reason));
                }
                PollStatus::Failed(error) => {
                    meta.insert("poll_attempts".into(), Value::from(attempt + 1));
                    return Ok(ProviderOutcome::Failed { error, meta });
                }
            }
        }

        meta.insert("poll_attempts".into(), Value::from(attempts));
        Ok(ProviderOutcome::Queued {
            job_id: job_id.to_string(),
            meta,
        })
    }
}
