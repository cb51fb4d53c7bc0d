//! # Providers
//!
//! Uniform contract for the external generation services behind each feature.
//!
//! Concrete vendor clients live outside this crate. They implement [`Provider`] and are
//! registered with the [`ProviderRegistry`], which resolves a task's provider selection
//! into an immutable [`ProviderSnapshot`] once per step execution.
//!
//! Every call resolves to one of three outcomes:
//!
//! - `Completed` - the resource exists and `resource_ref` points at it
//! - `Queued` - the remote job was accepted but has not finished; the executor keeps the
//!   item Running and re-polls it with [`Provider::poll`] on a later invocation
//! - `Failed` - terminal failure for this attempt
//!
//! An `Err(ProviderError)` is treated as `Failed`, except for
//! [`ProviderError::AdmissionLimited`] which the executor may retry with a fresh
//! creation attempt.

pub mod polling;
pub mod registry;

pub use polling::{JobPoller, PollPolicy, PollStatus};
pub use registry::{ProviderRegistry, ProviderSnapshot};

use crate::error::ProviderError;
use crate::models::Feature;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Input to a provider call. Fields that do not apply to a feature stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub text: Option<String>,
    pub image_ref: Option<String>,
    pub audio_ref: Option<String>,
    pub video_ref: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_seconds: Option<f64>,
    pub voice_id: Option<String>,
    /// Stable correlation id for the unit of work (task + item + feature)
    pub resource_key: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ProviderRequest {
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Completed {
        resource_ref: String,
        #[serde(default)]
        meta: Map<String, Value>,
    },
    Queued {
        job_id: String,
        #[serde(default)]
        meta: Map<String, Value>,
    },
    Failed {
        error: String,
        #[serde(default)]
        meta: Map<String, Value>,
    },
}

impl ProviderOutcome {
    pub fn completed(resource_ref: impl Into<String>) -> Self {
        Self::Completed {
            resource_ref: resource_ref.into(),
            meta: Map::new(),
        }
    }

    pub fn queued(job_id: impl Into<String>) -> Self {
        Self::Queued {
            job_id: job_id.into(),
            meta: Map::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            meta: Map::new(),
        }
    }

    pub fn meta(&self) -> &Map<String, Value> {
        match self {
            Self::Completed { meta, .. } | Self::Queued { meta, .. } | Self::Failed { meta, .. } => {
                meta
            }
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Queued { .. } => "queued",
            Self::Failed { .. } => "failed",
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name, lowercase (e.g. `runninghub`)
    fn name(&self) -> &str;

    fn feature(&self) -> Feature;

    /// Slot broker service key; `None` means calls are not admission-controlled
    fn rate_limit_service(&self) -> Option<&str> {
        None
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderOutcome, ProviderError>;

    /// Check on a previously queued job
    async fn poll(&self, job_id: &str) -> Result<ProviderOutcome, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.name().to_string(),
            operation: format!("poll({job_id})"),
        })
    }

    /// Best-effort remote cancellation. The remote job may keep running.
    async fn cancel(&self, _job_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}
