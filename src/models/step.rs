//! # Step Model
//!
//! One named stage of a task's pipeline. Steps are created lazily and idempotently
//! from the configured stage list; only the step executor and the explicit
//! retry/reset/interrupt operations change their status.

use crate::state_machine::StepStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub task_id: Uuid,
    pub seq: i32,
    pub name: String,
    pub status: StepStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub provider: Option<String>,
    /// Diagnostic only
    pub external_job_id: Option<String>,
    pub progress: i32,
    pub result: Option<serde_json::Value>,
    pub error_msg: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Blueprint used by `ensure_steps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTemplate {
    pub seq: i32,
    pub name: String,
    pub max_retries: i32,
}

impl Step {
    pub fn new(task_id: Uuid, template: &StepTemplate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            seq: template.seq,
            name: template.name.clone(),
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: template.max_retries,
            provider: None,
            external_job_id: None,
            progress: 0,
            result: None,
            error_msg: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Clear execution output so the step can run again from scratch
    pub fn clear_execution(&mut self) {
        self.status = StepStatus::Pending;
        self.progress = 0;
        self.error_msg = None;
        self.external_job_id = None;
        self.result = None;
        self.started_at = None;
        self.finished_at = None;
    }
}
