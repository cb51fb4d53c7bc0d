//! # Task Model
//!
//! One full pipeline run.
//!
//! ## Overview
//!
//! A task is created by the API layer through the orchestrator and is afterwards only
//! mutated by the orchestrator and step executor. Tasks are soft-deleted and never
//! physically removed.
//!
//! ## Database Schema
//!
//! Maps to the `pipeline_tasks` table:
//! - `id`: Primary key (UUID)
//! - `status`, `mode`: lowercase text enums
//! - `total_units`, `completed_units`: scene counters
//! - `provider_map`: JSONB feature -> provider name
//! - `config`: opaque JSONB passed through to providers

use super::feature::ProviderSelection;
use super::work_item::SceneContent;
use crate::state_machine::{TaskMode, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub status: TaskStatus,
    pub mode: TaskMode,
    pub total_units: i32,
    pub completed_units: i32,
    pub provider_map: ProviderSelection,
    pub config: serde_json::Value,
    pub error_msg: Option<String>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation request accepted by the orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub provider_map: ProviderSelection,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Externally imported scenes; skips the storyboard stage when present
    #[serde(default)]
    pub scenes: Option<Vec<SceneContent>>,
}

impl Task {
    pub fn new(request: &NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            mode: request.mode,
            total_units: 0,
            completed_units: 0,
            provider_map: request.provider_map.clone(),
            config: request.config.clone(),
            error_msg: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_auto(&self) -> bool {
        self.mode == TaskMode::Auto
    }

    /// Completion percentage derived from the unit counters
    pub fn progress(&self) -> i32 {
        if self.total_units <= 0 {
            return 0;
        }
        (self.completed_units.min(self.total_units) * 100) / self.total_units
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_starts_pending() {
        let task = Task::new(&NewTask {
            mode: TaskMode::Manual,
            ..Default::default()
        });
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.is_auto());
        assert_eq!(task.progress(), 0);
    }

    #[test]
    fn test_progress_is_capped() {
        let mut task = Task::new(&NewTask::default());
        task.total_units = 4;
        task.completed_units = 3;
        assert_eq!(task.progress(), 75);
        task.completed_units = 9;
        assert_eq!(task.progress(), 100);
    }
}
