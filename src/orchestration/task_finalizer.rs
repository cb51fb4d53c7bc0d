//! # Task Finalizer
//!
//! Reconciles a task's status and unit counters with its steps after every step
//! execution or operator action.
//!
//! ## Overview
//!
//! The task status is derived, never set independently:
//!
//! - any step Failed: the task is Failed and carries that step's error
//! - any step PartialSuccess: PartialSuccess
//! - any step Interrupted: Pending, waiting for an operator
//! - every step Succeeded: Succeeded, with `completed_units = total_units`
//! - some progress made: Running
//! - nothing started: Pending
//!
//! `completed_units` follows the number of scenes whose merge succeeded. It is raised,
//! never lowered, except by an explicit reset of the scene set.

use super::stages::StagePlan;
use crate::database::TaskStore;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ItemFeature, Step};
use crate::state_machine::{ItemStatus, StepStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of task finalization operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizationResult {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub action: FinalizationAction,
    pub completed_units: i32,
    pub total_units: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationAction {
    /// Status changed
    Transitioned,
    /// Already consistent
    NoAction,
}

/// Task status implied by its steps, with the error to surface
pub fn derive_task_status(steps: &[Step]) -> (TaskStatus, Option<String>) {
    if let Some(failed) = steps.iter().find(|s| s.status == StepStatus::Failed) {
        let error = failed
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("step {} failed", failed.name));
        return (TaskStatus::Failed, Some(error));
    }
    if let Some(partial) = steps
        .iter()
        .find(|s| s.status == StepStatus::PartialSuccess)
    {
        return (TaskStatus::PartialSuccess, partial.error_msg.clone());
    }
    if steps.iter().any(|s| s.status == StepStatus::Interrupted) {
        return (TaskStatus::Pending, None);
    }
    if !steps.is_empty() && steps.iter().all(|s| s.status == StepStatus::Succeeded) {
        return (TaskStatus::Succeeded, None);
    }
    if steps
        .iter()
        .any(|s| matches!(s.status, StepStatus::Running | StepStatus::Succeeded))
    {
        return (TaskStatus::Running, None);
    }
    (TaskStatus::Pending, None)
}

pub struct TaskFinalizer {
    store: Arc<dyn TaskStore>,
    plan: Arc<StagePlan>,
}

impl TaskFinalizer {
    pub fn new(store: Arc<dyn TaskStore>, plan: Arc<StagePlan>) -> Self {
        Self { store, plan }
    }

    pub async fn reconcile(&self, task_id: Uuid) -> PipelineResult<FinalizationResult> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("task", task_id))?;

        let merged = self
            .store
            .list_work_items(task_id)
            .await?
            .iter()
            .filter(|item| item.status(ItemFeature::Merge) == ItemStatus::Succeeded)
            .count() as i32;
        self.store.raise_completed_units(task_id, merged).await?;

        let steps: Vec<Step> = self
            .store
            .list_steps(task_id)
            .await?
            .into_iter()
            .filter(|s| self.plan.position(&s.name).is_some())
            .collect();
        let (status, error_msg) = derive_task_status(&steps);

        let mut completed_units = merged.min(task.total_units).max(task.completed_units);
        if status == TaskStatus::Succeeded {
            self.store
                .set_task_units(task_id, task.total_units, task.total_units)
                .await?;
            completed_units = task.total_units;
        }

        let action = if status != task.status || error_msg != task.error_msg {
            self.store
                .set_task_status(task_id, status, error_msg)
                .await?;
            info!(
                task_id = %task_id,
                from = %task.status,
                to = %status,
                "📋 Task status reconciled"
            );
            FinalizationAction::Transitioned
        } else {
            debug!(task_id = %task_id, status = %status, "Task status unchanged");
            FinalizationAction::NoAction
        };

        Ok(FinalizationResult {
            task_id,
            status,
            action,
            completed_units,
            total_units: task.total_units,
        })
    }
}
