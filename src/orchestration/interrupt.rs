//! # Interrupt Controller
//!
//! Cooperative cancellation for running steps.
//!
//! The interrupt flag is the persisted step status itself: `interrupt` moves a Running
//! step to Interrupted, and `should_abort` reads it back. The executor checks before
//! dispatching each item and again after each provider response, so an interrupt takes
//! effect at the next safe point in whichever process owns the step. Starting the step
//! again moves it out of Interrupted, which is the resume.
//!
//! Remote jobs already accepted by a provider get a best-effort cancel request. The
//! remote side may keep running them.

use super::stages::{StageKind, StagePlan};
use crate::constants::execution::INTERRUPTED_MARKER;
use crate::database::TaskStore;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::{log_item_operation, log_step_operation};
use crate::models::{Step, SubState};
use crate::providers::ProviderRegistry;
use crate::state_machine::{determine_item_target, determine_step_target, ItemEvent, ItemStatus, StepEvent, StepStatus};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// What an interrupt touched
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptOutcome {
    pub step: Step,
    pub interrupted_items: usize,
    pub cancel_requested: Vec<String>,
    /// The step was already interrupted; nothing changed
    pub already_interrupted: bool,
}

pub struct InterruptController {
    store: Arc<dyn TaskStore>,
    registry: Arc<ProviderRegistry>,
    plan: Arc<StagePlan>,
}

impl InterruptController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ProviderRegistry>,
        plan: Arc<StagePlan>,
    ) -> Self {
        Self {
            store,
            registry,
            plan,
        }
    }

    /// Stop a Running step at its next safe point.
    ///
    /// Interrupting an already interrupted step is accepted and changes nothing.
    #[instrument(skip(self))]
    pub async fn interrupt(&self, step_id: Uuid) -> PipelineResult<InterruptOutcome> {
        let mut step = self
            .store
            .get_step(step_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("step", step_id))?;

        if step.status == StepStatus::Interrupted {
            return Ok(InterruptOutcome {
                step,
                interrupted_items: 0,
                cancel_requested: Vec::new(),
                already_interrupted: true,
            });
        }

        let target = determine_step_target(step.status, StepEvent::Interrupt).map_err(|_| {
            PipelineError::InvalidStepState {
                step_id,
                current: step.status.to_string(),
                expected: StepStatus::Running.to_string(),
            }
        })?;

        let previous = step.status;
        step.status = target;
        step.error_msg = Some(format!("Interrupted by operator {INTERRUPTED_MARKER}"));
        step.updated_at = Utc::now();
        if !self.store.update_step_if(&step, previous).await? {
            // Lost a race with the executor settling the step
            let current = self
                .store
                .get_step(step_id)
                .await?
                .ok_or_else(|| PipelineError::not_found("step", step_id))?;
            if current.status == StepStatus::Interrupted {
                return Ok(InterruptOutcome {
                    step: current,
                    interrupted_items: 0,
                    cancel_requested: Vec::new(),
                    already_interrupted: true,
                });
            }
            return Err(PipelineError::InvalidStepState {
                step_id,
                current: current.status.to_string(),
                expected: StepStatus::Running.to_string(),
            });
        }

        log_step_operation(
            "interrupt",
            Some(&step.task_id.to_string()),
            Some(&step_id.to_string()),
            Some(&step.name),
            "interrupted",
            None,
        );

        let mut job_ids = Vec::new();
        let mut interrupted_items = 0;
        let stage = self.plan.stage(&step.name).ok();

        if let Some(StageKind::PerItem(feature)) = stage.map(|s| s.kind) {
            for item in self.store.list_work_items(step.task_id).await? {
                let mut state: SubState = item.state(feature);
                if state.status != ItemStatus::Running {
                    continue;
                }
                state.status = determine_item_target(state.status, ItemEvent::Interrupt)?;
                state.error = Some(annotate(state.error.as_deref()));
                state.updated_at = Some(Utc::now());
                if !self
                    .store
                    .update_item_state_if(item.id, feature, &state, ItemStatus::Running)
                    .await?
                {
                    continue;
                }
                if let Some(job_id) = state.external_job_id.clone() {
                    job_ids.push(job_id);
                }
                interrupted_items += 1;
                log_item_operation(
                    "interrupt",
                    Some(&step.task_id.to_string()),
                    Some(item.seq),
                    feature.as_str(),
                    "interrupted",
                    None,
                );
            }
        } else if let Some(job_id) = step.external_job_id.clone() {
            job_ids.push(job_id);
        }

        let cancel_requested = match stage {
            Some(stage) => self.cancel_remote_jobs(step.task_id, stage.feature, job_ids).await,
            None => Vec::new(),
        };

        info!(
            step_id = %step_id,
            step_name = %step.name,
            interrupted_items = interrupted_items,
            cancel_requested = cancel_requested.len(),
            "⏸️ Step interrupted"
        );

        Ok(InterruptOutcome {
            step,
            interrupted_items,
            cancel_requested,
            already_interrupted: false,
        })
    }

    /// Whether the executor should stop working on `step_id`
    pub async fn should_abort(&self, step_id: Uuid) -> PipelineResult<bool> {
        Ok(match self.store.get_step(step_id).await? {
            Some(step) => step.status == StepStatus::Interrupted,
            None => true,
        })
    }

    async fn cancel_remote_jobs(
        &self,
        task_id: Uuid,
        feature: crate::models::Feature,
        job_ids: Vec<String>,
    ) -> Vec<String> {
        if job_ids.is_empty() {
            return job_ids;
        }
        let provider = match self.store.get_task(task_id).await {
            Ok(Some(task)) => self.registry.snapshot(&task.provider_map).try_provider(feature),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Could not load task for remote cancellation");
                None
            }
        };
        let Some(provider) = provider else {
            debug!(feature = %feature, "No provider resolved, skipping remote cancellation");
            return Vec::new();
        };

        let mut requested = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            match provider.cancel(&job_id).await {
                Ok(()) => requested.push(job_id),
                Err(e) => warn!(
                    job_id = %job_id,
                    provider = %provider.name(),
                    error = %e,
                    "Remote cancellation failed"
                ),
            }
        }
        requested
    }
}

/// Append the interrupt marker to an existing error, once
pub(crate) fn annotate(error: Option<&str>) -> String {
    match error {
        Some(existing) if existing.contains(INTERRUPTED_MARKER) => existing.to_string(),
        Some(existing) if !existing.is_empty() => format!("{existing} {INTERRUPTED_MARKER}"),
        _ => INTERRUPTED_MARKER.to_string(),
    }
}
