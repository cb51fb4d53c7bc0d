//! # Step Executor
//!
//! Runs one step of a task: resolves its provider, walks the work items in `seq` order,
//! and folds the item outcomes into the step status.
//!
//! ## Per-item flow
//!
//! 1. Every Interrupted item of the feature is reset to Pending (resume), even on a run
//!    scoped to one item.
//! 2. For each item in scope: re-read it. A Running item without a remote job that
//!    started longer ago than the stale window is treated as abandoned and reset;
//!    younger ones are left to whoever owns them. Then check for an interrupt, check
//!    upstream preconditions, and claim the item as Running.
//! 3. Call the provider, inside a slot lease when the provider is rate limited.
//!    Running items with a remote job id are polled instead of re-created.
//! 4. Check for an interrupt again. If one arrived, the item becomes Interrupted and
//!    the loop stops.
//! 5. Apply the outcome: Completed succeeds the item, Queued keeps it Running with the
//!    job id, Failed (or a provider error, or a slot timeout) fails it and bumps its
//!    retry count.
//!
//! One item's failure never stops its siblings. The step status is then derived from
//! every item of the task for the step's feature, so a scoped single-item run and a
//! full run settle the step the same way.
//!
//! ## Re-entrancy
//!
//! Executing a step is safe to repeat, including while another run of the same step is
//! still going. Starting the step is a conditional write, and a second delivery of a
//! Running step joins it. Each item is re-read before dispatch and claimed with a
//! conditional Pending to Running write, so exactly one run calls the provider for it.
//! Outcomes are only written while the item is still Running. The step's `updated_at`
//! is refreshed after every item, which keeps the recovery sweep away from steps that
//! are making progress.

use super::interrupt::{annotate, InterruptController};
use super::requests::{
    item_request, parse_scenes, storyboard_request, task_level_request, video_prompt_request,
    Precondition,
};
use super::stages::{StageDefinition, StageKind, StagePlan};
use super::task_finalizer::TaskFinalizer;
use crate::config::ExecutionConfig;
use crate::constants::execution::INTERRUPTED_MARKER;
use crate::database::TaskStore;
use crate::error::{PipelineError, PipelineResult, ProviderError};
use crate::logging::{log_error, log_item_operation, log_step_operation};
use crate::models::{Feature, ItemFeature, Step, SubState, Task, WorkItem};
use crate::providers::{Provider, ProviderOutcome, ProviderRegistry, ProviderRequest, ProviderSnapshot};
use crate::slot_broker::{AcquireOptions, SlotBroker};
use crate::state_machine::{
    aggregate_step_status, determine_item_target, determine_step_target, ItemEvent,
    ItemResolution, ItemStatus, SlotStatus, StepCounts, StepEvent, StepStatus, TaskStatus,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// What happened when a step was executed
#[derive(Debug, Clone, PartialEq)]
pub struct StepExecutionResult {
    pub step: Step,
    pub task_status: TaskStatus,
    /// False when the step was not in a runnable state and nothing was done
    pub executed: bool,
}

/// One provider interaction, with errors already folded in
enum CallResult {
    Outcome(ProviderOutcome),
    Errored(String),
    AdmissionTimeout(String),
}

impl CallResult {
    fn label(&self) -> &'static str {
        match self {
            Self::Outcome(outcome) => outcome.status_label(),
            Self::Errored(_) => "error",
            Self::AdmissionTimeout(_) => "admission_timeout",
        }
    }
}

/// Step error text used while an operator interrupt is in effect
pub(crate) fn operator_interrupt_message() -> String {
    format!("Interrupted by operator {INTERRUPTED_MARKER}")
}

pub struct StepExecutor {
    store: Arc<dyn TaskStore>,
    broker: Arc<SlotBroker>,
    registry: Arc<ProviderRegistry>,
    interrupts: Arc<InterruptController>,
    finalizer: TaskFinalizer,
    plan: Arc<StagePlan>,
    config: ExecutionConfig,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<SlotBroker>,
        registry: Arc<ProviderRegistry>,
        interrupts: Arc<InterruptController>,
        plan: Arc<StagePlan>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            finalizer: TaskFinalizer::new(store.clone(), plan.clone()),
            store,
            broker,
            registry,
            interrupts,
            plan,
            config,
        }
    }

    pub fn finalizer(&self) -> &TaskFinalizer {
        &self.finalizer
    }

    /// Execute `stage` for a task. With `item_id`, only that work item is processed.
    #[instrument(skip(self), fields(task_id = %task_id, stage = %stage, item_id = ?item_id))]
    pub async fn execute(
        &self,
        task_id: Uuid,
        stage: &str,
        item_id: Option<Uuid>,
    ) -> PipelineResult<StepExecutionResult> {
        let definition = self.plan.stage(stage)?;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("task", task_id))?;
        let steps = self
            .store
            .ensure_steps(task_id, &self.plan.templates())
            .await?;
        let mut step = steps
            .iter()
            .find(|s| s.name == definition.name)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("step", format!("{task_id}/{stage}")))?;

        if item_id.is_none() {
            if let Some(previous) = self.plan.previous(definition.name) {
                if let Some(prev) = steps.iter().find(|s| s.name == previous.name) {
                    if !prev.status.satisfies_successor() {
                        return Err(PipelineError::InvalidStepState {
                            step_id: prev.id,
                            current: prev.status.to_string(),
                            expected: StepStatus::Succeeded.to_string(),
                        });
                    }
                }
            }
        }

        let previous_status = step.status;
        let Ok(target) = determine_step_target(previous_status, StepEvent::Start) else {
            debug!(status = %previous_status, "Step is not runnable, skipping");
            return Ok(StepExecutionResult {
                step,
                task_status: task.status,
                executed: false,
            });
        };

        step.status = target;
        if previous_status != StepStatus::Running || step.started_at.is_none() {
            step.started_at = Some(Utc::now());
        }
        step.finished_at = None;
        step.error_msg = None;
        if !self.store.update_step_if(&step, previous_status).await? {
            let current = self
                .store
                .get_step(step.id)
                .await?
                .ok_or_else(|| PipelineError::not_found("step", step.id))?;
            debug!(status = %current.status, "Step changed underneath us, skipping");
            return Ok(StepExecutionResult {
                step: current,
                task_status: task.status,
                executed: false,
            });
        }

        log_step_operation(
            "start",
            Some(&task_id.to_string()),
            Some(&step.id.to_string()),
            Some(&step.name),
            "running",
            item_id.map(|id| format!("scoped to item {id}")).as_deref(),
        );
        if task.status != TaskStatus::Running {
            self.store
                .set_task_status(task_id, TaskStatus::Running, None)
                .await?;
        }

        let snapshot = self.registry.snapshot(&task.provider_map);
        match snapshot.provider(definition.feature) {
            Ok(provider) => {
                step.provider = Some(provider.name().to_string());
                match definition.kind {
                    StageKind::Storyboard => {
                        self.run_storyboard(&task, &mut step, &provider).await?
                    }
                    StageKind::PerItem(feature) => {
                        self.run_items(&task, &mut step, &provider, &snapshot, feature, item_id)
                            .await?
                    }
                    StageKind::TaskLevel => {
                        self.run_task_level(&task, &mut step, &provider, definition)
                            .await?
                    }
                }
            }
            Err(e) => {
                log_error("step_executor", "resolve_provider", &e.to_string(), Some(stage));
                step.status = StepStatus::Failed;
                step.error_msg = Some(e.to_string());
            }
        }

        self.settle(&mut step).await?;
        let finalization = self.finalizer.reconcile(task_id).await?;

        info!(
            step_name = %step.name,
            status = %step.status,
            progress = step.progress,
            task_status = %finalization.status,
            "✅ Step execution finished"
        );

        Ok(StepExecutionResult {
            step,
            task_status: finalization.status,
            executed: true,
        })
    }

    /// Persist the step's final fields. An interrupt that landed after the last safe
    /// point wins over the computed status.
    async fn settle(&self, step: &mut Step) -> PipelineResult<()> {
        let expected = if step.status == StepStatus::Interrupted {
            StepStatus::Interrupted
        } else {
            StepStatus::Running
        };
        if step.status.is_terminal() && step.status != StepStatus::Interrupted {
            step.finished_at = Some(Utc::now());
        } else {
            step.finished_at = None;
        }

        let mut applied = self.store.update_step_if(step, expected).await?;
        if !applied {
            let current = self
                .store
                .get_step(step.id)
                .await?
                .ok_or_else(|| PipelineError::not_found("step", step.id))?;
            if current.status == StepStatus::Interrupted {
                step.status = StepStatus::Interrupted;
                step.finished_at = None;
                step.error_msg = current.error_msg.clone();
                applied = self
                    .store
                    .update_step_if(step, StepStatus::Interrupted)
                    .await?;
            }
            if !applied {
                warn!(
                    step_id = %step.id,
                    status = %current.status,
                    "Step was changed by another actor, keeping stored state"
                );
                *step = current;
                return Ok(());
            }
        }

        log_step_operation(
            "settle",
            Some(&step.task_id.to_string()),
            Some(&step.id.to_string()),
            Some(&step.name),
            &step.status.to_string(),
            step.error_msg.as_deref(),
        );
        Ok(())
    }

    async fn run_items(
        &self,
        task: &Task,
        step: &mut Step,
        provider: &Arc<dyn Provider>,
        snapshot: &ProviderSnapshot,
        feature: ItemFeature,
        scope: Option<Uuid>,
    ) -> PipelineResult<()> {
        let items = self.store.list_work_items(task.id).await?;
        if let Some(id) = scope {
            if !items.iter().any(|item| item.id == id) {
                return Err(PipelineError::not_found("work item", id));
            }
        }

        // Resume runs for the whole step, whatever the scope
        for item in &items {
            let state = item.state(feature);
            if state.status == ItemStatus::Interrupted {
                self.reopen_item(task, item, feature, state, "resume").await?;
            }
        }

        let mut interrupted = false;
        for listed in items
            .into_iter()
            .filter(|item| scope.map_or(true, |id| item.id == id))
        {
            // Another delivery of this step may have moved the item since the listing
            let Some(item) = self.store.get_work_item(listed.id).await? else {
                continue;
            };
            let mut state = item.state(feature);
            if state.status == ItemStatus::Running
                && state.external_job_id.is_none()
                && self.is_stale(&state)
            {
                match self.reopen_item(task, &item, feature, state, "stale_reset").await? {
                    Some(reopened) => state = reopened,
                    None => continue,
                }
            }

            let poll_job = match state.status {
                ItemStatus::Pending => None,
                ItemStatus::Running => match state.external_job_id.clone() {
                    Some(job_id) => Some(job_id),
                    None => {
                        debug!(item_seq = item.seq, "Item is running elsewhere, skipping");
                        continue;
                    }
                },
                ItemStatus::Succeeded | ItemStatus::Failed | ItemStatus::Interrupted => continue,
            };

            if self.interrupts.should_abort(step.id).await? {
                interrupted = true;
                break;
            }

            let request = match &poll_job {
                Some(_) => None,
                None => {
                    let enriched = if feature == ItemFeature::Video
                        && item.resource(ItemFeature::Image).is_some()
                    {
                        self.enrich_video_prompt(snapshot, &item, &mut state).await
                    } else {
                        None
                    };
                    match item_request(task, &item, feature, enriched.as_deref()) {
                        Ok(request) => Some(request),
                        Err(Precondition(reason)) => {
                            state.status = ItemStatus::Failed;
                            state.error = Some(reason.clone());
                            state.updated_at = Some(Utc::now());
                            if self
                                .store
                                .update_item_state_if(item.id, feature, &state, ItemStatus::Pending)
                                .await?
                            {
                                self.log_item(task, &item, feature, "precondition", &state, Some(&reason));
                            }
                            continue;
                        }
                    }
                }
            };

            let expected = state.status;
            if poll_job.is_none() {
                state.status = determine_item_target(state.status, ItemEvent::Dispatch)?;
                state.started_at = Some(Utc::now());
                state.updated_at = state.started_at;
                state.error = None;
                if !self
                    .store
                    .update_item_state_if(item.id, feature, &state, expected)
                    .await?
                {
                    debug!(item_seq = item.seq, "Item was claimed by another run, skipping");
                    continue;
                }
                self.log_item(task, &item, feature, "dispatch", &state, None);
            }

            let resource_id = item.resource_key(feature);
            let call = self
                .call_provider(
                    provider,
                    feature.provider_feature(),
                    &resource_id,
                    request.as_ref(),
                    poll_job.as_deref(),
                )
                .await?;

            if self.interrupts.should_abort(step.id).await? {
                state.status = determine_item_target(state.status, ItemEvent::Interrupt)?;
                state.error = Some(annotate(state.error.as_deref()));
                state
                    .metadata
                    .insert("interrupted_outcome".into(), json!(call.label()));
                state.updated_at = Some(Utc::now());
                // The interrupt controller may have marked the item already
                let written = self
                    .store
                    .update_item_state_if(item.id, feature, &state, ItemStatus::Running)
                    .await?
                    || self
                        .store
                        .update_item_state_if(item.id, feature, &state, ItemStatus::Interrupted)
                        .await?;
                if written {
                    self.log_item(task, &item, feature, "interrupt", &state, None);
                }
                interrupted = true;
                break;
            }

            apply_call_result(&mut state, call)?;
            if self
                .store
                .update_item_state_if(item.id, feature, &state, ItemStatus::Running)
                .await?
            {
                self.log_item(task, &item, feature, "resolve", &state, state.error.as_deref());
            } else {
                debug!(item_seq = item.seq, "Item settled elsewhere, dropping outcome");
            }
            self.store.touch_step(step.id, StepStatus::Running).await?;
        }

        let items = self.store.list_work_items(task.id).await?;
        let counts = StepCounts::from_statuses(items.iter().map(|item| item.status(feature)));
        step.progress = counts.progress();
        step.result = Some(json!({
            "provider": provider.name(),
            "succeeded": counts.succeeded,
            "failed": counts.failed,
            "running": counts.running,
            "pending": counts.pending,
            "interrupted": counts.interrupted,
            "total": counts.total,
        }));

        if interrupted {
            step.status = StepStatus::Interrupted;
            step.error_msg = Some(operator_interrupt_message());
            return Ok(());
        }

        step.status = aggregate_step_status(&counts);
        step.error_msg = match step.status {
            StepStatus::Failed => Some(
                items
                    .iter()
                    .find_map(|item| item.states.get(&feature).and_then(|s| s.error.clone()))
                    .map(|first| format!("all {} items failed; first error: {first}", counts.total))
                    .unwrap_or_else(|| format!("all {} items failed", counts.total)),
            ),
            StepStatus::PartialSuccess => Some(format!(
                "{} of {} items failed",
                counts.failed, counts.total
            )),
            _ => None,
        };
        Ok(())
    }

    /// Put an interrupted or abandoned item back to Pending. Returns the new state, or
    /// `None` when another run changed the item first.
    async fn reopen_item(
        &self,
        task: &Task,
        item: &WorkItem,
        feature: ItemFeature,
        mut state: SubState,
        reason: &str,
    ) -> PipelineResult<Option<SubState>> {
        let expected = state.status;
        state.status = determine_item_target(expected, ItemEvent::Resume)?;
        state.reset();
        if !self
            .store
            .update_item_state_if(item.id, feature, &state, expected)
            .await?
        {
            return Ok(None);
        }
        self.log_item(task, item, feature, reason, &state, None);
        Ok(Some(state))
    }

    fn is_stale(&self, state: &SubState) -> bool {
        let window = chrono::Duration::from_std(self.config.stale_running_after())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        match state.started_at.or(state.updated_at) {
            Some(started) => Utc::now() - started > window,
            None => true,
        }
    }

    /// Ask the video prompt provider for a motion prompt; `None` falls back to the
    /// scene's own prompts
    async fn enrich_video_prompt(
        &self,
        snapshot: &ProviderSnapshot,
        item: &WorkItem,
        state: &mut SubState,
    ) -> Option<String> {
        if item.content.video_prompt.is_some() {
            return None;
        }
        if let Some(existing) = state.metadata.get("video_prompt").and_then(Value::as_str) {
            return Some(existing.to_string());
        }
        let provider = snapshot.try_provider(Feature::VideoPrompt)?;

        let prompt = match provider.generate(&video_prompt_request(item)).await {
            Ok(ProviderOutcome::Completed { resource_ref, meta }) => meta
                .get("prompt")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(resource_ref),
            Ok(other) => {
                warn!(
                    item_seq = item.seq,
                    outcome = other.status_label(),
                    "Video prompt enrichment did not complete"
                );
                String::new()
            }
            Err(e) => {
                warn!(item_seq = item.seq, error = %e, "Video prompt enrichment failed");
                String::new()
            }
        };

        if prompt.trim().is_empty() {
            state
                .metadata
                .insert("video_prompt_source".into(), json!("image_prompt"));
            return None;
        }
        state
            .metadata
            .insert("video_prompt".into(), json!(prompt.clone()));
        state
            .metadata
            .insert("video_prompt_source".into(), json!(provider.name()));
        Some(prompt)
    }

    async fn run_storyboard(
        &self,
        task: &Task,
        step: &mut Step,
        provider: &Arc<dyn Provider>,
    ) -> PipelineResult<()> {
        let existing = self.store.list_work_items(task.id).await?;
        if !existing.is_empty() {
            if task.total_units == 0 {
                self.store
                    .set_task_units(task.id, existing.len() as i32, 0)
                    .await?;
            }
            step.status = StepStatus::Succeeded;
            step.progress = 100;
            step.result = Some(json!({
                "provider": provider.name(),
                "scenes": existing.len(),
                "imported": true,
            }));
            return Ok(());
        }

        let request = if step.external_job_id.is_some() {
            Ok(None)
        } else {
            storyboard_request(task).map(Some)
        };
        let resource_id = format!("task:{}:storyboard", task.id);
        let Some((_, meta)) = self
            .run_single_call(step, provider, Feature::Storyboard, &resource_id, request)
            .await?
        else {
            return Ok(());
        };

        match parse_scenes(&meta) {
            Ok(scenes) => {
                let items = self.store.insert_work_items(task.id, &scenes).await?;
                self.store
                    .set_task_units(task.id, items.len() as i32, 0)
                    .await?;
                step.status = StepStatus::Succeeded;
                step.progress = 100;
                step.result = Some(json!({
                    "provider": provider.name(),
                    "scenes": items.len(),
                }));
            }
            Err(reason) => {
                step.status = StepStatus::Failed;
                step.error_msg = Some(reason);
            }
        }
        Ok(())
    }

    async fn run_task_level(
        &self,
        task: &Task,
        step: &mut Step,
        provider: &Arc<dyn Provider>,
        definition: StageDefinition,
    ) -> PipelineResult<()> {
        let request = if step.external_job_id.is_some() {
            Ok(None)
        } else {
            let items = self.store.list_work_items(task.id).await?;
            let previous_resource = match self.plan.previous(definition.name) {
                Some(previous) => self
                    .store
                    .list_steps(task.id)
                    .await?
                    .into_iter()
                    .find(|s| s.name == previous.name)
                    .and_then(|s| s.result)
                    .and_then(|r| r.get("resource_ref").and_then(Value::as_str).map(str::to_string)),
                None => None,
            };
            task_level_request(task, definition.name, &items, previous_resource.as_deref())
                .map(Some)
        };

        let resource_id = format!("task:{}:{}", task.id, definition.name);
        if let Some((resource_ref, _)) = self
            .run_single_call(step, provider, definition.feature, &resource_id, request)
            .await?
        {
            step.status = StepStatus::Succeeded;
            step.progress = 100;
            step.result = Some(json!({
                "provider": provider.name(),
                "resource_ref": resource_ref,
            }));
        }
        Ok(())
    }

    /// One provider call for a whole step. Returns the completed resource and meta;
    /// every other outcome is written onto `step` and yields `None`.
    async fn run_single_call(
        &self,
        step: &mut Step,
        provider: &Arc<dyn Provider>,
        feature: Feature,
        resource_id: &str,
        request: Result<Option<ProviderRequest>, Precondition>,
    ) -> PipelineResult<Option<(String, serde_json::Map<String, Value>)>> {
        let request = match request {
            Ok(request) => request,
            Err(Precondition(reason)) => {
                step.status = StepStatus::Failed;
                step.error_msg = Some(reason);
                return Ok(None);
            }
        };

        if self.interrupts.should_abort(step.id).await? {
            step.status = StepStatus::Interrupted;
            step.error_msg = Some(operator_interrupt_message());
            return Ok(None);
        }

        let poll_job = step.external_job_id.clone();
        let call = self
            .call_provider(provider, feature, resource_id, request.as_ref(), poll_job.as_deref())
            .await?;

        if self.interrupts.should_abort(step.id).await? {
            step.status = StepStatus::Interrupted;
            step.error_msg = Some(operator_interrupt_message());
            return Ok(None);
        }

        match call {
            CallResult::Outcome(ProviderOutcome::Completed { resource_ref, meta }) => {
                step.external_job_id = None;
                Ok(Some((resource_ref, meta)))
            }
            CallResult::Outcome(ProviderOutcome::Queued { job_id, .. }) => {
                step.status = StepStatus::Running;
                step.result = Some(json!({
                    "provider": provider.name(),
                    "job_id": job_id,
                }));
                step.external_job_id = Some(job_id);
                Ok(None)
            }
            CallResult::Outcome(ProviderOutcome::Failed { error, .. })
            | CallResult::Errored(error)
            | CallResult::AdmissionTimeout(error) => {
                step.external_job_id = None;
                step.status = StepStatus::Failed;
                step.error_msg = Some(error);
                Ok(None)
            }
        }
    }

    /// Invoke the provider, inside a slot lease when it is rate limited, retrying
    /// creation when the remote side reports admission limiting
    async fn call_provider(
        &self,
        provider: &Arc<dyn Provider>,
        feature: Feature,
        resource_id: &str,
        request: Option<&ProviderRequest>,
        poll_job: Option<&str>,
    ) -> PipelineResult<CallResult> {
        let attempts = self.config.admission_retry_attempts.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let token = match provider.rate_limit_service() {
                Some(service) => {
                    let options = AcquireOptions::default().metadata(json!({
                        "provider": provider.name(),
                        "resource_id": resource_id,
                        "attempt": attempt,
                    }));
                    match self
                        .broker
                        .acquire(service, Some(feature.as_str()), Some(resource_id), options)
                        .await
                    {
                        Ok(token) => Some(token),
                        Err(e @ PipelineError::AdmissionTimeout { .. }) => {
                            warn!(resource_id = %resource_id, error = %e, "Slot admission timed out");
                            return Ok(CallResult::AdmissionTimeout(e.to_string()));
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => None,
            };

            let result = match (poll_job, request) {
                (Some(job_id), _) => provider.poll(job_id).await,
                (None, Some(request)) => provider.generate(request).await,
                (None, None) => Err(ProviderError::InvalidResponse(
                    "nothing to submit or poll".into(),
                )),
            };

            if let Some(token) = &token {
                let (status, meta) = match &result {
                    Ok(ProviderOutcome::Completed { .. }) => {
                        (SlotStatus::Released, json!({"status": "completed"}))
                    }
                    Ok(ProviderOutcome::Queued { job_id, .. }) => {
                        if let Err(e) = self
                            .broker
                            .update_metadata(token, &json!({"job_id": job_id}))
                            .await
                        {
                            debug!(error = %e, "Could not attach job id to slot");
                        }
                        (SlotStatus::Released, json!({"status": "queued", "job_id": job_id}))
                    }
                    Ok(ProviderOutcome::Failed { error, .. }) => {
                        (SlotStatus::Error, json!({"status": "failed", "error": error}))
                    }
                    Err(e) => (SlotStatus::Error, json!({"status": "error", "error": e.to_string()})),
                };
                if let Err(e) = self.broker.release(token, status, Some(&meta)).await {
                    // The slot TTL reclaims it
                    warn!(resource_id = %resource_id, error = %e, "Slot release failed");
                }
            }

            match result {
                Ok(outcome) => return Ok(CallResult::Outcome(outcome)),
                Err(e) if e.is_admission_limited() && attempt < attempts => {
                    warn!(
                        resource_id = %resource_id,
                        attempt = attempt,
                        error = %e,
                        "Remote admission limited, retrying creation"
                    );
                    sleep(self.config.admission_retry_delay()).await;
                }
                Err(e) => return Ok(CallResult::Errored(e.to_string())),
            }
        }
    }

    fn log_item(
        &self,
        task: &Task,
        item: &WorkItem,
        feature: ItemFeature,
        operation: &str,
        state: &SubState,
        details: Option<&str>,
    ) {
        log_item_operation(
            operation,
            Some(&task.id.to_string()),
            Some(item.seq),
            feature.as_str(),
            &state.status.to_string(),
            details,
        );
    }
}

fn apply_call_result(state: &mut SubState, call: CallResult) -> PipelineResult<()> {
    let now = Some(Utc::now());
    match call {
        CallResult::Outcome(ProviderOutcome::Completed { resource_ref, meta }) => {
            state.status = determine_item_target(
                state.status,
                ItemEvent::Resolve(ItemResolution::Completed),
            )?;
            state.resource_ref = Some(resource_ref);
            state.merge_metadata(&meta);
            state.error = None;
        }
        CallResult::Outcome(ProviderOutcome::Queued { job_id, meta }) => {
            state.status =
                determine_item_target(state.status, ItemEvent::Resolve(ItemResolution::Queued))?;
            state.external_job_id = Some(job_id);
            state.merge_metadata(&meta);
        }
        CallResult::Outcome(ProviderOutcome::Failed { error, meta }) => {
            state.status =
                determine_item_target(state.status, ItemEvent::Resolve(ItemResolution::Failed))?;
            state.merge_metadata(&meta);
            state.error = Some(error);
            state.retry_count += 1;
        }
        CallResult::Errored(error) | CallResult::AdmissionTimeout(error) => {
            state.status =
                determine_item_target(state.status, ItemEvent::Resolve(ItemResolution::Failed))?;
            state.error = Some(error);
            state.retry_count += 1;
        }
    }
    state.updated_at = now;
    Ok(())
}
