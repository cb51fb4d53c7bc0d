//! # Orchestration Engine
//!
//! Drives tasks through the configured stage list.
//!
//! ## Core Components
//!
//! - **PipelineOrchestrator**: public operations (create, trigger, retry, reset,
//!   interrupt) and the message handler that advances Auto tasks
//! - **StepExecutor**: runs one step, fanning out over work items
//! - **InterruptController**: cooperative cancellation of running steps
//! - **TaskFinalizer**: derives task status and unit counters from steps
//! - **StagePlan**: the validated, ordered stage list
//! - **PipelineWorker**: consumes dispatched messages with bounded concurrency

pub mod interrupt;
pub mod pipeline;
mod requests;
pub mod stages;
pub mod step_executor;
pub mod task_finalizer;
pub mod worker;

pub use interrupt::{InterruptController, InterruptOutcome};
pub use pipeline::{PipelineOrchestrator, RecoveryReport, TaskOverview};
pub use stages::{StageDefinition, StageKind, StagePlan, KNOWN_STAGES};
pub use step_executor::{StepExecutionResult, StepExecutor};
pub use task_finalizer::{derive_task_status, FinalizationAction, FinalizationResult, TaskFinalizer};
pub use worker::{PipelineWorker, WorkerStatsSnapshot};
