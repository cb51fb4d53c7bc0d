#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Scenepipe Core
//!
//! Orchestration core for multi-stage content generation pipelines.
//!
//! ## Overview
//!
//! A task turns a script into a finished video through an ordered list of stages:
//! storyboard, per-scene image, audio and video generation, per-scene merging, and
//! task-level assembly. Each stage is a step; per-scene stages fan out over the task's
//! work items, one per scene. External generation services are reached through
//! pluggable providers, and calls to rate-limited services go through a database-backed
//! slot broker so that every process shares one concurrency limit.
//!
//! ## Module Organization
//!
//! - [`models`] - Tasks, steps, work items, slots and feature/provider selection
//! - [`state_machine`] - Status enums, transition tables and step aggregation
//! - [`database`] - Persistence traits with PostgreSQL and in-memory stores
//! - [`slot_broker`] - Cross-process admission control for external services
//! - [`providers`] - Provider trait, registry and job polling
//! - [`orchestration`] - Step executor, interrupts, orchestrator and worker
//! - [`messaging`] - Pipeline messages and the dispatch transport seam
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured `tracing` setup and field helpers
//! - [`error`] - Error types
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scenepipe_core::config::PipelineConfig;
//! use scenepipe_core::database::MemoryStore;
//! use scenepipe_core::messaging::LocalDispatchTransport;
//! use scenepipe_core::models::NewTask;
//! use scenepipe_core::orchestration::{PipelineOrchestrator, PipelineWorker};
//! use scenepipe_core::providers::ProviderRegistry;
//! use scenepipe_core::slot_broker::SlotBroker;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let store = Arc::new(MemoryStore::new());
//! let broker = Arc::new(SlotBroker::new(store.clone(), config.slot_broker.clone()));
//! let registry = Arc::new(ProviderRegistry::from_config(&config.providers));
//! let (transport, queue) = LocalDispatchTransport::channel(config.worker.queue_capacity);
//! let transport = Arc::new(transport);
//!
//! let orchestrator = Arc::new(PipelineOrchestrator::new(
//!     store, broker, registry, transport.clone(), &config,
//! )?);
//! let task = orchestrator.create_task(NewTask::default()).await?;
//!
//! let mut worker = PipelineWorker::new(orchestrator.clone(), transport, queue, config.worker);
//! worker.drain().await;
//! println!("task {} is {}", task.id, orchestrator.task_overview(task.id).await?.task.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Unit and integration tests run against [`database::MemoryStore`]. PostgreSQL tests
//! use `#[sqlx::test]` and are enabled with the `pg-integration` feature.

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod providers;
pub mod slot_broker;
pub mod state_machine;

pub use config::{ConfigManager, PipelineConfig};
pub use error::{PipelineError, PipelineResult, ProviderError};
pub use orchestration::{PipelineOrchestrator, PipelineWorker, StepExecutor};
pub use slot_broker::SlotBroker;
