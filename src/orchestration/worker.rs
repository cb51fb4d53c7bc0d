//! Pipeline worker: consumes dispatched messages and hands them to the orchestrator.
//!
//! Messages run concurrently up to `worker.concurrency`. A message that fails with a
//! retryable error is redelivered with exponential backoff until
//! `worker.max_delivery_attempts` is reached; any other error is logged and the message
//! is dropped, since the orchestrator has already persisted whatever it decided.

use super::pipeline::PipelineOrchestrator;
use crate::config::WorkerConfig;
use crate::logging::log_error;
use crate::messaging::{DispatchTransport, LocalQueue, MessageEnvelope};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct WorkerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    redelivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub redelivered: u64,
}

impl WorkerStats {
    fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
        }
    }
}

pub struct PipelineWorker {
    orchestrator: Arc<PipelineOrchestrator>,
    transport: Arc<dyn DispatchTransport>,
    queue: LocalQueue,
    permits: Arc<Semaphore>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
}

impl PipelineWorker {
    /// `transport` is used for redeliveries and must feed `queue`
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        transport: Arc<dyn DispatchTransport>,
        queue: LocalQueue,
        config: WorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            transport,
            queue,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Process messages until the queue is empty and nothing is in flight, including
    /// redeliveries produced along the way
    pub async fn drain(&mut self) -> WorkerStatsSnapshot {
        let mut in_flight = JoinSet::new();
        loop {
            while let Some(envelope) = self.queue.try_recv() {
                self.spawn(&mut in_flight, envelope).await;
            }
            match in_flight.join_next().await {
                Some(joined) => {
                    if let Err(e) = joined {
                        error!(error = %e, "Worker task panicked");
                    }
                }
                None if self.queue.is_empty() => break,
                None => {}
            }
        }
        self.stats.snapshot()
    }

    /// Run until `shutdown` resolves, sweeping for stalled tasks every
    /// `worker.recovery_interval_seconds`. In-flight messages finish before returning.
    pub async fn run_until<F>(mut self, shutdown: F) -> WorkerStatsSnapshot
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut recovery = interval(self.config.recovery_interval());
        recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        info!(
            concurrency = self.config.concurrency,
            "🚀 Pipeline worker started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(in_flight = in_flight.len(), "🛑 Shutdown requested");
                    break;
                }
                received = self.queue.recv() => match received {
                    Some(envelope) => self.spawn(&mut in_flight, envelope).await,
                    None => break,
                },
                _ = recovery.tick() => {
                    match self.orchestrator.recover_stalled_tasks().await {
                        Ok(report) => debug!(
                            scanned = report.tasks_scanned,
                            advanced = report.advanced,
                            redispatched = report.redispatched,
                            "Recovery sweep finished"
                        ),
                        Err(e) => log_error("pipeline_worker", "recover_stalled_tasks", &e.to_string(), None),
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Worker task panicked");
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }
        let stats = self.stats.snapshot();
        info!(
            processed = stats.processed,
            failed = stats.failed,
            redelivered = stats.redelivered,
            "Pipeline worker stopped"
        );
        stats
    }

    async fn spawn(&self, in_flight: &mut JoinSet<()>, envelope: MessageEnvelope) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            warn!(message = %envelope.message, "Worker permits closed, dropping message");
            return;
        };
        let orchestrator = self.orchestrator.clone();
        let transport = self.transport.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        in_flight.spawn(async move {
            process(&orchestrator, transport.as_ref(), &stats, &config, envelope).await;
            drop(permit);
        });
    }
}

async fn process(
    orchestrator: &PipelineOrchestrator,
    transport: &dyn DispatchTransport,
    stats: &WorkerStats,
    config: &WorkerConfig,
    envelope: MessageEnvelope,
) {
    let started = Instant::now();
    match orchestrator.handle_message(&envelope.message).await {
        Ok(()) => {
            stats.processed.fetch_add(1, Ordering::Relaxed);
            debug!(
                message = %envelope.message,
                correlation_id = %envelope.correlation_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Message handled"
            );
        }
        Err(e) if e.is_retryable() && envelope.delivery_attempt < config.max_delivery_attempts => {
            let backoff = config.redelivery_backoff(envelope.delivery_attempt);
            warn!(
                message = %envelope.message,
                attempt = envelope.delivery_attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %e,
                "Retryable failure, redelivering"
            );
            sleep(backoff).await;
            match transport.send(envelope.redelivery()).await {
                Ok(()) => {
                    stats.redelivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(send_error) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    log_error(
                        "pipeline_worker",
                        "redeliver",
                        &send_error.to_string(),
                        Some(&envelope.message.to_string()),
                    );
                }
            }
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            log_error(
                "pipeline_worker",
                "handle_message",
                &e.to_string(),
                Some(&format!(
                    "{} (attempt {})",
                    envelope.message, envelope.delivery_attempt
                )),
            );
        }
    }
}
