//! Dispatch transport seam and the in-process implementation.
//!
//! The orchestrator only ever emits intents through [`DispatchTransport`]. A durable
//! broker can sit behind the trait; [`LocalDispatchTransport`] is a bounded tokio
//! channel used for single-process deployments and tests.

use super::message::{MessageEnvelope, PipelineMessage};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

#[async_trait]
pub trait DispatchTransport: Send + Sync {
    async fn send(&self, envelope: MessageEnvelope) -> PipelineResult<()>;

    async fn dispatch(&self, message: PipelineMessage) -> PipelineResult<()> {
        self.send(MessageEnvelope::new(message)).await
    }
}

#[derive(Debug, Clone)]
pub struct LocalDispatchTransport {
    sender: mpsc::Sender<MessageEnvelope>,
}

/// Receiving half of a [`LocalDispatchTransport`]
#[derive(Debug)]
pub struct LocalQueue {
    receiver: mpsc::Receiver<MessageEnvelope>,
}

impl LocalDispatchTransport {
    pub fn channel(capacity: usize) -> (Self, LocalQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, LocalQueue { receiver })
    }
}

#[async_trait]
impl DispatchTransport for LocalDispatchTransport {
    async fn send(&self, envelope: MessageEnvelope) -> PipelineResult<()> {
        debug!(
            message = %envelope.message,
            attempt = envelope.delivery_attempt,
            "📤 Dispatching pipeline message"
        );
        self.sender
            .send(envelope)
            .await
            .map_err(|e| PipelineError::DispatchError(format!("local queue closed: {e}")))
    }
}

impl LocalQueue {
    pub async fn recv(&mut self) -> Option<MessageEnvelope> {
        self.receiver.recv().await
    }

    /// Next message if one is already waiting
    pub fn try_recv(&mut self) -> Option<MessageEnvelope> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
