//! # Messaging Module
//!
//! Dispatch intents between the pipeline orchestrator and its workers. The core never
//! calls the step executor for another stage directly; it emits a message and lets the
//! transport deliver it at least once.

pub mod message;
pub mod transport;

pub use message::{MessageEnvelope, PipelineMessage};
pub use transport::{DispatchTransport, LocalDispatchTransport, LocalQueue};
