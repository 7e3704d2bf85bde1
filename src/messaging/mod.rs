//! Queue plumbing shared by the API: a broker abstraction with a RabbitMQ
//! backed implementation and an in-process one used by tests.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

mod memory;
mod rabbit;

pub use memory::InMemoryBroker;
pub use rabbit::RabbitBroker;

pub const JOB_QUEUE: &str = "audio_jobs";
pub const STATUS_QUEUE: &str = "audio_status";

#[derive(Debug, Error)]
pub enum QueueError {
  #[error("queue unavailable: {0}")]
  Unavailable(String),
  #[error("broker rejected message for queue '{0}'")]
  Rejected(String),
  #[error("failed to serialize message: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("a consumer is already registered for queue '{0}'")]
  ConsumerAlreadyRegistered(String),
  #[error("transport error: {0}")]
  Transport(#[from] lapin::Error),
}

impl QueueError {
  /// Transport level failures: the broker could not take the message.
  pub fn is_unavailable(&self) -> bool {
    matches!(self, QueueError::Unavailable(_) | QueueError::Rejected(_) | QueueError::Transport(_))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
  Connected,
  Disconnected,
}

/// Callback invoked once per delivered message. Returning an error leaves the
/// message for broker redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
  async fn handle(&self, message: Value) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
  /// Ensures every named queue exists and is durable.
  async fn declare_queues(&self, names: &[&str]) -> Result<(), QueueError>;

  /// Serializes `message` and returns once the broker has confirmed it.
  async fn publish(&self, queue: &str, message: &Value) -> Result<(), QueueError>;

  /// Registers the single handler for `queue`.
  async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<(), QueueError>;

  async fn close(&self) -> Result<(), QueueError>;
}

/// What to tell the broker about a delivery once the handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
  Ack,
  Requeue,
}

/// Decodes one delivery and runs it through `handler`.
///
/// Undecodable payloads are acknowledged and dropped. A failing or panicking
/// handler always leaves the message for redelivery; handlers decide which
/// messages are poison and return `Ok` for them.
pub async fn settle(queue: &str, handler: &dyn MessageHandler, payload: &[u8], redelivered: bool) -> Settlement {
  let message: Value = match serde_json::from_slice(payload) {
    Ok(message) => message,
    Err(e) => {
      warn!("Dropping malformed message on {}: {:?}", queue, e);
      return Settlement::Ack;
    }
  };

  let outcome = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
  let failure = match outcome {
    Ok(Ok(())) => {
      debug!("Handled message on {}", queue);
      return Settlement::Ack;
    }
    Ok(Err(e)) => format!("{:?}", e),
    Err(_) => "handler panicked".to_string(),
  };

  error!("Handler for {} failed (redelivered: {}), requeueing message: {}", queue, redelivered, failure);
  Settlement::Requeue
}
