use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{MessageBroker, MessageHandler, QueueError, Settlement, settle};

struct Envelope {
  payload: Vec<u8>,
  redelivered: bool,
}

const MAX_DELIVERIES_PER_PUMP: usize = 64;

#[derive(Default)]
struct State {
  queues: HashMap<String, VecDeque<Envelope>>,
  consumers: HashMap<String, Arc<dyn MessageHandler>>,
}

/// Broker stand-in that keeps queues in process. Deliveries only happen when
/// a test calls [`InMemoryBroker::pump`].
#[derive(Default)]
pub struct InMemoryBroker {
  state: Mutex<State>,
  unreachable: AtomicBool,
  closed: AtomicBool,
}

impl InMemoryBroker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes every following publish fail as if the broker were down.
  pub fn set_unreachable(&self, unreachable: bool) {
    self.unreachable.store(unreachable, Ordering::SeqCst);
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Messages currently waiting on `queue`, oldest first.
  pub async fn published(&self, queue: &str) -> Vec<Value> {
    let state = self.state.lock().await;
    state
      .queues
      .get(queue)
      .map(|q| q.iter().filter_map(|m| serde_json::from_slice(&m.payload).ok()).collect())
      .unwrap_or_default()
  }

  /// Enqueues raw bytes, bypassing serialization.
  pub async fn publish_raw(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
    self.enqueue(queue, payload.to_vec()).await
  }

  /// Delivers waiting messages on `queue` to its consumer until the queue is
  /// empty. Requeued messages go back to the head of the queue flagged as
  /// redelivered, so a handler that never succeeds stops the pump after a
  /// bounded number of deliveries.
  pub async fn pump(&self, queue: &str) -> Vec<Settlement> {
    let mut settlements = Vec::new();
    while settlements.len() < MAX_DELIVERIES_PER_PUMP {
      let (handler, envelope) = {
        let mut state = self.state.lock().await;
        let Some(handler) = state.consumers.get(queue).cloned() else { break };
        let Some(envelope) = state.queues.get_mut(queue).and_then(|q| q.pop_front()) else { break };
        (handler, envelope)
      };

      let settlement = settle(queue, handler.as_ref(), &envelope.payload, envelope.redelivered).await;
      if settlement == Settlement::Requeue {
        let mut state = self.state.lock().await;
        if let Some(q) = state.queues.get_mut(queue) {
          q.push_front(Envelope { payload: envelope.payload, redelivered: true });
        }
      }
      settlements.push(settlement);
    }
    settlements
  }

  /// Simulates a broker restart. Every declared queue is durable, so queued
  /// messages survive; consumers are dropped and must register again.
  pub async fn restart(&self) {
    self.state.lock().await.consumers.clear();
  }

  /// Publishing to a queue nobody declared is refused, like a mandatory
  /// publish that RabbitMQ cannot route.
  async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), QueueError> {
    if self.unreachable.load(Ordering::SeqCst) || self.is_closed() {
      return Err(QueueError::Unavailable("in-memory broker is unreachable".into()));
    }
    let mut state = self.state.lock().await;
    let q = state
      .queues
      .get_mut(queue)
      .ok_or_else(|| QueueError::Rejected(queue.to_string()))?;
    q.push_back(Envelope { payload, redelivered: false });
    Ok(())
  }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
  async fn declare_queues(&self, names: &[&str]) -> Result<(), QueueError> {
    let mut state = self.state.lock().await;
    for name in names {
      state.queues.entry(name.to_string()).or_default();
    }
    Ok(())
  }

  async fn publish(&self, queue: &str, message: &Value) -> Result<(), QueueError> {
    let payload = serde_json::to_vec(message)?;
    self.enqueue(queue, payload).await
  }

  async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<(), QueueError> {
    let mut state = self.state.lock().await;
    if state.consumers.contains_key(queue) {
      return Err(QueueError::ConsumerAlreadyRegistered(queue.to_string()));
    }
    state.consumers.insert(queue.to_string(), handler);
    Ok(())
  }

  async fn close(&self) -> Result<(), QueueError> {
    self.closed.store(true, Ordering::SeqCst);
    self.state.lock().await.consumers.clear();
    Ok(())
  }
}
