use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use lapin::options::{
  BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, ConfirmSelectOptions,
  QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info, warn};

use super::{ConnectionEvent, MessageBroker, MessageHandler, QueueError, Settlement, settle};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);
const PERSISTENT: u8 = 2;

struct Session {
  generation: u64,
  connection: Connection,
  channel: Channel,
}

/// Single broker connection shared by every publisher and consumer in the
/// process. Queues and consumers registered on it are restored after the
/// connection or its channel drops.
pub struct RabbitBroker {
  url: String,
  me: Weak<Self>,
  queues: Mutex<Vec<String>>,
  consumers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
  session: RwLock<Option<Session>>,
  generation: AtomicU64,
  events: broadcast::Sender<ConnectionEvent>,
  closing: AtomicBool,
  runtime: Handle,
}

impl RabbitBroker {
  pub async fn connect(url: &str, queues: &[&str]) -> Result<Arc<Self>, QueueError> {
    let (events, _) = broadcast::channel(16);
    let broker = Arc::new_cyclic(|me| Self {
      url: url.to_string(),
      me: me.clone(),
      queues: Mutex::new(queues.iter().map(|q| q.to_string()).collect()),
      consumers: Mutex::new(HashMap::new()),
      session: RwLock::new(None),
      generation: AtomicU64::new(0),
      events,
      closing: AtomicBool::new(false),
      runtime: Handle::current(),
    });
    broker.establish().await?;
    Ok(broker)
  }

  pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
    self.events.subscribe()
  }

  async fn establish(&self) -> Result<(), QueueError> {
    let url = self.url.as_str();
    let connection = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
      Connection::connect(url, ConnectionProperties::default())
    })
      .await
      .map_err(|e| QueueError::Unavailable(e.to_string()))?;

    let channel = connection.create_channel().await?;
    channel.confirm_select(ConfirmSelectOptions::default()).await?;

    let queues = self.queues.lock().await.clone();
    for queue in &queues {
      declare_durable(&channel, queue).await?;
    }

    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let consumers: Vec<(String, Arc<dyn MessageHandler>)> = self
      .consumers
      .lock()
      .await
      .iter()
      .map(|(queue, handler)| (queue.clone(), handler.clone()))
      .collect();
    for (queue, handler) in consumers {
      self.start_consumer(&channel, generation, &queue, handler).await?;
    }

    let broker = self.me.clone();
    let runtime = self.runtime.clone();
    connection.on_error(move |err| {
      error!("RabbitMQ connection error: {:?}", err);
      if let Some(broker) = broker.upgrade() {
        runtime.spawn(broker.reconnect(generation));
      }
    });

    let mut session = self.session.write().await;
    if self.closing.load(Ordering::SeqCst) {
      drop(session);
      if let Err(e) = connection.close(200, "Bye").await {
        warn!("Failed to close RabbitMQ connection opened during shutdown: {:?}", e);
      }
      return Err(QueueError::Unavailable("broker is closing".into()));
    }
    *session = Some(Session { generation, connection, channel });
    drop(session);
    let _ = self.events.send(ConnectionEvent::Connected);
    info!("Connected to RabbitMQ");
    Ok(())
  }

  /// Replaces the session numbered `generation`. Later calls for the same
  /// session find it already replaced and return.
  fn reconnect(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
    Box::pin(async move {
      let stale = {
        let mut session = self.session.write().await;
        let current = session.as_ref().map(|s| s.generation);
        if !should_restore(self.closing.load(Ordering::SeqCst), current, generation) {
          return;
        }
        session.take()
      };
      let _ = self.events.send(ConnectionEvent::Disconnected);
      warn!("Disconnected from RabbitMQ, reconnecting");
      if let Some(stale) = stale {
        if stale.connection.status().connected() {
          let _ = stale.connection.close(200, "Reconnecting").await;
        }
      }

      while !self.closing.load(Ordering::SeqCst) {
        match self.establish().await {
          Ok(()) => return,
          Err(e) => {
            error!("Reconnect to RabbitMQ failed: {}", e);
            tokio::time::sleep(RECONNECT_PAUSE).await;
          }
        }
      }
    })
  }

  fn schedule_reconnect(&self, generation: u64) {
    if let Some(broker) = self.me.upgrade() {
      self.runtime.spawn(broker.reconnect(generation));
    }
  }

  async fn channel(&self) -> Result<Channel, QueueError> {
    let (generation, channel) = self
      .session
      .read()
      .await
      .as_ref()
      .map(|session| (session.generation, session.channel.clone()))
      .ok_or_else(|| QueueError::Unavailable("not connected to RabbitMQ".into()))?;
    if !channel.status().connected() {
      self.schedule_reconnect(generation);
      return Err(QueueError::Unavailable("RabbitMQ channel is closed".into()));
    }
    Ok(channel)
  }

  async fn start_consumer(
    &self,
    channel: &Channel,
    generation: u64,
    queue: &str,
    handler: Arc<dyn MessageHandler>,
  ) -> Result<(), QueueError> {
    let mut consumer = channel
      .basic_consume(queue, &format!("{}_consumer", queue), BasicConsumeOptions::default(), FieldTable::default())
      .await?;
    let queue = queue.to_string();
    let broker = self.me.clone();
    info!("Consuming from {}", queue);

    self.runtime.spawn(async move {
      while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
          Ok(delivery) => delivery,
          Err(e) => {
            error!("Consumer error on {}: {:?}", queue, e);
            break;
          }
        };
        let settled = match settle(&queue, handler.as_ref(), &delivery.data, delivery.redelivered).await {
          Settlement::Ack => delivery.ack(BasicAckOptions::default()).await,
          Settlement::Requeue => delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await,
        };
        if let Err(e) = settled {
          error!("Failed to settle delivery on {}: {:?}", queue, e);
        }
      }

      let Some(broker) = broker.upgrade() else { return };
      if broker.closing.load(Ordering::SeqCst) {
        debug!("Consumer for {} stopped", queue);
        return;
      }
      warn!("Consumer for {} ended unexpectedly, restoring the session", queue);
      broker.reconnect(generation).await;
    });
    Ok(())
  }
}

/// A failure reported for session `failed` is acted on only while that
/// session is still installed and the broker is not closing.
fn should_restore(closing: bool, current: Option<u64>, failed: u64) -> bool {
  !closing && current == Some(failed)
}

fn durable_queue_options() -> QueueDeclareOptions {
  QueueDeclareOptions { durable: true, ..Default::default() }
}

/// Unroutable messages come back to the publisher instead of being dropped.
fn publish_options() -> BasicPublishOptions {
  BasicPublishOptions { mandatory: true, ..Default::default() }
}

fn persistent_json_properties() -> BasicProperties {
  BasicProperties::default()
    .with_delivery_mode(PERSISTENT)
    .with_content_type("application/json".into())
}

/// Only a plain broker ack counts as accepted. A returned message means the
/// queue did not exist.
fn check_confirmation(queue: &str, confirmation: Confirmation) -> Result<(), QueueError> {
  match confirmation {
    Confirmation::Ack(None) => Ok(()),
    Confirmation::Ack(Some(_)) => {
      warn!("Message for {} was returned as unroutable", queue);
      Err(QueueError::Rejected(queue.to_string()))
    }
    Confirmation::Nack(_) => Err(QueueError::Rejected(queue.to_string())),
    Confirmation::NotRequested => {
      error!("Publish to {} was not confirmed, channel is not in confirm mode", queue);
      Err(QueueError::Rejected(queue.to_string()))
    }
  }
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<(), QueueError> {
  channel
    .queue_declare(queue, durable_queue_options(), FieldTable::default())
    .await?;
  debug!("Declared durable queue {}", queue);
  Ok(())
}

#[async_trait]
impl MessageBroker for RabbitBroker {
  async fn declare_queues(&self, names: &[&str]) -> Result<(), QueueError> {
    {
      let mut queues = self.queues.lock().await;
      for name in names {
        if !queues.iter().any(|q| q == name) {
          queues.push(name.to_string());
        }
      }
    }
    let channel = self.channel().await?;
    for name in names {
      declare_durable(&channel, name).await?;
    }
    Ok(())
  }

  async fn publish(&self, queue: &str, message: &Value) -> Result<(), QueueError> {
    let payload = serde_json::to_vec(message)?;
    let channel = self.channel().await?;
    let confirmation = channel
      .basic_publish("", queue, publish_options(), &payload, persistent_json_properties())
      .await?
      .await?;
    check_confirmation(queue, confirmation)
  }

  async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<(), QueueError> {
    {
      let mut consumers = self.consumers.lock().await;
      if consumers.contains_key(queue) {
        return Err(QueueError::ConsumerAlreadyRegistered(queue.to_string()));
      }
      consumers.insert(queue.to_string(), handler.clone());
    }
    let current = self
      .session
      .read()
      .await
      .as_ref()
      .map(|session| (session.generation, session.channel.clone()));
    match current {
      Some((generation, channel)) => self.start_consumer(&channel, generation, queue, handler).await,
      None => {
        warn!("Not connected, consumer for {} starts on reconnect", queue);
        Ok(())
      }
    }
  }

  /// Sets `closing` before taking the session lock, so a reconnect that is
  /// still running cannot install a new session afterwards.
  async fn close(&self) -> Result<(), QueueError> {
    if self.closing.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    let session = self.session.write().await.take();
    if let Some(session) = session {
      if let Err(e) = session.channel.close(200, "Bye").await {
        warn!("Failed to close RabbitMQ channel: {:?}", e);
      }
      session.connection.close(200, "Bye").await?;
    }
    let _ = self.events.send(ConnectionEvent::Disconnected);
    info!("Disconnected from RabbitMQ");
    Ok(())
  }
}
