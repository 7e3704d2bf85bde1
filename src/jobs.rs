//! Job dispatch to the audio worker and bookkeeping of the status messages it
//! sends back.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Pool, Postgres};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::messaging::{MessageBroker, MessageHandler, QueueError};
use crate::models::{JobMessage, JobRecord, PROCESSING, StatusUpdate};

pub const DISPATCH_FAILED: &str = "dispatch_failed";

/// A job is open while it waits on the worker. Once the worker reports any
/// other status that status is final and only repeats of it are applied.
pub fn is_open(status: &str) -> bool {
  status == PROCESSING || status == DISPATCH_FAILED
}

fn accepts(current: &str, incoming: Option<&str>) -> bool {
  is_open(current) || incoming.is_none_or(|status| status == current)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
  Applied,
  Unchanged,
  UnknownJob,
}

#[async_trait]
pub trait JobStatusStore: Send + Sync {
  /// Inserts the job unless it is already known.
  async fn record_submitted(&self, message: &JobMessage) -> Result<(), StoreError>;

  async fn mark_dispatch_failed(&self, job_id: Uuid) -> Result<(), StoreError>;

  /// Applying the same update twice leaves the record as after the first, and
  /// a final status is never replaced by a different one.
  async fn apply_update(&self, update: &StatusUpdate) -> Result<UpdateOutcome, StoreError>;

  async fn find(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError>;
}

pub struct PgJobStatusStore {
  pool: Pool<Postgres>,
}

impl PgJobStatusStore {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl JobStatusStore for PgJobStatusStore {
  async fn record_submitted(&self, message: &JobMessage) -> Result<(), StoreError> {
    sqlx::query(
      "INSERT INTO audio_jobs (job_id, input_path, output_path, effects, status)
       VALUES ($1, $2, $3, $4, $5)
       ON CONFLICT (job_id) DO NOTHING",
    )
      .bind(message.job_id)
      .bind(&message.input_path)
      .bind(&message.output_path)
      .bind(Value::Array(message.effects.clone()))
      .bind(PROCESSING)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn mark_dispatch_failed(&self, job_id: Uuid) -> Result<(), StoreError> {
    sqlx::query("UPDATE audio_jobs SET status = $2, updated_at = NOW() WHERE job_id = $1")
      .bind(job_id)
      .bind(DISPATCH_FAILED)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn apply_update(&self, update: &StatusUpdate) -> Result<UpdateOutcome, StoreError> {
    let result = sqlx::query(
      "UPDATE audio_jobs
       SET status = COALESCE($2, status),
           output_url = COALESCE($3, output_url),
           last_status = $4,
           updated_at = NOW()
       WHERE job_id = $1
         AND last_status IS DISTINCT FROM $4
         AND (status IN ($5, $6) OR $2::text IS NULL OR status = $2::text)",
    )
      .bind(update.job_id)
      .bind(update.status.as_deref())
      .bind(update.output_url.as_deref())
      .bind(&update.document)
      .bind(PROCESSING)
      .bind(DISPATCH_FAILED)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() > 0 {
      return Ok(UpdateOutcome::Applied);
    }

    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT job_id FROM audio_jobs WHERE job_id = $1")
      .bind(update.job_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(if exists.is_some() { UpdateOutcome::Unchanged } else { UpdateOutcome::UnknownJob })
  }

  async fn find(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
    let record = sqlx::query_as::<_, JobRecord>(
      "SELECT job_id, input_path, output_path, effects, status, output_url, last_status, created_at, updated_at
       FROM audio_jobs WHERE job_id = $1",
    )
      .bind(job_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(record)
  }
}

#[derive(Default)]
pub struct InMemoryJobStatusStore {
  jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl InMemoryJobStatusStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn all(&self) -> Vec<JobRecord> {
    self.jobs.read().await.values().cloned().collect()
  }
}

#[async_trait]
impl JobStatusStore for InMemoryJobStatusStore {
  async fn record_submitted(&self, message: &JobMessage) -> Result<(), StoreError> {
    self
      .jobs
      .write()
      .await
      .entry(message.job_id)
      .or_insert_with(|| JobRecord::submitted(message));
    Ok(())
  }

  async fn mark_dispatch_failed(&self, job_id: Uuid) -> Result<(), StoreError> {
    if let Some(record) = self.jobs.write().await.get_mut(&job_id) {
      record.status = DISPATCH_FAILED.to_string();
      record.updated_at = Utc::now();
    }
    Ok(())
  }

  async fn apply_update(&self, update: &StatusUpdate) -> Result<UpdateOutcome, StoreError> {
    let mut jobs = self.jobs.write().await;
    let Some(record) = jobs.get_mut(&update.job_id) else {
      return Ok(UpdateOutcome::UnknownJob);
    };
    if record.last_status.as_ref() == Some(&update.document) || !accepts(&record.status, update.status.as_deref()) {
      return Ok(UpdateOutcome::Unchanged);
    }
    if let Some(status) = &update.status {
      record.status = status.clone();
    }
    if let Some(url) = &update.output_url {
      record.output_url = Some(url.clone());
    }
    record.last_status = Some(update.document.clone());
    record.updated_at = Utc::now();
    Ok(UpdateOutcome::Applied)
  }

  async fn find(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
    Ok(self.jobs.read().await.get(&job_id).cloned())
  }
}

/// Consumer for the status queue. Messages it cannot attribute to a job are
/// logged and dropped; storage failures are returned so the broker redelivers.
pub struct StatusCallbackHandler {
  store: Arc<dyn JobStatusStore>,
}

impl StatusCallbackHandler {
  pub fn new(store: Arc<dyn JobStatusStore>) -> Self {
    Self { store }
  }
}

#[async_trait]
impl MessageHandler for StatusCallbackHandler {
  async fn handle(&self, message: Value) -> anyhow::Result<()> {
    info!("Received status update from worker");
    let Some(update) = StatusUpdate::from_document(message) else {
      warn!("Dropping status message without a valid job_id");
      return Ok(());
    };

    match self.store.apply_update(&update).await? {
      UpdateOutcome::Applied => info!(
        "Job {} updated to {}",
        update.job_id,
        update.status.as_deref().unwrap_or("<unchanged>")
      ),
      UpdateOutcome::Unchanged => debug!("Duplicate or late status for job {} ignored", update.job_id),
      UpdateOutcome::UnknownJob => warn!("Status for unknown job {}", update.job_id),
    }
    Ok(())
  }
}

#[async_trait]
pub trait AudioJobRepository: Send + Sync {
  async fn send_to_queue(&self, queue: &str, message: &JobMessage) -> Result<(), QueueError>;

  async fn handle_job_complete(&self, message: Value) -> anyhow::Result<()>;
}

/// Broker-backed job repository. Publishes on the job queue and owns the one
/// status-queue consumer of the process.
pub struct QueueJobRepository {
  broker: Arc<dyn MessageBroker>,
  status_queue: String,
  callback: Arc<StatusCallbackHandler>,
}

impl QueueJobRepository {
  pub fn new(broker: Arc<dyn MessageBroker>, store: Arc<dyn JobStatusStore>, status_queue: impl Into<String>) -> Self {
    Self {
      broker,
      status_queue: status_queue.into(),
      callback: Arc::new(StatusCallbackHandler::new(store)),
    }
  }

  pub async fn on_startup(&self) -> Result<(), QueueError> {
    self.broker.consume(&self.status_queue, self.callback.clone()).await?;
    info!("Listening for job status on {}", self.status_queue);
    Ok(())
  }
}

#[async_trait]
impl AudioJobRepository for QueueJobRepository {
  async fn send_to_queue(&self, queue: &str, message: &JobMessage) -> Result<(), QueueError> {
    let payload = serde_json::to_value(message)?;
    match self.broker.publish(queue, &payload).await {
      Ok(()) => {
        info!("Job {} sent to {}", message.job_id, queue);
        Ok(())
      }
      Err(e) => {
        error!("Error sending job {} to {}: {}", message.job_id, queue, e);
        Err(e)
      }
    }
  }

  async fn handle_job_complete(&self, message: Value) -> anyhow::Result<()> {
    self.callback.handle(message).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::messaging::{InMemoryBroker, JOB_QUEUE, STATUS_QUEUE, Settlement};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio_test::{assert_err, assert_ok};

  /// Store whose first `failures` updates hit a storage error.
  struct FlakyStore {
    inner: InMemoryJobStatusStore,
    failures: usize,
    attempts: AtomicUsize,
  }

  #[async_trait]
  impl JobStatusStore for FlakyStore {
    async fn record_submitted(&self, message: &JobMessage) -> Result<(), StoreError> {
      self.inner.record_submitted(message).await
    }

    async fn mark_dispatch_failed(&self, job_id: Uuid) -> Result<(), StoreError> {
      self.inner.mark_dispatch_failed(job_id).await
    }

    async fn apply_update(&self, update: &StatusUpdate) -> Result<UpdateOutcome, StoreError> {
      if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
        return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
      }
      self.inner.apply_update(update).await
    }

    async fn find(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
      self.inner.find(job_id).await
    }
  }

  fn update(job_id: Uuid, document: Value) -> StatusUpdate {
    let mut document = document;
    document["job_id"] = json!(job_id.to_string());
    StatusUpdate::from_document(document).unwrap()
  }

  /// Delivers `failed`, then `completed`, then `failed` again and checks the
  /// final status is the first one the worker reported.
  async fn redelivered_status_does_not_roll_back(store: &dyn JobStatusStore) {
    let message = job();
    store.record_submitted(&message).await.unwrap();
    let failed = update(message.job_id, json!({"status": "failed"}));
    let completed = update(message.job_id, json!({"status": "completed", "output_url": "u"}));

    assert_eq!(store.apply_update(&failed).await.unwrap(), UpdateOutcome::Applied);
    assert_eq!(store.apply_update(&completed).await.unwrap(), UpdateOutcome::Unchanged);
    assert_eq!(store.apply_update(&failed).await.unwrap(), UpdateOutcome::Unchanged);

    let record = store.find(message.job_id).await.unwrap().unwrap();
    assert_eq!(record.status, "failed");
    assert_eq!(record.output_url, None);
  }

  /// Progress reports may arrive before and after the final status.
  async fn progress_then_final_then_stale_progress(store: &dyn JobStatusStore) {
    let message = job();
    store.record_submitted(&message).await.unwrap();
    let progress = update(message.job_id, json!({"status": "processing", "progress": 50}));
    let completed = update(message.job_id, json!({"status": "completed", "output_url": "u"}));

    assert_eq!(store.apply_update(&progress).await.unwrap(), UpdateOutcome::Applied);
    assert_eq!(store.apply_update(&completed).await.unwrap(), UpdateOutcome::Applied);
    assert_eq!(store.apply_update(&progress).await.unwrap(), UpdateOutcome::Unchanged);

    let record = store.find(message.job_id).await.unwrap().unwrap();
    assert_eq!(record.status, "completed");
    assert_eq!(record.output_url.as_deref(), Some("u"));
  }

  async fn setup() -> (Arc<InMemoryBroker>, Arc<InMemoryJobStatusStore>, QueueJobRepository) {
    let broker = Arc::new(InMemoryBroker::new());
    broker.declare_queues(&[JOB_QUEUE, STATUS_QUEUE]).await.unwrap();
    let store = Arc::new(InMemoryJobStatusStore::new());
    let repo = QueueJobRepository::new(broker.clone(), store.clone(), STATUS_QUEUE);
    (broker, store, repo)
  }

  fn job() -> JobMessage {
    JobMessage::new(Uuid::new_v4(), "s3://bucket/in.mp3", vec![json!("normalize")])
  }

  #[tokio::test]
  async fn send_to_queue_publishes_the_job_message() {
    let (broker, _, repo) = setup().await;
    let message = job();
    assert_ok!(repo.send_to_queue(JOB_QUEUE, &message).await);
    assert_eq!(broker.published(JOB_QUEUE).await, vec![serde_json::to_value(&message).unwrap()]);
  }

  #[tokio::test]
  async fn send_to_queue_propagates_broker_failure() {
    let (broker, _, repo) = setup().await;
    broker.set_unreachable(true);
    let err = assert_err!(repo.send_to_queue(JOB_QUEUE, &job()).await);
    assert!(err.is_unavailable());
  }

  #[tokio::test]
  async fn on_startup_registers_a_single_status_consumer() {
    let (_, _, repo) = setup().await;
    assert_ok!(repo.on_startup().await);
    let err = assert_err!(repo.on_startup().await);
    assert!(matches!(err, QueueError::ConsumerAlreadyRegistered(_)));
  }

  #[tokio::test]
  async fn handle_job_complete_is_idempotent() {
    let (_, store, repo) = setup().await;
    let message = job();
    store.record_submitted(&message).await.unwrap();
    let status = json!({"job_id": message.job_id.to_string(), "status": "completed", "output_url": "https://r2/out.wav"});

    assert_ok!(repo.handle_job_complete(status.clone()).await);
    let once = store.find(message.job_id).await.unwrap().unwrap();
    assert_ok!(repo.handle_job_complete(status).await);
    let twice = store.find(message.job_id).await.unwrap().unwrap();

    assert_eq!(once.status, "completed");
    assert_eq!(once.output_url.as_deref(), Some("https://r2/out.wav"));
    assert_eq!(once.status, twice.status);
    assert_eq!(once.output_url, twice.output_url);
    assert_eq!(once.last_status, twice.last_status);
    assert_eq!(once.updated_at, twice.updated_at);
  }

  #[tokio::test]
  async fn status_messages_flow_from_queue_to_store() {
    let (broker, store, repo) = setup().await;
    let message = job();
    store.record_submitted(&message).await.unwrap();
    repo.on_startup().await.unwrap();

    broker.publish(STATUS_QUEUE, &json!({"job_id": message.job_id.to_string(), "status": "completed"})).await.unwrap();
    broker.publish_raw(STATUS_QUEUE, b"garbage").await.unwrap();
    broker.publish(STATUS_QUEUE, &json!({"status": "completed"})).await.unwrap();

    let settlements = broker.pump(STATUS_QUEUE).await;
    assert_eq!(settlements, vec![Settlement::Ack, Settlement::Ack, Settlement::Ack]);
    assert_eq!(store.find(message.job_id).await.unwrap().unwrap().status, "completed");
  }

  #[tokio::test]
  async fn unknown_job_status_is_acknowledged() {
    let (_, store, repo) = setup().await;
    let job_id = Uuid::new_v4();
    assert_ok!(repo.handle_job_complete(json!({"job_id": job_id.to_string(), "status": "failed"})).await);
    assert!(store.find(job_id).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn record_submitted_does_not_overwrite_progress() {
    let store = InMemoryJobStatusStore::new();
    let message = job();
    store.record_submitted(&message).await.unwrap();
    let update = StatusUpdate::from_document(json!({"job_id": message.job_id.to_string(), "status": "completed"})).unwrap();
    assert_eq!(store.apply_update(&update).await.unwrap(), UpdateOutcome::Applied);

    store.record_submitted(&message).await.unwrap();
    assert_eq!(store.find(message.job_id).await.unwrap().unwrap().status, "completed");
  }

  #[tokio::test]
  async fn dispatch_failure_is_recorded() {
    let store = InMemoryJobStatusStore::new();
    let message = job();
    store.record_submitted(&message).await.unwrap();
    store.mark_dispatch_failed(message.job_id).await.unwrap();
    assert_eq!(store.find(message.job_id).await.unwrap().unwrap().status, DISPATCH_FAILED);
  }

  #[tokio::test]
  async fn final_status_survives_redelivery_in_memory() {
    let store = InMemoryJobStatusStore::new();
    redelivered_status_does_not_roll_back(&store).await;
    progress_then_final_then_stale_progress(&store).await;
  }

  #[sqlx::test]
  #[ignore = "needs DATABASE_URL pointing at a Postgres server"]
  async fn final_status_survives_redelivery_in_postgres(pool: Pool<Postgres>) {
    let store = PgJobStatusStore::new(pool);
    redelivered_status_does_not_roll_back(&store).await;
    progress_then_final_then_stale_progress(&store).await;
  }

  #[test]
  fn dispatch_failed_jobs_still_accept_worker_status() {
    assert!(is_open(PROCESSING));
    assert!(is_open(DISPATCH_FAILED));
    assert!(!is_open("completed"));
    assert!(accepts(DISPATCH_FAILED, Some("completed")));
    assert!(accepts("completed", Some("completed")));
    assert!(accepts("completed", None));
    assert!(!accepts("completed", Some("failed")));
  }

  #[tokio::test]
  async fn status_is_applied_after_transient_store_failures() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.declare_queues(&[STATUS_QUEUE]).await.unwrap();
    let store = Arc::new(FlakyStore {
      inner: InMemoryJobStatusStore::new(),
      failures: 2,
      attempts: AtomicUsize::new(0),
    });
    let repo = QueueJobRepository::new(broker.clone(), store.clone(), STATUS_QUEUE);
    let message = job();
    store.record_submitted(&message).await.unwrap();
    repo.on_startup().await.unwrap();

    broker.publish(STATUS_QUEUE, &json!({"job_id": message.job_id.to_string(), "status": "completed"})).await.unwrap();
    let settlements = broker.pump(STATUS_QUEUE).await;

    assert_eq!(settlements, vec![Settlement::Requeue, Settlement::Requeue, Settlement::Ack]);
    assert!(broker.published(STATUS_QUEUE).await.is_empty());
    assert_eq!(store.find(message.job_id).await.unwrap().unwrap().status, "completed");
  }
}
