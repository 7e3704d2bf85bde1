use warp::{Filter};
use warp::http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use tracing::{info, error, debug};
use crate::auth::Claims;
use crate::error::{ApiError, reject};
use crate::models::{JobMessage, PROCESSING};
use super::{AppState, with_optional_claims, with_state};

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct ProcessAudio {
  pub input_url: String,
  #[serde(default)]
  pub effects: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessAudioResponse {
  pub message: String,
  pub job_id: Uuid,
  pub status: String,
}

pub fn process_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "audio" / "process")
    .and(warp::post())
    .and(with_optional_claims(state.auth.clone(), state.audio_require_auth))
    .and(warp::body::content_length_limit(MAX_BODY_BYTES))
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_process_audio)
}

pub fn job_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "audio" / "jobs" / Uuid)
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_get_job)
}

async fn handle_process_audio(claims: Option<Claims>, body: ProcessAudio, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  if body.input_url.trim().is_empty() {
    return Err(reject(ApiError::BadRequest("input_url must not be empty".into())));
  }
  if let Some(claims) = &claims {
    debug!("Audio job submitted by user {}", claims.sub);
  }

  let job_id = Uuid::new_v4();
  let message = JobMessage::new(job_id, body.input_url, body.effects);

  state.job_store.record_submitted(&message).await.map_err(reject)?;

  if let Err(e) = state.jobs.send_to_queue(&state.job_queue, &message).await {
    error!("Failed to dispatch job {}: {}", job_id, e);
    if let Err(store_err) = state.job_store.mark_dispatch_failed(job_id).await {
      error!("Failed to mark job {} as failed: {:?}", job_id, store_err);
    }
    return Err(reject(e));
  }

  info!("Job {} dispatched to worker", job_id);
  let response = ProcessAudioResponse {
    message: "Job dispatched to worker".into(),
    job_id,
    status: PROCESSING.into(),
  };
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::CREATED))
}

async fn handle_get_job(job_id: Uuid, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  match state.job_store.find(job_id).await.map_err(reject)? {
    Some(record) => Ok(warp::reply::json(&record)),
    None => Err(reject(ApiError::NotFound(format!("Job {} not found", job_id)))),
  }
}
