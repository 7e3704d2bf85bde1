use warp::{Filter};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::error;
use uuid::Uuid;
use crate::error::{ApiError, reject};
use crate::models::PROCESSING;
use super::{AppState, with_state};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub fn job_events_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "audio" / "jobs" / Uuid / "events")
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_job_events)
}

/// Streams one event once the job leaves `processing`, then ends.
async fn handle_job_events(job_id: Uuid, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  if state.job_store.find(job_id).await.map_err(reject)?.is_none() {
    return Err(reject(ApiError::NotFound(format!("Job {} not found", job_id))));
  }

  let store = state.job_store.clone();
  let interval = IntervalStream::new(tokio::time::interval(POLL_INTERVAL));
  let stream = interval.then(move |_| {
    let store = store.clone();
    async move {
      match store.find(job_id).await {
        Ok(Some(record)) if record.status != PROCESSING => {
          match warp::sse::Event::default().event("status").json_data(&record) {
            Ok(event) => Some(Ok::<_, Infallible>(event)),
            Err(e) => {
              error!("Failed to encode status event for job {}: {:?}", job_id, e);
              None
            }
          }
        }
        Ok(_) => None,
        Err(e) => {
          error!("Error fetching job status: {:?}", e);
          None
        }
      }
    }
  })
    .filter_map(|x| { x })
    .take(1);

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
