use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, Rejection};

use crate::auth::{AuthService, Claims, validate_token};
use crate::error::{ApiError, handle_rejection, reject};
use crate::jobs::{AudioJobRepository, JobStatusStore};
use crate::users::UserRepository;

pub mod audio;
pub mod sse;
pub mod users;

/// Everything the HTTP handlers need, assembled once in `main`.
#[derive(Clone)]
pub struct AppState {
  pub jobs: Arc<dyn AudioJobRepository>,
  pub job_store: Arc<dyn JobStatusStore>,
  pub users: Arc<dyn UserRepository>,
  pub auth: Arc<AuthService>,
  pub job_queue: String,
  pub audio_require_auth: bool,
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  audio::process_route(state.clone())
    .or(audio::job_route(state.clone()))
    .or(sse::job_events_route(state.clone()))
    .or(users::register_route(state.clone()))
    .or(users::login_route(state.clone()))
    .or(users::profile_route(state))
    .recover(handle_rejection)
    .with(warp::trace::request())
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

fn bearer_claims(header: Option<&str>, auth: &AuthService) -> Result<Claims, ApiError> {
  let token = header
    .and_then(|h| h.strip_prefix("Bearer "))
    .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
  validate_token(token.trim(), auth.jwt()).map_err(|_| ApiError::Unauthorized("Invalid or expired token".into()))
}

/// Rejects requests without a valid bearer token.
fn with_claims(auth: Arc<AuthService>) -> impl Filter<Extract = (Claims,), Error = Rejection> + Clone {
  warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
    let auth = auth.clone();
    async move { bearer_claims(header.as_deref(), &auth).map_err(reject) }
  })
}

/// Like [`with_claims`] when `required`, otherwise lets every request through
/// without inspecting credentials.
fn with_optional_claims(auth: Arc<AuthService>, required: bool) -> impl Filter<Extract = (Option<Claims>,), Error = Rejection> + Clone {
  warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
    let auth = auth.clone();
    async move {
      if !required {
        return Ok(None);
      }
      bearer_claims(header.as_deref(), &auth).map(Some).map_err(reject)
    }
  })
}
