use std::convert::Infallible;
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

use crate::messaging::QueueError;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("duplicate record: {0}")]
  Duplicate(String),
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum ApiError {
  #[error("{0}")]
  BadRequest(String),
  #[error("{0}")]
  Unauthorized(String),
  #[error("{0}")]
  NotFound(String),
  #[error("{0}")]
  Conflict(String),
  #[error("{0}")]
  ServiceUnavailable(String),
  #[error("{0}")]
  Internal(String),
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::Conflict(_) => StatusCode::UNPROCESSABLE_ENTITY,
      ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  pub fn code(&self) -> &'static str {
    match self {
      ApiError::BadRequest(_) => "bad_request",
      ApiError::Unauthorized(_) => "unauthorized",
      ApiError::NotFound(_) => "not_found",
      ApiError::Conflict(_) => "conflict",
      ApiError::ServiceUnavailable(_) => "service_unavailable",
      ApiError::Internal(_) => "internal_error",
    }
  }
}

impl From<StoreError> for ApiError {
  fn from(e: StoreError) -> Self {
    if let StoreError::Duplicate(what) = &e {
      return ApiError::Conflict(format!("{} already exists", what));
    }
    error!("Storage failure: {:?}", e);
    ApiError::Internal("An internal storage error occurred.".into())
  }
}

impl From<QueueError> for ApiError {
  fn from(e: QueueError) -> Self {
    if e.is_unavailable() {
      ApiError::ServiceUnavailable("Job queue is unavailable, try again later.".into())
    } else {
      ApiError::Internal("An error occurred when publishing the job.".into())
    }
  }
}

pub fn reject(e: impl Into<ApiError>) -> Rejection {
  warp::reject::custom(e.into())
}

#[derive(Serialize)]
struct ErrorBody<'a> {
  error: &'a str,
  message: String,
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, code, message) = if let Some(e) = err.find::<ApiError>() {
    (e.status(), e.code(), e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not_found", "Not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, "bad_request", e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "Method not allowed".to_string())
  } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media_type", "Expected a JSON body".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "Internal server error".to_string())
  };

  let body = warp::reply::json(&ErrorBody { error: code, message });
  Ok(warp::reply::with_status(body, status))
}
