use warp::{Filter};
use warp::http::StatusCode;
use serde::Deserialize;
use tracing::{error, warn};
use crate::auth::{AuthError, Claims};
use crate::error::{ApiError, reject};
use crate::users::{FindUserByEmail, RegisterError, RegisterUser, RegisterUserRequest};
use super::{AppState, with_claims, with_state};

#[derive(Debug, Deserialize)]
pub struct RegisterUserBody {
  pub email: String,
  pub password: String,
  pub username: String,
  pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignInBody {
  pub email: String,
  pub password: String,
}

impl From<RegisterError> for ApiError {
  fn from(e: RegisterError) -> Self {
    match e {
      RegisterError::Invalid(msg) => ApiError::BadRequest(msg),
      RegisterError::Password(e) => ApiError::BadRequest(e.to_string()),
      RegisterError::EmailTaken => ApiError::Conflict("Email already exists".into()),
      RegisterError::Auth(e) => e.into(),
      RegisterError::Store(e) => e.into(),
    }
  }
}

impl From<AuthError> for ApiError {
  fn from(e: AuthError) -> Self {
    match e {
      AuthError::InvalidCredentials => ApiError::Unauthorized("Invalid email or password".into()),
      AuthError::Store(e) => e.into(),
      other => {
        error!("Authentication failure: {:?}", other);
        ApiError::Internal("Authentication failed.".into())
      }
    }
  }
}

pub fn register_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "users" / "register")
    .and(warp::post())
    .and(warp::body::content_length_limit(16 * 1024))
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_register)
}

pub fn login_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("auth" / "login")
    .and(warp::post())
    .and(warp::body::content_length_limit(16 * 1024))
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_login)
}

pub fn profile_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "users" / "profile")
    .and(warp::get())
    .and(with_claims(state.auth.clone()))
    .map(|claims: Claims| warp::reply::json(&claims))
}

async fn handle_register(body: RegisterUserBody, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let existing = FindUserByEmail::new(state.users.clone())
    .execute(&body.email)
    .await
    .map_err(reject)?;
  if existing.is_some() {
    warn!("Registration attempted with an existing email");
    return Err(reject(ApiError::Conflict("Email already exists".into())));
  }

  RegisterUser::new(state.users.clone())
    .execute(RegisterUserRequest {
      username: body.username,
      email: body.email,
      password: body.password,
      avatar_url: body.avatar_url,
    })
    .await
    .map_err(reject)?;

  Ok(warp::reply::with_status(warp::reply(), StatusCode::CREATED))
}

async fn handle_login(body: SignInBody, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let token = state.auth.sign_in(&body.email, &body.password).await.map_err(reject)?;
  Ok(warp::reply::json(&token))
}
