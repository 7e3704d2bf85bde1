//! Password hashing and bearer-token issuance for registered users.

use std::sync::Arc;
use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::User;
use crate::users::UserRepository;

#[derive(Debug, Error)]
pub enum AuthError {
  #[error("invalid credentials")]
  InvalidCredentials,
  #[error("password hashing failed: {0}")]
  Hash(String),
  #[error("token error: {0}")]
  Token(#[from] jsonwebtoken::errors::Error),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Argon2id hash in PHC string form.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
  let salt = SaltString::generate(&mut OsRng);
  Argon2::default()
    .hash_password(password.as_bytes(), &salt)
    .map(|hash| hash.to_string())
    .map_err(|e| AuthError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
  let parsed = PasswordHash::new(hash).map_err(|e| AuthError::Hash(e.to_string()))?;
  match Argon2::default().verify_password(password.as_bytes(), &parsed) {
    Ok(()) => Ok(true),
    Err(argon2::password_hash::Error::Password) => Ok(false),
    Err(e) => Err(AuthError::Hash(e.to_string())),
  }
}

/// Hashes on the blocking pool; argon2 is too slow for an async worker thread.
pub async fn hash_password_blocking(password: String) -> Result<String, AuthError> {
  tokio::task::spawn_blocking(move || hash_password(&password))
    .await
    .map_err(|e| AuthError::Hash(e.to_string()))?
}

pub async fn verify_password_blocking(password: String, hash: String) -> Result<bool, AuthError> {
  tokio::task::spawn_blocking(move || verify_password(&password, &hash))
    .await
    .map_err(|e| AuthError::Hash(e.to_string()))?
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
  pub sub: Uuid,
  pub username: String,
  pub iat: i64,
  pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
  pub secret: String,
  pub expiry_secs: i64,
}

pub fn generate_access_token(user: &User, config: &JwtConfig) -> Result<String, AuthError> {
  let now = Utc::now().timestamp();
  let claims = Claims {
    sub: user.id(),
    username: user.username().to_string(),
    iat: now,
    exp: now + config.expiry_secs,
  };
  let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(config.secret.as_bytes()))?;
  Ok(token)
}

pub fn validate_token(token: &str, config: &JwtConfig) -> Result<Claims, AuthError> {
  let data = decode::<Claims>(
    token,
    &DecodingKey::from_secret(config.secret.as_bytes()),
    &Validation::default(),
  )?;
  Ok(data.claims)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessToken {
  pub access_token: String,
}

pub struct AuthService {
  users: Arc<dyn UserRepository>,
  jwt: JwtConfig,
}

impl AuthService {
  pub fn new(users: Arc<dyn UserRepository>, jwt: JwtConfig) -> Self {
    Self { users, jwt }
  }

  pub fn jwt(&self) -> &JwtConfig {
    &self.jwt
  }

  pub async fn sign_in(&self, email: &str, password: &str) -> Result<AccessToken, AuthError> {
    let user = self.validate_user(email, password).await?.ok_or(AuthError::InvalidCredentials)?;
    let access_token = generate_access_token(&user, &self.jwt)?;
    info!("User {} signed in", user.id());
    Ok(AccessToken { access_token })
  }

  pub async fn validate_user(&self, email: &str, password: &str) -> Result<Option<User>, AuthError> {
    let Some(user) = self.users.find_one_by_email(email).await? else {
      debug!("Sign-in for unknown email");
      return Ok(None);
    };
    if verify_password_blocking(password.to_string(), user.password_hash().to_string()).await? {
      Ok(Some(user))
    } else {
      Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::users::InMemoryUserRepository;
  use tokio_test::{assert_err, assert_ok};

  fn config() -> JwtConfig {
    JwtConfig { secret: "test-secret-that-is-long-enough".into(), expiry_secs: 60 }
  }

  #[test]
  fn hash_and_verify() {
    let hash = hash_password("correct-horse").unwrap();
    assert!(hash.starts_with("$argon2id$"));
    assert!(verify_password("correct-horse", &hash).unwrap());
    assert!(!verify_password("wrong-horse", &hash).unwrap());
  }

  #[tokio::test(flavor = "current_thread")]
  async fn blocking_pool_hashes_and_verifies() {
    let hash = assert_ok!(hash_password_blocking("correct-horse".into()).await);
    assert!(assert_ok!(verify_password_blocking("correct-horse".into(), hash.clone()).await));
    assert!(!assert_ok!(verify_password_blocking("wrong-horse".into(), hash).await));
    assert_err!(verify_password_blocking("correct-horse".into(), "not-a-phc-string".into()).await);
  }

  #[test]
  fn token_round_trip_and_wrong_secret() {
    let user = User::new("johndoe".into(), "john@example.com".into(), "hash".into(), None);
    let token = generate_access_token(&user, &config()).unwrap();
    let claims = validate_token(&token, &config()).unwrap();
    assert_eq!(claims.sub, user.id());
    assert_eq!(claims.username, "johndoe");
    assert!(claims.exp > claims.iat);

    let other = JwtConfig { secret: "another-secret".into(), expiry_secs: 60 };
    assert!(validate_token(&token, &other).is_err());
  }

  #[test]
  fn expired_token_is_rejected() {
    let now = Utc::now().timestamp();
    let claims = Claims { sub: Uuid::new_v4(), username: "x".into(), iat: now - 600, exp: now - 300 };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(config().secret.as_bytes())).unwrap();
    assert!(validate_token(&token, &config()).is_err());
  }

  #[tokio::test]
  async fn sign_in_checks_the_password() {
    let users = Arc::new(InMemoryUserRepository::new());
    let hash = hash_password("password123").unwrap();
    let user = User::new("johndoe".into(), "john@example.com".into(), hash, None);
    users.register(&user).await.unwrap();
    let auth = AuthService::new(users, config());

    let token = assert_ok!(auth.sign_in("john@example.com", "password123").await);
    assert_eq!(validate_token(&token.access_token, auth.jwt()).unwrap().sub, user.id());

    let err = assert_err!(auth.sign_in("john@example.com", "nope-nope").await);
    assert!(matches!(err, AuthError::InvalidCredentials));
    let err = assert_err!(auth.sign_in("ghost@example.com", "password123").await);
    assert!(matches!(err, AuthError::InvalidCredentials));
  }
}
