use std::sync::{Arc, LazyLock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::auth::{AuthError, hash_password_blocking};
use crate::error::StoreError;
use crate::models::{Password, PasswordError, Plan, User};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

#[async_trait]
pub trait UserRepository: Send + Sync {
  async fn find_one_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
  async fn register(&self, user: &User) -> Result<(), StoreError>;
}

pub struct PgUserRepository {
  pool: Pool<Postgres>,
}

impl PgUserRepository {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }
}

#[derive(sqlx::FromRow)]
struct UserRow {
  id: Uuid,
  username: String,
  email: String,
  password_hash: String,
  avatar_url: Option<String>,
  plan: String,
  created_at: DateTime<Utc>,
  updated_at: Option<DateTime<Utc>>,
}

impl From<UserRow> for User {
  fn from(row: UserRow) -> Self {
    User::restore(
      row.id,
      row.username,
      row.email,
      row.password_hash,
      row.avatar_url,
      Plan::parse(&row.plan),
      row.created_at,
      row.updated_at,
    )
  }
}

#[async_trait]
impl UserRepository for PgUserRepository {
  async fn find_one_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
    let row = sqlx::query_as::<_, UserRow>(
      "SELECT id, username, email, password_hash, avatar_url, plan, created_at, updated_at
       FROM users WHERE email = $1",
    )
      .bind(email)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(User::from))
  }

  async fn register(&self, user: &User) -> Result<(), StoreError> {
    sqlx::query(
      "INSERT INTO users (id, username, email, password_hash, avatar_url, plan, created_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
      .bind(user.id())
      .bind(user.username())
      .bind(user.email())
      .bind(user.password_hash())
      .bind(user.avatar_url())
      .bind(user.plan().as_str())
      .bind(user.created_at())
      .execute(&self.pool)
      .await
      .map_err(|e| {
        if e.as_database_error().is_some_and(|db| db.is_unique_violation()) {
          StoreError::Duplicate("Email".into())
        } else {
          StoreError::Database(e)
        }
      })?;
    Ok(())
  }
}

#[derive(Default)]
pub struct InMemoryUserRepository {
  users: RwLock<Vec<User>>,
}

impl InMemoryUserRepository {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn all(&self) -> Vec<User> {
    self.users.read().await.clone()
  }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
  async fn find_one_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
    Ok(self.users.read().await.iter().find(|u| u.email() == email).cloned())
  }

  async fn register(&self, user: &User) -> Result<(), StoreError> {
    let mut users = self.users.write().await;
    if users.iter().any(|u| u.email() == user.email()) {
      return Err(StoreError::Duplicate("Email".into()));
    }
    users.push(user.clone());
    Ok(())
  }
}

#[derive(Debug, Error)]
pub enum RegisterError {
  #[error("{0}")]
  Invalid(String),
  #[error(transparent)]
  Password(#[from] PasswordError),
  #[error("Email already exists")]
  EmailTaken,
  #[error(transparent)]
  Auth(#[from] AuthError),
  #[error(transparent)]
  Store(StoreError),
}

impl From<StoreError> for RegisterError {
  fn from(e: StoreError) -> Self {
    match e {
      StoreError::Duplicate(_) => RegisterError::EmailTaken,
      other => RegisterError::Store(other),
    }
  }
}

#[derive(Debug, Clone)]
pub struct RegisterUserRequest {
  pub username: String,
  pub email: String,
  pub password: String,
  pub avatar_url: Option<String>,
}

pub struct RegisterUser {
  users: Arc<dyn UserRepository>,
}

impl RegisterUser {
  pub fn new(users: Arc<dyn UserRepository>) -> Self {
    Self { users }
  }

  pub async fn execute(&self, request: RegisterUserRequest) -> Result<User, RegisterError> {
    let username = request.username.trim();
    if username.is_empty() {
      return Err(RegisterError::Invalid("username must not be empty".into()));
    }
    if !EMAIL.is_match(&request.email) {
      return Err(RegisterError::Invalid("email must be a valid address".into()));
    }
    let password = Password::new(request.password)?;
    let password_hash = hash_password_blocking(password.as_str().to_string()).await?;

    let user = User::new(username.to_string(), request.email, password_hash, request.avatar_url);
    self.users.register(&user).await?;
    info!("Registered user {}", user.id());
    Ok(user)
  }
}

pub struct FindUserByEmail {
  users: Arc<dyn UserRepository>,
}

impl FindUserByEmail {
  pub fn new(users: Arc<dyn UserRepository>) -> Self {
    Self { users }
  }

  pub async fn execute(&self, email: &str) -> Result<Option<User>, StoreError> {
    self.users.find_one_by_email(email).await
  }
}
