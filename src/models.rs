use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub const PROCESSING: &str = "processing";

pub fn output_path_for(job_id: Uuid) -> String {
  format!("processed/{}.wav", job_id)
}

/// Payload sent to the audio worker on the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
  pub job_id: Uuid,
  pub input_path: String,
  pub output_path: String,
  pub effects: Vec<serde_json::Value>,
}

impl JobMessage {
  pub fn new(job_id: Uuid, input_path: impl Into<String>, effects: Vec<serde_json::Value>) -> Self {
    Self {
      job_id,
      input_path: input_path.into(),
      output_path: output_path_for(job_id),
      effects,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
  pub job_id: Uuid,
  pub input_path: String,
  pub output_path: String,
  pub effects: serde_json::Value,
  pub status: String,
  pub output_url: Option<String>,
  pub last_status: Option<serde_json::Value>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl JobRecord {
  pub fn submitted(message: &JobMessage) -> Self {
    let now = Utc::now();
    Self {
      job_id: message.job_id,
      input_path: message.input_path.clone(),
      output_path: message.output_path.clone(),
      effects: serde_json::Value::Array(message.effects.clone()),
      status: PROCESSING.to_string(),
      output_url: None,
      last_status: None,
      created_at: now,
      updated_at: now,
    }
  }
}

/// The parts of a worker status message this service understands. The rest
/// of the document is kept as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
  pub job_id: Uuid,
  pub status: Option<String>,
  pub output_url: Option<String>,
  pub document: serde_json::Value,
}

impl StatusUpdate {
  pub fn from_document(document: serde_json::Value) -> Option<Self> {
    let job_id = document
      .get("job_id")
      .and_then(|v| v.as_str())
      .and_then(|v| Uuid::parse_str(v).ok())?;
    let text = |field: &str| document.get(field).and_then(|v| v.as_str()).map(str::to_string);
    let status = text("status");
    let output_url = text("output_url");
    Some(Self { job_id, status, output_url, document })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
  #[default]
  Free,
  Premium,
}

impl Plan {
  pub fn as_str(&self) -> &'static str {
    match self {
      Plan::Free => "free",
      Plan::Premium => "premium",
    }
  }

  pub fn parse(value: &str) -> Self {
    match value {
      "premium" => Plan::Premium,
      _ => Plan::Free,
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PasswordError {
  #[error("Password length error!")]
  Length,
  #[error("Password only contains numbers!")]
  OnlyNumbers,
}

/// Plaintext password that passed the strength rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
  pub const MIN_LEN: usize = 6;
  pub const MAX_LEN: usize = 230;

  pub fn new(value: impl Into<String>) -> Result<Self, PasswordError> {
    let value = value.into();
    let len = value.chars().count();
    if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&len) {
      return Err(PasswordError::Length);
    }
    if value.chars().all(|c| c.is_ascii_digit()) {
      return Err(PasswordError::OnlyNumbers);
    }
    Ok(Self(value))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
  id: Uuid,
  username: String,
  email: String,
  #[serde(skip_serializing)]
  password_hash: String,
  avatar_url: Option<String>,
  plan: Plan,
  created_at: DateTime<Utc>,
  updated_at: Option<DateTime<Utc>>,
}

impl User {
  pub fn new(username: String, email: String, password_hash: String, avatar_url: Option<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      username,
      email,
      password_hash,
      avatar_url,
      plan: Plan::Free,
      created_at: Utc::now(),
      updated_at: None,
    }
  }

  /// Rebuilds a user loaded from storage.
  #[allow(clippy::too_many_arguments)]
  pub fn restore(
    id: Uuid,
    username: String,
    email: String,
    password_hash: String,
    avatar_url: Option<String>,
    plan: Plan,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
  ) -> Self {
    Self { id, username, email, password_hash, avatar_url, plan, created_at, updated_at }
  }

  pub fn id(&self) -> Uuid { self.id }
  pub fn username(&self) -> &str { &self.username }
  pub fn email(&self) -> &str { &self.email }
  pub fn password_hash(&self) -> &str { &self.password_hash }
  pub fn avatar_url(&self) -> Option<&str> { self.avatar_url.as_deref() }
  pub fn plan(&self) -> Plan { self.plan }
  pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
  pub fn updated_at(&self) -> Option<DateTime<Utc>> { self.updated_at }

  pub fn set_username(&mut self, username: String) {
    self.username = username;
    self.touch();
  }

  pub fn set_email(&mut self, email: String) {
    self.email = email;
    self.touch();
  }

  pub fn set_password_hash(&mut self, password_hash: String) {
    self.password_hash = password_hash;
    self.touch();
  }

  pub fn set_avatar_url(&mut self, avatar_url: Option<String>) {
    self.avatar_url = avatar_url;
    self.touch();
  }

  pub fn set_plan(&mut self, plan: Plan) {
    self.plan = plan;
    self.touch();
  }

  fn touch(&mut self) {
    self.updated_at = Some(Utc::now());
  }
}
