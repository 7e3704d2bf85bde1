use std::sync::Arc;
use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use audio_dispatch::{
  auth::{AuthService, JwtConfig},
  config::Config,
  database::setup_database,
  jobs::{JobStatusStore, PgJobStatusStore, QueueJobRepository},
  messaging::{ConnectionEvent, MessageBroker, RabbitBroker},
  routes::{AppState, routes},
  users::{PgUserRepository, UserRepository},
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;
  let broker = RabbitBroker::connect(
    &config.rabbitmq_url,
    &[config.job_queue.as_str(), config.status_queue.as_str()],
  )
    .await?;

  let mut events = broker.subscribe_events();
  tokio::spawn(async move {
    while let Ok(event) = events.recv().await {
      match event {
        ConnectionEvent::Connected => info!("Broker connection up"),
        ConnectionEvent::Disconnected => info!("Broker connection down"),
      }
    }
  });

  let result = serve(&config, db_pool, broker.clone()).await;

  if let Err(e) = broker.close().await {
    error!("Failed to close broker connection: {}", e);
  }
  result
}

async fn serve(config: &Config, db_pool: sqlx::PgPool, broker: Arc<RabbitBroker>) -> Result<()> {
  let job_store: Arc<dyn JobStatusStore> = Arc::new(PgJobStatusStore::new(db_pool.clone()));
  let users: Arc<dyn UserRepository> = Arc::new(PgUserRepository::new(db_pool));
  let jobs = Arc::new(QueueJobRepository::new(broker, job_store.clone(), config.status_queue.clone()));
  jobs.on_startup().await?;

  let auth = Arc::new(AuthService::new(
    users.clone(),
    JwtConfig { secret: config.jwt_secret.clone(), expiry_secs: config.jwt_expiry_secs },
  ));
  let state = AppState {
    jobs,
    job_store,
    users,
    auth,
    job_queue: config.job_queue.clone(),
    audio_require_auth: config.audio_require_auth,
  };

  let (addr, server) = warp::serve(routes(state))
    .try_bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), shutdown_signal())?;
  info!("Listening on {}", addr);
  server.await;
  Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      error!("Failed to listen for Ctrl-C: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        error!("Failed to listen for SIGTERM: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => info!("Ctrl-C received, shutting down"),
    _ = terminate => info!("SIGTERM received, shutting down"),
  }
}
