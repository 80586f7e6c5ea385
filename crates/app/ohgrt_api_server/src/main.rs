//! OhGrt API server binary.
//!
//! Loads security settings from the environment, applies command-line
//! overrides, connects PostgreSQL and (optionally) Redis, and serves the API
//! until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ohgrt_core::SecurityContext;
use ohgrt_core::auth::{PgRefreshTokenStore, PgUserDirectory};
use ohgrt_core::settings::{Environment, SecuritySettings, SettingsOverrides};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI arguments for the API server.
#[derive(Parser, Debug)]
#[command(name = "ohgrt_api_server", about = "OhGrt API server")]
struct Args {
    /// Port to listen on (0 = ephemeral).
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// PostgreSQL connection URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/ohgrt"
    )]
    database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// Redis URL for nonces and rate-limit windows. Empty runs memory-only.
    #[arg(long)]
    redis_url: Option<String>,

    /// Deployment environment (development, staging, production).
    #[arg(long)]
    environment: Option<Environment>,

    /// Skip request signing checks. Ignored in production.
    #[arg(long)]
    lite_mode: Option<bool>,

    #[arg(long)]
    rate_limit_enabled: Option<bool>,

    #[arg(long)]
    rate_limit_per_minute: Option<u64>,

    #[arg(long)]
    rate_limit_per_hour: Option<u64>,

    /// Seconds between expired refresh-token sweeps.
    #[arg(long, default_value_t = 3600)]
    purge_interval_secs: u64,
}

impl Args {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            environment: self.environment,
            redis_url: self.redis_url.clone(),
            lite_mode: self.lite_mode,
            rate_limit_enabled: self.rate_limit_enabled,
            rate_limit_per_minute: self.rate_limit_per_minute,
            rate_limit_per_hour: self.rate_limit_per_hour,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().or_else(|_| {
        tracing_subscriber::EnvFilter::try_new("info,ohgrt_api=debug,ohgrt_core=debug")
    })?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let args = Args::parse();
    let settings = SecuritySettings::from_env()?.with_overrides(args.overrides())?;

    info!(
        environment = settings.environment.as_str(),
        lite_mode = settings.lite_mode_active(),
        rate_limit = settings.rate_limit.enabled,
        redis = settings.store.redis_url.is_some(),
        "starting ohgrt_api_server"
    );

    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&args.database_url)
        .await?;

    info!("running database migrations");
    ohgrt_api::migrate(&pool).await?;

    let health_every = settings.store.health_check_interval();
    let security = Arc::new(SecurityContext::from_settings(
        settings,
        Arc::new(PgUserDirectory::new(pool.clone())),
        Arc::new(PgRefreshTokenStore::new(pool.clone())),
    )?);

    let shutdown = CancellationToken::new();
    let health_task = security
        .store
        .spawn_health_check(health_every, shutdown.clone());
    let purge_task = tokio::spawn({
        let security = security.clone();
        let shutdown = shutdown.clone();
        let every = Duration::from_secs(args.purge_interval_secs.max(60));
        async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => match security.sessions.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "Expired refresh tokens purged"),
                        Err(e) => warn!("Failed to purge refresh tokens: {e}"),
                    },
                }
            }
        }
    });

    let config = ohgrt_api::config::ApiConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        database_url: args.database_url,
    };
    let state = ohgrt_api::AppState {
        config: config.clone(),
        security,
        pool: Some(pool),
    };
    let app = ohgrt_api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
                _ = shutdown.cancelled() => {}
            }
        }
    })
    .await;

    shutdown.cancel();
    let _ = health_task.await;
    let _ = purge_task.await;

    result?;
    Ok(())
}
