//! Test Results authentication API server.
//!
//! Reads configuration from flags, the environment and an optional `.env`,
//! runs migrations, and serves the auth router until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tr_api::config::{ApiConfig, Environment};
use tr_core::auth::pg::PgCredentialStore;
use tr_core::auth::service::SESSION_PURGE_INTERVAL;
use tr_core::auth::{AuthService, AuthSettings, OAuth2Federation, OAuthStateStore, ProviderRegistry};

/// CLI arguments; every flag can also be set through its environment variable.
#[derive(Parser, Debug)]
#[command(name = "tr_api_server", about = "Test Results authentication API server")]
struct Args {
    /// PostgreSQL connection URL.
    #[arg(long, env = "POSTGRES_DSN", hide_env_values = true)]
    postgres_dsn: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// `development` or `production`.
    #[arg(long, env = "ENVIRONMENT", default_value = "development")]
    environment: Environment,

    #[arg(long, env = "SESSION_TTL_HOURS", default_value_t = 24)]
    session_ttl_hours: i64,

    #[arg(long, env = "API_KEY_TTL_DAYS", default_value_t = 365)]
    api_key_ttl_days: i64,

    /// Maximum number of database connections in the pool.
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 10)]
    db_max_connections: u32,

    /// Per-request deadline in seconds.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tr_api=debug,tr_core=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!(
        port = args.port,
        environment = %args.environment,
        max_connections = args.db_max_connections,
        "starting tr_api_server"
    );

    let pool = PgPoolOptions::new()
        .max_connections(args.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&args.postgres_dsn)
        .await?;

    info!("running database migrations");
    tr_core::migrate::migrate(&pool).await?;

    let registry = ProviderRegistry::from_env();
    if registry.is_empty() {
        warn!("no OAuth2 providers configured; browser login is unavailable");
    } else {
        info!(providers = ?registry.names(), "OAuth2 providers configured");
    }
    let federation = OAuth2Federation::new(registry)?;

    let states = Arc::new(OAuthStateStore::new());
    let auth = Arc::new(
        AuthService::new(
            Arc::new(PgCredentialStore::new(pool.clone())),
            Arc::new(federation),
            AuthSettings::new(args.session_ttl_hours, args.api_key_ttl_days),
        )
        .with_state_store(states.clone()),
    );

    let cancel = CancellationToken::new();
    let purge_task = auth.spawn_session_purge_task(SESSION_PURGE_INTERVAL, cancel.clone());
    let state_task = states.spawn_cleanup_task(cancel.clone());

    let config = ApiConfig::new(args.environment)
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs.max(1)));
    let app = tr_api::router(tr_api::AppState::new(auth, config));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;

    cancel.cancel();
    let _ = purge_task.await;
    let _ = state_task.await;
    pool.close().await;
    info!("shutdown complete");

    serve_result?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM and cancels background work.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining connections");
    cancel.cancel();
}
