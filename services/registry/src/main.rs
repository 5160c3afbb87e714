//! Registry server.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use registry::config::{Config, LogFormat, LoggingConfig, SentryConfig};
use registry::{Database, RegistryBuilder};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Serve an artifact registry.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "registry.toml")]
    config: PathBuf,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let output = match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(output.with_filter(filter))
        .with(tracing_error::ErrorLayer::default())
        .init();
}

fn init_sentry(config: &SentryConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config.environment.clone().map(Into::into),
            ..Default::default()
        },
    )))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("received shutdown signal");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .wrap_err_with(|| format!("loading {}", args.config.display()))?;

    init_tracing(&config.logging);
    let _sentry = init_sentry(&config.sentry);

    let database = Database::connect(&config.database.url)
        .await
        .wrap_err("opening database")?;
    let storage = config
        .storage
        .clone()
        .build()
        .await
        .wrap_err("configuring blob storage")?;
    tracing::info!(driver = storage.name(), tokens = config.tokens.len(), "registry configured");

    let app = RegistryBuilder::new(database, storage)
        .authenticator(config.authenticator())
        .settings(config.registry.clone())
        .export(config.export.clone())
        .build();

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .wrap_err_with(|| format!("binding {}", config.bind))?;
    tracing::info!(address = %config.bind, "registry listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("registry stopped");
    Ok(())
}
