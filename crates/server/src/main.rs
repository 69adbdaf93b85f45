//! Bazel S3 cache server binary.

use anyhow::{Context, Result};
use bazel_cache_core::AppConfig;
use bazel_cache_core::config::DEFAULT_CONFIG_PATH;
use bazel_cache_server::{AppState, create_router};
use clap::Parser;
use figment::Figment;
use figment::providers::Serialized;
use prometheus::Registry;
use serde::Serialize;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bazel remote cache backed by S3
#[derive(Parser, Debug)]
#[command(name = "bazel-s3-cache")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (skipped if missing)
    #[arg(short, long, env = "BAZEL_CACHE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listen address, e.g. ":8080" or "127.0.0.1:9090"
    #[arg(short, long)]
    listen: Option<String>,

    /// S3 bucket holding the cache
    #[arg(short, long)]
    bucket: Option<String>,

    /// AWS region
    #[arg(short, long)]
    region: Option<String>,

    /// AWS access key ID
    #[arg(short = 'k', long = "key")]
    access_key_id: Option<String>,

    /// AWS secret access key
    #[arg(short = 's', long = "secret")]
    secret_access_key: Option<String>,

    /// AWS session token
    #[arg(short = 't', long = "token")]
    session_token: Option<String>,

    /// S3-compatible endpoint URL (MinIO, etc.)
    #[arg(long)]
    endpoint: Option<String>,

    /// Use path-style bucket addressing
    #[arg(long)]
    force_path_style: bool,

    /// Total attempts per S3 request, including the first
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Do not serve /metrics
    #[arg(long)]
    disable_metrics: bool,
}

/// Flag values layered over every other configuration source.
///
/// Unset flags are skipped so they do not mask lower layers.
#[derive(Debug, Default, Serialize)]
struct CliOverrides {
    server: ServerOverrides,
    storage: StorageOverrides,
}

#[derive(Debug, Default, Serialize)]
struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    listen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shutdown_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics_enabled: Option<bool>,
}

#[derive(Debug, Default, Serialize)]
struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    force_path_style: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
}

impl From<&Args> for CliOverrides {
    fn from(args: &Args) -> Self {
        Self {
            server: ServerOverrides {
                listen: args.listen.clone(),
                shutdown_timeout_secs: args.shutdown_timeout,
                metrics_enabled: args.disable_metrics.then_some(false),
            },
            storage: StorageOverrides {
                bucket: args.bucket.clone(),
                region: args.region.clone(),
                access_key_id: args.access_key_id.clone(),
                secret_access_key: args.secret_access_key.clone(),
                session_token: args.session_token.clone(),
                endpoint: args.endpoint.clone(),
                force_path_style: args.force_path_style.then_some(true),
                max_attempts: args.max_attempts,
            },
        }
    }
}

fn config_figment(args: &Args) -> Figment {
    AppConfig::figment(&args.config).merge(Serialized::defaults(CliOverrides::from(args)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration errors are reported before anything is bound.
    let config = AppConfig::from_figment(&config_figment(&args))
        .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("bazel-s3-cache v{}", env!("CARGO_PKG_VERSION"));
    if args.config.exists() {
        tracing::info!(config_path = %args.config.display(), "Loaded configuration file");
    } else {
        tracing::debug!(config_path = %args.config.display(), "No config file found");
    }

    let registry = Registry::new();
    let store = bazel_cache_storage::from_config(&config.storage, &registry)
        .await
        .context("failed to initialize storage")?;
    tracing::info!(
        backend = store.backend_name(),
        bucket = %config.storage.bucket,
        region = %config.storage.region,
        "Storage backend initialized"
    );

    let bind_addr = config.server.bind_addr();
    let drain_timeout = config.server.shutdown_timeout();
    let app = create_router(AppState::new(config, store, registry));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    tracing::info!("Listening on {}", bind_addr);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, draining in-flight requests");
            shutdown.cancel();
        }
    });

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    tokio::select! {
        result = server => result.context("server error")?,
        () = drain_deadline(&shutdown, drain_timeout) => {
            tracing::warn!(
                timeout_secs = drain_timeout.as_secs(),
                "Shutdown timeout elapsed, abandoning in-flight requests"
            );
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Completes `timeout` after shutdown has been requested.
async fn drain_deadline(shutdown: &CancellationToken, timeout: Duration) {
    shutdown.cancelled().await;
    tokio::time::sleep(timeout).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("bazel-s3-cache").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn flags_override_environment_and_file() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "cache.toml",
                r#"
                [server]
                listen = ":7000"

                [storage]
                bucket = "from-file"
                region = "eu-west-1"
                "#,
            )?;
            jail.set_env("AWS_S3_BUCKET", "from-env");

            let args = parse(&["-c", "cache.toml", "-b", "from-flag", "-l", ":9090"]);
            let config = AppConfig::from_figment(&config_figment(&args)).unwrap();

            assert_eq!(config.storage.bucket, "from-flag");
            assert_eq!(config.server.listen, ":9090");
            assert_eq!(config.storage.region, "eu-west-1");
            Ok(())
        });
    }

    #[test]
    fn unset_flags_do_not_mask_lower_layers() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("AWS_S3_BUCKET", "from-env");
            jail.set_env("BAZEL_CACHE_STORAGE__FORCE_PATH_STYLE", "true");

            let args = parse(&["-c", "missing.toml"]);
            let config = AppConfig::from_figment(&config_figment(&args)).unwrap();

            assert_eq!(config.storage.bucket, "from-env");
            assert!(config.storage.force_path_style);
            assert!(config.server.metrics_enabled);
            assert_eq!(config.server.listen, ":8080");
            Ok(())
        });
    }

    #[test]
    fn credential_and_tuning_flags() {
        Jail::expect_with(|jail| {
            jail.clear_env();

            let args = parse(&[
                "-c",
                "missing.toml",
                "-b",
                "bucket",
                "-r",
                "us-west-2",
                "-k",
                "AKIDEXAMPLE",
                "-s",
                "secret",
                "-t",
                "session",
                "--endpoint",
                "minio:9000",
                "--force-path-style",
                "--max-attempts",
                "5",
                "--shutdown-timeout",
                "10",
                "--disable-metrics",
            ]);
            let config = AppConfig::from_figment(&config_figment(&args)).unwrap();

            assert_eq!(config.storage.region, "us-west-2");
            assert_eq!(config.storage.access_key_id.as_deref(), Some("AKIDEXAMPLE"));
            assert_eq!(config.storage.secret_access_key.as_deref(), Some("secret"));
            assert_eq!(config.storage.session_token.as_deref(), Some("session"));
            assert_eq!(config.storage.endpoint.as_deref(), Some("minio:9000"));
            assert!(config.storage.force_path_style);
            assert_eq!(config.storage.max_attempts, 5);
            assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(10));
            assert!(!config.server.metrics_enabled);
            Ok(())
        });
    }

    #[test]
    fn missing_bucket_is_fatal() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let args = parse(&["-c", "missing.toml"]);
            let err = AppConfig::from_figment(&config_figment(&args)).unwrap_err();
            assert!(err.to_string().contains("s3 bucket for cache not set"));
            Ok(())
        });
    }
}
