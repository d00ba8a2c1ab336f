use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use keylatch::config;
use keylatch::coordination::{self, LockToken, StoreHandle, StoreRegistry, StoredValue};
use keylatch::health;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "keylatch", about = "Inspect and drive KeyDB-backed locks and semaphores")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/keylatch/config.yaml")]
    config: String,

    /// Logical store name to operate on.
    #[arg(short, long, default_value = "default")]
    store: String,

    /// Print Prometheus metrics after the command finishes.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// PING every configured store and print a JSON report.
    Health,
    /// Print the value currently stored at a key.
    Get { key: String },
    /// Claim a semaphore; exits non-zero if it is already claimed.
    Claim {
        key: String,
        #[arg(long, default_value_t = 60_000)]
        ttl_ms: u64,
    },
    /// Delete a semaphore.
    Unclaim { key: String },
    /// Wait for a lock and print its ownership token.
    Acquire {
        key: String,
        #[arg(long, default_value_t = 60_000)]
        ttl_ms: u64,
        /// Give up after this many seconds (overrides the config file).
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Release a lock held under `token`.
    Release { key: String, token: String },
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn open(registry: &StoreRegistry, name: &str) -> Result<StoreHandle> {
    registry
        .get_interface(name)
        .await
        .with_context(|| format!("failed to open store '{name}'"))
}

async fn run(cli: &Cli, registry: &StoreRegistry) -> Result<bool> {
    match &cli.command {
        Command::Health => {
            let report = health::check_stores(registry).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.status != health::HealthStatus::Unhealthy)
        }
        Command::Get { key } => {
            let handle = open(registry, &cli.store).await?;
            match handle.get_value(key).await? {
                Some(StoredValue::Text(text)) => println!("{text}"),
                Some(StoredValue::Binary(bytes)) => println!("{bytes:?}"),
                None => println!("(nil)"),
            }
            Ok(true)
        }
        Command::Claim { key, ttl_ms } => {
            let handle = open(registry, &cli.store).await?;
            let acquired = coordination::create_semaphore(
                &handle,
                key,
                Duration::from_millis(*ttl_ms),
                registry.semaphore_mode(),
            )
            .await?;
            println!("{acquired}");
            Ok(acquired)
        }
        Command::Unclaim { key } => {
            let handle = open(registry, &cli.store).await?;
            coordination::delete_semaphore(&handle, key).await?;
            Ok(true)
        }
        Command::Acquire {
            key,
            ttl_ms,
            timeout_secs,
        } => {
            let handle = open(registry, &cli.store).await?;
            let cancel = CancellationToken::new();
            let mut options = registry.acquire_options().cancel_on(cancel.clone());
            if let Some(secs) = timeout_secs {
                options = options.timeout(Duration::from_secs(*secs));
            }

            let watcher = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    shutdown_signal().await;
                    cancel.cancel();
                }
            });

            let result = coordination::acquire_lock_with(
                &handle,
                key,
                Duration::from_millis(*ttl_ms),
                &options,
            )
            .await;
            watcher.abort();

            let token = result.with_context(|| format!("failed to acquire lock '{key}'"))?;
            println!("{token}");
            Ok(true)
        }
        Command::Release { key, token } => {
            let handle = open(registry, &cli.store).await?;
            let token = LockToken::from(token.clone());
            let released = coordination::release_lock(&handle, key, &token).await?;
            println!("{released}");
            Ok(released)
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    // Logs go to stderr so command output on stdout stays scriptable.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    tracing::debug!(config_path = %cli.config, stores = config.stores.len(), "config loaded");

    let registry = StoreRegistry::from_config(&config);
    let outcome = run(&cli, &registry).await;

    if cli.metrics {
        print!("{}", registry.metrics().encode());
    }
    registry.close().await;

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}
