mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tenant_storage_core::{BoxError, CustomerInfo, FileStorageProvider, ProviderConfig, QuoteRecord};
use tenant_storage_registry::ProviderRegistry;
use tenant_storage_watch::{WatchOptions, Watcher};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let registry = ProviderRegistry::with_builtin();

    if matches!(config.command, Command::Providers) {
        let infos = registry
            .list_providers()
            .iter()
            .map(|name| registry.provider_info(name))
            .collect::<Result<Vec<_>, _>>()?;
        return print_json(&infos);
    }

    let provider = build_provider(&registry, &config).await?;
    provider
        .connect()
        .await
        .with_context(|| format!("Failed to connect {}", provider.provider_name()))?;

    let outcome = run(&provider, config.command).await;

    if let Err(e) = provider.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    outcome
}

async fn build_provider(
    registry: &ProviderRegistry,
    config: &Config,
) -> anyhow::Result<Arc<dyn FileStorageProvider>> {
    let name = config
        .provider
        .as_deref()
        .context("--provider (or TENANT_STORAGE_PROVIDER) is required")?;

    let provider_config = match &config.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            ProviderConfig::from_json_str(&raw)?
        }
        None => ProviderConfig::new(),
    };

    info!("Using {} provider", name);
    Ok(registry.create(name, provider_config)?)
}

async fn run(provider: &Arc<dyn FileStorageProvider>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Providers => Ok(()),
        Command::Health => {
            let report = provider.health_check().await;
            print_json(&report)?;
            if !report.healthy {
                anyhow::bail!("{}", report.message);
            }
            Ok(())
        }
        Command::Ls {
            path,
            pattern,
            recursive,
        } => {
            let path = path.unwrap_or_default();
            let files = provider
                .list_files(&path, pattern.as_deref(), recursive)
                .await?;
            print_json(&files)
        }
        Command::Cat { path } => {
            let data = provider.read_file(&path).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
            Ok(())
        }
        Command::Put {
            source,
            path,
            overwrite,
        } => {
            let data = tokio::fs::read(&source)
                .await
                .with_context(|| format!("Failed to read {}", source.display()))?;
            let result = provider.write_file(&path, &data, overwrite).await?;
            print_json(&result)?;
            if !result.success {
                anyhow::bail!("{}", result.message);
            }
            Ok(())
        }
        Command::UpdateQuote {
            tenant_id,
            quote_id,
            total,
            status,
            notes,
            customer_name,
            customer_email,
            customer_phone,
        } => {
            let quote = QuoteRecord {
                id: quote_id,
                created_at: Some(Utc::now()),
                total,
                status,
                notes,
            };
            let customer = CustomerInfo {
                name: customer_name,
                email: customer_email,
                phone: customer_phone,
            };
            let result = provider
                .update_quote_spreadsheet(&tenant_id, &quote, &customer)
                .await?;
            print_json(&result)?;
            if !result.success {
                anyhow::bail!("{}", result.message);
            }
            Ok(())
        }
        Command::Watch {
            path,
            interval,
            pattern,
            no_recursive,
        } => {
            let options = WatchOptions {
                path: path.unwrap_or_default(),
                interval: Duration::from_secs(interval.max(1)),
                recursive: !no_recursive,
                pattern,
            };
            watch(provider.clone(), options).await
        }
    }
}

/// Print change events as JSON lines until Ctrl+C or SIGTERM.
async fn watch(
    provider: Arc<dyn FileStorageProvider>,
    options: WatchOptions,
) -> anyhow::Result<()> {
    let watcher = Watcher::new(provider, options);
    watcher.subscribe_async(|event| async move {
        println!("{}", serde_json::to_string(&event)?);
        Ok::<(), BoxError>(())
    });

    // The provider is already connected by main
    watcher.start(false).await?;
    info!(
        "Watching {} every {:?}",
        watcher.options().path,
        watcher.options().interval
    );

    let mut shutdown_rx = create_shutdown_signal();
    let _ = shutdown_rx.wait_for(|&v| v).await;

    watcher.stop(false).await;
    info!("Watcher stopped");
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, stopping"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, stopping");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
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

        let _ = tx.send(true);
    });

    rx
}
