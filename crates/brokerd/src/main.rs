//! brokerd: the service broker daemon.
//!
//! # Usage
//!
//! ```text
//! brokerd --config /etc/brokerd/brokerd.toml run
//! brokerd --config brokerd.toml catalog
//! ```

mod app;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use broker_core::BrokerdConfig;

use crate::app::App;

#[derive(Parser)]
#[command(name = "brokerd", about = "Service broker daemon")]
struct Cli {
    /// Path to the daemon config file.
    #[arg(long, global = true, default_value = "/etc/brokerd/brokerd.toml")]
    config: PathBuf,

    /// Override `store.path` from the config file.
    #[arg(long, global = true)]
    store_path: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Recover jobs, bootstrap the catalog and keep it refreshed until Ctrl-C.
    Run,
    /// Run one recovery pass and exit.
    Recover,
    /// Reload the catalog from the configured registries and exit.
    Bootstrap,
    /// Print the stored catalog as JSON.
    Catalog,
    /// Print the effective configuration as TOML.
    Config,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,brokerd=debug,broker=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<BrokerdConfig> {
    if path.exists() {
        let config = BrokerdConfig::from_file(path)?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Ok(BrokerdConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = load_config(&cli.config)?;
    if let Some(path) = cli.store_path {
        config.store.path = path;
    }

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Run => run(config).await,
        Command::Recover => {
            let app = App::build(config).await?;
            let report = app.recover_and_wait().await?;
            info!(?report, "recovery pass finished");
            Ok(())
        }
        Command::Bootstrap => {
            let app = App::build(config).await?;
            let response = app.broker.bootstrap().await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Command::Catalog => {
            let app = App::build(config).await?;
            let catalog = app.broker.catalog().await?;
            println!("{}", serde_json::to_string_pretty(&catalog)?);
            Ok(())
        }
    }
}

async fn run(config: BrokerdConfig) -> anyhow::Result<()> {
    info!("broker daemon starting");

    let app = App::build(config).await?;
    app.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    app.refresh_loop(shutdown_rx).await;

    info!("broker daemon stopped");
    Ok(())
}
