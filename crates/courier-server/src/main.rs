use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dc_core::paths::{keys_dir, server_store_path};
use dc_core::{tls, CourierServer, DirKeyFileStore, ServerConfig, ServerContext};
use dc_store::Store;

#[derive(Parser, Debug)]
#[command(author, version, about = "Darklock Courier relay server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept client connections until interrupted
    Run {
        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides `listen_addr`
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("courier_server=info,dc_core=info,dc_store=info")),
        )
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, listen, data_dir } => run_command(config, listen, data_dir).await,
    }
}

async fn run_command(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = ServerConfig::load(config_path.as_deref())?;
    if let Some(addr) = listen {
        config.listen_addr = addr;
    }
    if let Some(dir) = data_dir {
        config.data_dir = Some(dir);
    }

    let data = config.data_dir()?;
    std::fs::create_dir_all(&data).with_context(|| format!("creating {}", data.display()))?;
    let store = Arc::new(Store::open(&server_store_path(&data))?);
    let keys = Arc::new(DirKeyFileStore::new(keys_dir(&data)));
    let acceptor = tls::server_acceptor(&config.tls_cert, &config.tls_key)?;

    let ctx = Arc::new(ServerContext::new(store, keys, &config));
    let server = Arc::new(CourierServer::new(ctx, acceptor, config.timeouts.clone()));
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(data_dir = %data.display(), msg_cost = config.msg_cost, "server starting");

    let server_task = tokio::spawn(server.run(listener));
    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("server stopping");
        }
        res = server_task => {
            res??;
        }
    }
    Ok(())
}
