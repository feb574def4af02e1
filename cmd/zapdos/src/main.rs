//! zapdos - job-distribution gateway between capture tenants and inference
//! workers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zapdos_gateway::rest::{self, RestState};
use zapdos_gateway::{
    FsBlobStore, Gateway, GatewayConfig, HmacAuthenticator, MemoryStore, Services, WriteQueue,
    server,
};

#[derive(Parser)]
#[command(name = "zapdos")]
#[command(about = "Job-distribution gateway server")]
#[command(version)]
struct Cli {
    /// Verbose output (debug level unless RUST_LOG is set)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket and REST listeners
    Serve {
        /// Config file (YAML or JSON)
        #[arg(short = 'c', long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve { config } => serve(config).await,
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(path: PathBuf) -> Result<()> {
    let config = GatewayConfig::load(&path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let store = Arc::new(MemoryStore::new());
    let (writes, writer) =
        WriteQueue::spawn(store.clone(), config.write_queue.policy(), cancel.clone());
    let auth = Arc::new(HmacAuthenticator::new(&config.token_secret));
    let blobs = Arc::new(
        FsBlobStore::open(&config.files_dir)
            .await
            .with_context(|| format!("failed to open {}", config.files_dir.display()))?,
    );

    let gateway = Gateway::new(
        config.clone(),
        Services {
            auth: auth.clone(),
            blobs: blobs.clone(),
            writes,
        },
        cancel.clone(),
    );
    let handle = gateway.handle();
    let event_loop = tokio::spawn(gateway.run());

    let ws_listener = TcpListener::bind(&config.ws_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.ws_addr))?;
    let http_listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    let app = rest::router(RestState {
        config: config.clone(),
        gateway: handle.clone(),
        store,
        blobs,
        auth,
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {}", e);
                return;
            }
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    // Either listener stopping takes the whole process down.
    let (ws, http) = tokio::join!(
        async {
            let result = server::serve(ws_listener, handle, cancel.clone()).await;
            cancel.cancel();
            result
        },
        async {
            let result = rest::serve(http_listener, app, cancel.clone()).await;
            cancel.cancel();
            result
        },
    );

    let _ = event_loop.await;
    let _ = writer.await;
    ws?;
    http?;
    info!("stopped");
    Ok(())
}
