//! SpanStore -- S3-compatible multi-backend data gateway server.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use spanstore::backends::client::BackendClient;
use spanstore::backends::file::FileBackend;
use spanstore::backends::memory::MemoryBackend;
use spanstore::gateway::MultiBackendGateway;
use spanstore::kms::NoopKms;
use spanstore::locations::LocationRegistry;
use spanstore::wrapper::{DataClient, DataWrapper};

/// Command-line arguments for the SpanStore server.
#[derive(Parser, Debug)]
#[command(
    name = "spanstore",
    version,
    about = "S3-compatible multi-backend data gateway"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "spanstore.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from {}", cli.config);
    let config = spanstore::config::load_config(&cli.config)?;

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        spanstore::metrics::init_metrics();
        spanstore::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // Location registry + gateway are built once at startup.
    let registry = Arc::new(LocationRegistry::from_config(&config).await?);
    let gateway = Arc::new(MultiBackendGateway::new(registry.clone()));

    // The data wrapper fronts the gateway in `multiple` mode, or one
    // pinned internal backend otherwise.
    let kms: Arc<dyn spanstore::kms::Kms> = Arc::new(NoopKms);
    let data_client = match config.backends.data.as_str() {
        "multiple" => DataClient::Multiple(gateway.clone()),
        "mem" => {
            let client: Arc<dyn BackendClient> = Arc::new(MemoryBackend::new("mem"));
            DataClient::Single(client)
        }
        "cdmi" => {
            anyhow::bail!("the cdmi data backend is recognised but not implemented");
        }
        _ => {
            let client: Arc<dyn BackendClient> = Arc::new(FileBackend::new(
                "file",
                config.backends.file_root.clone(),
            )?);
            DataClient::Single(client)
        }
    };
    let data = Arc::new(DataWrapper::new(data_client, kms.clone()));
    info!(
        "data backend mode: {} (default location {})",
        config.backends.data, config.backends.default_location
    );

    let metadata = Arc::new(spanstore::metadata::memory::MemoryMetadata::new());

    let state = Arc::new(spanstore::AppState {
        config: config.clone(),
        metadata,
        data,
        gateway,
        kms,
    });

    let app = spanstore::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("SpanStore listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("SpanStore shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT, then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
