//! Tenant stack server: signup webhook, tenant API and the provisioning
//! pipeline behind them.

use std::net::SocketAddr;

use clap::Parser;
use tenantstack::bootstrap::{self, LogTarget};
use tenantstack::config::{BackendConfig, ProvisionerConfig};
use tenantstack::events::EventSink;
use tenantstack::routes::{self, AppState};

#[derive(Parser)]
#[command(name = "tenantstack-server", about = "Tenant infrastructure provisioning service")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "TS_PORT", default_value = "9090")]
    port: u16,

    /// PostgreSQL connection URL for deployment records
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Use the in-memory simulated cloud even if a gateway is configured
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap::init_tracing(LogTarget::Stdout);

    let cli = Cli::parse();
    tracing::info!("Starting tenantstack server...");

    let config = ProvisionerConfig::from_env();
    let mut backend = BackendConfig::from_env();
    if cli.database_url.is_some() {
        backend.database_url = cli.database_url;
    }

    let cloud = bootstrap::cloud_provider(&backend, &config, cli.simulate)?;
    let store = bootstrap::deployment_store(&backend).await?;
    tracing::info!(
        base_domain = %config.base_domain,
        max_concurrent = config.max_concurrent_provisions,
        ssl_bypass = config.ssl_bypass,
        "provisioning configured"
    );
    let service = bootstrap::provisioning_service(config, &cloud, store, EventSink::logging());

    let app = routes::router(AppState {
        service,
        webhook_secret: backend.webhook_secret,
    });

    // Initialize metrics
    tenantstack::metrics::init_metrics();

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("tenantstack server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
