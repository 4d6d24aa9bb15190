//! Tessera Engine Server
//!
//! Serves the definition, run and execution API and drives flow executions.

use std::net::SocketAddr;
use std::sync::Arc;

use tessera_connectors::{ConnectionKind, Connector, ConnectorRegistry, MemoryConnector};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tessera_engine::{
    config::{DatabaseConfig, EngineConfig, MetadataBackend},
    db::{self, DbPool},
    engine::Engine,
    handlers,
    ledger::{MemoryLedger, PgLedger, RunLedger},
    metadata::{MemoryMetadataStore, MetadataStore, PgMetadataStore},
    model::Project,
    state::AppState,
};

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tessera_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

type Stores = (Arc<dyn MetadataStore>, Arc<dyn RunLedger>, Option<DbPool>);

async fn open_stores(config: &EngineConfig) -> anyhow::Result<Stores> {
    match config.metadata_backend {
        MetadataBackend::Memory => {
            let store = match &config.project_file {
                Some(path) => {
                    let project = Project::from_file(path).await?;
                    tracing::info!(
                        path = %path,
                        flows = project.flows.len(),
                        "Project definitions loaded"
                    );
                    MemoryMetadataStore::from_project(&project)
                }
                None => {
                    tracing::warn!("TESSERA_PROJECT_FILE not set, starting with no definitions");
                    MemoryMetadataStore::new()
                }
            };
            Ok((Arc::new(store), Arc::new(MemoryLedger::new()), None))
        }
        MetadataBackend::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let pool = db::connect(&db_config).await?;
            Ok((
                Arc::new(PgMetadataStore::new(pool.clone())),
                Arc::new(PgLedger::new(pool.clone())),
                Some(pool),
            ))
        }
    }
}

fn connector_registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::with_builtin();
    registry.register(ConnectionKind::Memory, |_| {
        Ok(Arc::new(MemoryConnector::new()) as Arc<dyn Connector>)
    });
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Tessera Engine");

    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load engine config, using defaults");
        EngineConfig::default()
    });

    tracing::info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        backend = ?config.metadata_backend,
        "Configuration loaded"
    );

    let (metadata, ledger, db) = open_stores(&config).await?;
    let engine = Arc::new(Engine::new(metadata, ledger, connector_registry(), &config));

    let recovered = engine.recover().await?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "Recovered interrupted executions");
    }

    let addr: SocketAddr = config.bind_address().parse()?;
    let app = handlers::router(AppState::new(engine, config, db));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
