//! Crosswire server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::SecretString;

use crosswire::backend::HttpBackend;
use crosswire::ingress;
use crosswire::manager::ChatOpsManager;
use crosswire::store::{MemoryStore, Store};

#[derive(Parser, Debug)]
#[command(name = "crosswire")]
#[command(about = "ChatOps ingestion and routing engine connecting chat platforms to backend agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the webhook ingress server.
    Serve {
        /// Address to bind.
        #[arg(long, env = "CROSSWIRE_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,

        /// PostgreSQL connection URL. Without it the in-memory store is
        /// used (development only; nothing survives a restart).
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,

        /// Base URL of the platform's internal API (agents, users,
        /// permissions, execution).
        #[arg(long, env = "CROSSWIRE_BACKEND_URL")]
        backend_url: String,

        /// Service token for the internal API.
        #[arg(long, env = "CROSSWIRE_BACKEND_TOKEN", hide_env_values = true)]
        backend_token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crosswire=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            bind,
            database_url,
            backend_url,
            backend_token,
        } => serve(bind, database_url, backend_url, backend_token).await,
    }
}

async fn serve(
    bind: SocketAddr,
    database_url: Option<String>,
    backend_url: String,
    backend_token: String,
) -> anyhow::Result<()> {
    let store = build_store(database_url).await?;
    let backend = Arc::new(HttpBackend::new(
        backend_url,
        SecretString::from(backend_token),
    ));
    let manager = Arc::new(ChatOpsManager::new(
        store,
        backend.clone(),
        backend.clone(),
        backend,
    ));

    manager
        .init_from_store()
        .await
        .context("provider initialization failed")?;
    manager.start().await;

    let app = ingress::router(manager.clone())
        .into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind to {bind}"))?;
    tracing::info!(%bind, "crosswire listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;

    manager.shutdown().await;
    Ok(())
}

#[cfg(feature = "postgres")]
async fn build_store(database_url: Option<String>) -> anyhow::Result<Arc<dyn Store>> {
    match database_url {
        Some(url) => {
            let store = crosswire::store::PgStore::connect(&url)?;
            store.migrate().await.context("migrations failed")?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_store(database_url: Option<String>) -> anyhow::Result<Arc<dyn Store>> {
    if database_url.is_some() {
        anyhow::bail!("DATABASE_URL set but the postgres feature is disabled");
    }
    tracing::warn!("postgres feature disabled; using the in-memory store");
    Ok(Arc::new(MemoryStore::new()))
}
