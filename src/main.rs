use std::sync::Arc;

use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use keydesk::config::Config;
use keydesk::gateway::DarajaClient;
use keydesk::notify::Notifier;
use keydesk::ratelimit::RateLimiter;
use keydesk::store::{LicenseStore, MemoryStore, PaymentStore, SqliteStore};
use keydesk::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "keydesk", about = "License activation and payment verification server")]
struct Args {
    /// Address to bind (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Path to the sqlite database (overrides DATABASE_PATH)
    #[arg(long)]
    database: Option<String>,

    /// Run on the non-durable in-memory store with the demo license seeded
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keydesk=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if args.memory_store {
        config.memory_store = true;
    }

    let (licenses, payments, degraded): (Arc<dyn LicenseStore>, Arc<dyn PaymentStore>, bool) =
        if config.memory_store {
            tracing::info!("using in-memory store (requested); data will not survive a restart");
            let store = Arc::new(MemoryStore::seeded());
            (store.clone(), store, true)
        } else {
            match SqliteStore::open(&config.database_path) {
                Ok(store) => {
                    tracing::info!(path = %config.database_path, "sqlite store ready");
                    let store = Arc::new(store);
                    (store.clone(), store, false)
                }
                Err(e) => {
                    tracing::warn!(
                        path = %config.database_path,
                        "sqlite unavailable ({e}); falling back to non-durable in-memory store"
                    );
                    let store = Arc::new(MemoryStore::seeded());
                    (store.clone(), store, true)
                }
            }
        };

    if config.admin_api_key.is_none() {
        tracing::warn!("ADMIN_API_KEY is not set; admin endpoints will reject all requests");
    }

    let gateway = match config.mpesa.clone() {
        Some(mpesa) => {
            tracing::info!(environment = %mpesa.environment, "M-Pesa gateway configured");
            Some(Arc::new(DarajaClient::new(mpesa)))
        }
        None => {
            tracing::info!("M-Pesa gateway not configured; push endpoints disabled");
            None
        }
    };

    let state = AppState {
        licenses,
        payments,
        limiter: Arc::new(RateLimiter::new()),
        notifier: Arc::new(Notifier::from_config(config.notify_webhook_url.clone())),
        gateway,
        admin_api_key: config.admin_api_key.clone(),
        base_url: config.base_url.clone(),
        degraded,
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.addr();
    tracing::info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
