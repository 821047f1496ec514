use hoard::StorageFactory;
use hoard::domain::StoreConfig;
use server_tcp::serve;
use shared::config::Config;
use storage_engine::UnifiedStorageFactory;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides; info otherwise
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load environment variables from .env file (if exists)
    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = Config::from_env();
    info!("Starting TCP server with {:?}", config);

    let store_config = StoreConfig::from_config("hoard", &config);
    let store = UnifiedStorageFactory::new().create_from_config(&store_config)?;

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("TCP Server listening on tcp://{}", listener.local_addr()?);

    tokio::select! {
        result = serve(listener, store) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
