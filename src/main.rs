use std::sync::Arc;

use marketdata_hub::broker::Broker;
use marketdata_hub::config::AppConfig;
use marketdata_hub::hub::Hub;
use marketdata_hub::ingestion;
use marketdata_hub::query::{self, AppState};
use marketdata_hub::store::PgStore;
use marketdata_hub::upstream::UpstreamClient;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "fatal configuration error");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "marketdata-hub exited with an error");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        symbols = ?config.symbols,
        bind = %config.bind_addr,
        "starting marketdata-hub"
    );

    let store = Arc::new(PgStore::connect(&config.store).await?);
    let broker = Arc::new(Broker::connect(&config.broker).await?);
    let upstream = Arc::new(UpstreamClient::new(
        config.upstream_base_url.clone(),
        config.retry.clone(),
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let ingestion_handles = ingestion::spawn_all(&config, upstream, store.clone(), broker.clone(), &shutdown_tx);
    let (hub, hub_handle) = Hub::spawn(broker, shutdown_tx.subscribe());

    let app = query::router(AppState { store, hub: hub.clone() }).merge(hub.router());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(bind = %config.bind_addr, "listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        })
        .await?;

    for handle in ingestion_handles {
        let _ = handle.await;
    }
    let _ = hub_handle.await;

    tracing::info!("marketdata-hub stopped");
    Ok(())
}
