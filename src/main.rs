use anyhow::Result;
use geotracker_hub::config::Config;
use geotracker_hub::hub::TrackingHub;
use geotracker_hub::store::Store;
use geotracker_hub::{server, sweeper};

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,geotracker_hub=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    // Pool failure degrades to memory-only ingest; a reachable database with
    // a broken schema bootstrap is fatal.
    let store = match Store::connect(&config).await {
        Ok(store) => {
            store.ensure_schema().await?;
            Some(store)
        }
        Err(err) => {
            tracing::error!(error = %err, "database initialization failed");
            tracing::info!("continuing without database; data will be stored in memory only");
            None
        }
    };

    let hub = TrackingHub::new(store.clone(), config.retention());
    hub.load_history().await;

    let sweeper_handle = if config.enable_automatic_cleanup {
        tracing::info!(
            interval_seconds = config.cleanup_interval_seconds,
            retention_hours = config.data_retention_hours,
            "starting retention sweeper"
        );
        Some(sweeper::spawn(hub.clone(), config.cleanup_interval()))
    } else {
        tracing::info!("automatic memory cleanup disabled");
        None
    };

    let port = config.websocket_port;
    let server_hub = hub.clone();
    let server_handle = tokio::spawn(async move { server::serve(port, server_hub).await });

    tokio::select! {
        res = server_handle => {
            match res {
                Ok(Ok(())) => tracing::info!("server task finished"),
                Ok(Err(err)) => tracing::error!(error = %err, "server task failed"),
                Err(err) => tracing::error!(error = %err, "server task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(handle) = sweeper_handle {
        handle.abort();
    }
    if let Some(store) = store {
        store.close().await;
    }

    Ok(())
}
