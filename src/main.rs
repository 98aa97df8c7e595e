use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use covey::backend::RedisBackend;
use covey::{api, cli, QuotaPeer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "covey=debug,tower_http=debug".into());
    if settings.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Socket server listen address setup
    let listen_address: IpAddr = settings
        .listen_address
        .parse::<IpAddr>()
        .with_context(|| format!("Invalid ip address: {}", settings.listen_address))?;
    let socket_address = SocketAddr::from((listen_address, settings.listen_port));

    let quota = settings.quota()?;
    let peer_settings = settings.peer_settings();
    let backend = Arc::new(RedisBackend::connect(&settings.redis_url).await?);

    info!(
        "Joining channel '{}' with group quota {}",
        settings.channel, quota
    );
    let peer = timeout(
        settings.join_timeout(),
        QuotaPeer::join_with_settings(quota, &settings.channel, backend, peer_settings),
    )
    .await
    .with_context(|| {
        format!(
            "Group did not acknowledge join within {:?}",
            settings.join_timeout()
        )
    })??;
    let peer = Arc::new(peer);

    // Start server
    info!("Starting Covey on {}", socket_address);
    axum::Server::bind(&socket_address)
        .serve(api::api(Arc::clone(&peer)).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = peer.unregister().await {
        warn!("Failed to leave channel '{}' cleanly: {}", settings.channel, e);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
