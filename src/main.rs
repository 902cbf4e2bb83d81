//! Idol Relay Server
//!
//! Runs the DNS redirector, the TLS gateway and the internal RPC server in
//! one process until Ctrl-C or until any of them stops.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use idol_relay::{
    session::{register_login, UserRecord},
    AppConfig, DnsRedirector, MemoryStore, RpcDispatcher, RpcServer, SessionResetEngine, TlsGateway,
    VERSION,
};

/// Vitality cap of the seeded user.
const SEED_VITALITY_MAX: u32 = 60;
/// Seconds per vitality point for the seeded user.
const SEED_RECOVER_INTERVAL_SECS: u32 = 300;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Idol Relay v{}", VERSION);

    let config = AppConfig::from_env().context("invalid configuration")?;
    info!("Server clock offset: {}", config.clock.offset());

    // Game state
    let store = MemoryStore::new(config.catalog.iter().copied());
    let player = UserRecord::starter(
        &config.catalog,
        config.reset.daily_song_mission,
        SEED_VITALITY_MAX,
        SEED_RECOVER_INTERVAL_SECS,
        Utc::now(),
    );
    store.insert_user(config.seed_user, player).await;
    info!(
        "Seeded user {} with {} songs",
        config.seed_user,
        config.catalog.len()
    );
    if config.catalog.is_empty() {
        warn!("SONG_CATALOG is empty; no daily challenge song can be chosen");
    }

    let engine = Arc::new(SessionResetEngine::new(
        Arc::new(store),
        config.reset.clone(),
        config.clock,
    ));
    let mut dispatcher = RpcDispatcher::new();
    register_login(&mut dispatcher, engine);

    // Listeners
    let rpc = Arc::new(
        RpcServer::bind(config.rpc.clone(), dispatcher)
            .await
            .context("binding RPC server")?,
    );
    let gateway = Arc::new(
        TlsGateway::from_config(config.gateway.clone())
            .await
            .context("starting TLS gateway")?,
    );
    let dns = Arc::new(DnsRedirector::bind(config.dns.clone()).await.context("binding DNS redirector")?);

    if config.dns.overrides.is_empty() {
        warn!("DNS_INTERCEPT_HOSTS is empty; every query will be forwarded upstream");
    }

    let mut tasks = JoinSet::new();
    {
        let rpc = rpc.clone();
        tasks.spawn(async move { rpc.run().await.context("RPC server") });
    }
    {
        let gateway = gateway.clone();
        tasks.spawn(async move { gateway.run().await.context("TLS gateway") });
    }
    {
        let dns = dns.clone();
        tasks.spawn(async move { dns.run().await.context("DNS redirector") });
    }

    let mut failure = None;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
        }
        Some(joined) = tasks.join_next() => {
            match joined {
                Ok(Ok(())) => warn!("A listener stopped unexpectedly"),
                Ok(Err(e)) => {
                    error!("{:#}", e);
                    failure = Some(e);
                }
                Err(e) => error!("Listener task failed: {}", e),
            }
        }
    }

    rpc.shutdown();
    gateway.shutdown();
    dns.shutdown();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{:#}", e),
            Err(e) => error!("Listener task failed: {}", e),
        }
    }

    info!("Stopped");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
