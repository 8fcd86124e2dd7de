//! Vanguard Lobby Server
//!
//! Process bootstrap: logging, configuration, datastore, listeners, and
//! graceful shutdown. Exits 0 on a signal-triggered shutdown and non-zero
//! when the datastore fails to open.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vanguard_lobby::network::control::run_control_server;
use vanguard_lobby::network::relay::NatRelay;
use vanguard_lobby::network::server::{LobbyServer, ServerConfig};
use vanguard_lobby::store::MemoryStore;
use vanguard_lobby::VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Vanguard Lobby Server v{}", VERSION);

    let config = ServerConfig::from_env();

    // The accounts file is the datastore for this build; failing to open it
    // is fatal.
    let store = match std::env::var("LOBBY_ACCOUNTS_FILE").ok().map(PathBuf::from) {
        Some(path) => match MemoryStore::from_file(&path) {
            Ok(store) => {
                info!("loaded {} accounts from {}", store.account_count(), path.display());
                store
            }
            Err(e) => {
                error!("failed to open datastore: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("LOBBY_ACCOUNTS_FILE not set, starting with an empty account table");
            MemoryStore::new()
        }
    };
    let store = Arc::new(store);

    let server = Arc::new(LobbyServer::new(config.clone(), store));

    // UDP traversal relay.
    let relay = NatRelay::bind(
        config.game_addr,
        server.services().players.clone(),
        server.services().games.clone(),
    )
    .await
    .context("failed to bind NAT relay")?;
    tokio::spawn(relay.run(server.subscribe_shutdown()));

    // Loopback diagnostics.
    let control = tokio::spawn(run_control_server(
        config.control_addr,
        server.services().clone(),
        server.subscribe_shutdown(),
    ));

    // Lobby TCP listener; a bind failure is fatal at startup.
    let listener = server.bind().context("failed to bind lobby listener")?;
    let lobby = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    // Make sure we can shut down gracefully
    shutdown_signal().await;
    info!("received signal, shutting down");
    server.shutdown();

    lobby.await?.context("lobby server failed")?;
    control.await?.context("control server failed")?;

    info!("goodbye");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
