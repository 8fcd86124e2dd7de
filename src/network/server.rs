//! Lobby Server
//!
//! TCP accept loop and per-connection task wiring. Each accepted socket gets
//! a reader loop feeding a [`LobbySession`] and a writer task draining the
//! session's bounded outbound channel. Timer tasks drive the dirty-game
//! broadcast cycle, stale-game eviction, and ladder pairing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::core::rng::DeterministicRng;
use crate::lobby::games::GameRegistry;
use crate::lobby::matchmaker::{Matchmaker, LADDER_MODE};
use crate::lobby::player::CloseReason;
use crate::lobby::players::PlayerRegistry;
use crate::network::codec::{self, ProtocolError};
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::network::session::{LobbySession, SessionError, Services};
use crate::store::Datastore;
use crate::{DEFAULT_CONTROL_PORT, DEFAULT_GAME_PORT, DEFAULT_LOBBY_PORT};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Lobby TCP bind address.
    pub lobby_addr: SocketAddr,
    /// Game/NAT UDP bind address.
    pub game_addr: SocketAddr,
    /// Diagnostics bind address (loopback only).
    pub control_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// A session with no traffic for this long is closed.
    pub idle_timeout: Duration,
    /// Bound of each session's outbound queue.
    pub outbound_queue: usize,
    /// Cadence of the dirty-game broadcast cycle.
    pub broadcast_interval: Duration,
    /// Cadence of the stale-game sweep.
    pub eviction_interval: Duration,
    /// Cadence of ladder pairing.
    pub pairing_interval: Duration,
    /// Lobbies idle past this age are evicted.
    pub max_lobby_age: Duration,
    /// Seed for the matchmaker's RNG; logged so pairings can be replayed.
    pub ladder_seed: u64,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lobby_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LOBBY_PORT)),
            game_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_GAME_PORT)),
            control_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_CONTROL_PORT)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            outbound_queue: 64,
            broadcast_interval: Duration::from_secs(1),
            eviction_interval: Duration::from_secs(60),
            pairing_interval: Duration::from_secs(1),
            max_lobby_age: Duration::from_secs(30 * 60),
            ladder_seed: 0,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Config from environment variables, falling back to defaults.
    ///
    /// `LOBBY_BIND`, `GAME_BIND`, `CONTROL_BIND`, `LOBBY_MAX_CONNECTIONS`,
    /// `LOBBY_IDLE_TIMEOUT_SECS`, `LOBBY_MAX_AGE_SECS`, `LOBBY_LADDER_SEED`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok()?.parse().ok()
        }

        Self {
            lobby_addr: parse("LOBBY_BIND").unwrap_or(defaults.lobby_addr),
            game_addr: parse("GAME_BIND").unwrap_or(defaults.game_addr),
            control_addr: parse("CONTROL_BIND").unwrap_or(defaults.control_addr),
            max_connections: parse("LOBBY_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            idle_timeout: parse("LOBBY_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            max_lobby_age: parse("LOBBY_MAX_AGE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_lobby_age),
            ladder_seed: parse("LOBBY_LADDER_SEED").unwrap_or_else(fresh_seed),
            ..defaults
        }
    }
}

/// Entropy for the ladder seed when none is configured.
fn fresh_seed() -> u64 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

/// Lobby server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the lobby socket.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// The lobby server.
pub struct LobbyServer {
    config: ServerConfig,
    services: Services,
    shutdown_tx: broadcast::Sender<()>,
    connections: Arc<AtomicUsize>,
}

impl LobbyServer {
    /// Build the server and its service objects.
    ///
    /// Registries are constructed exactly once here and handed by reference
    /// to every session task.
    pub fn new(config: ServerConfig, store: Arc<dyn Datastore>) -> Self {
        let players = Arc::new(PlayerRegistry::new());
        let games = Arc::new(GameRegistry::new(config.max_lobby_age));
        let matchmaker = Arc::new(Matchmaker::with_rng(
            games.clone(),
            players.clone(),
            store.clone(),
            Box::new(DeterministicRng::new(config.ladder_seed)),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            services: Services {
                players,
                games,
                matchmaker,
                store,
            },
            shutdown_tx,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared service handles (for the relay and control endpoints).
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Bind the lobby listener with keep-alive enabled.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let socket = if self.config.lobby_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        socket.set_reuseaddr(true)?;
        socket.bind(self.config.lobby_addr)?;
        let listener = socket.listen(1024)?;
        Ok(listener)
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.register_default_containers().await;
        info!(
            "lobby server v{} listening on {}",
            self.config.version,
            listener.local_addr()?
        );
        info!("ladder seed: {}", self.config.ladder_seed);

        // Background timer tasks.
        let broadcast_handle = tokio::spawn(Self::run_broadcast_loop(
            self.services.clone(),
            self.config.broadcast_interval,
            self.shutdown_tx.subscribe(),
        ));
        let eviction_handle = tokio::spawn(Self::run_eviction_loop(
            self.services.clone(),
            self.config.eviction_interval,
            self.shutdown_tx.subscribe(),
        ));
        let pairing_handle = tokio::spawn(Self::run_pairing_loop(
            self.services.clone(),
            self.config.pairing_interval,
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::Relaxed) >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("new connection from {}", addr);
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let _ = broadcast_handle.await;
        let _ = eviction_handle.await;
        let _ = pairing_handle.await;
        Ok(())
    }

    /// Register the built-in game-mode containers.
    async fn register_default_containers(&self) {
        self.services
            .games
            .add_container("vanguard", "Vanguard Standard", true)
            .await;
        self.services
            .games
            .add_container(LADDER_MODE, "Ranked 1v1 Ladder", false)
            .await;
    }

    /// Spawn the task owning one connection.
    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let services = self.services.clone();
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let connections = self.connections.clone();

        tokio::spawn(async move {
            connections.fetch_add(1, Ordering::Relaxed);
            Self::drive_session(stream, addr, services, config, shutdown_rx).await;
            connections.fetch_sub(1, Ordering::Relaxed);
            debug!("connection {} cleaned up", addr);
        });
    }

    /// Read/dispatch loop for one connection. Any fault here terminates only
    /// this session; shared registries are consistent once `close` returns.
    async fn drive_session(
        stream: TcpStream,
        addr: SocketAddr,
        services: Services,
        config: ServerConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(config.outbound_queue);
        let (close_tx, mut close_rx) = mpsc::channel::<CloseReason>(4);

        // Writer task: drains the bounded queue onto the socket.
        let mut writer_task = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if codec::write_message(&mut write_half, &message).await.is_err() {
                    break;
                }
            }
        });

        let mut session = LobbySession::new(addr, services, out_tx.clone(), close_tx);

        loop {
            tokio::select! {
                result = timeout(
                    config.idle_timeout,
                    codec::read_message::<_, ClientMessage>(&mut reader),
                ) => {
                    match result {
                        Err(_) => {
                            debug!("session {} idle for {:?}", addr, config.idle_timeout);
                            session.close(CloseReason::IdleTimeout).await;
                            break;
                        }
                        Ok(Ok(message)) => {
                            match session.handle_message(message).await {
                                Ok(()) => {}
                                Err(SessionError::AuthRequired) => {
                                    // Notice already queued; command dropped.
                                    debug!("unauthenticated command from {}", addr);
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            if !e.is_clean_close() {
                                warn!("protocol error from {}: {}", addr, e);
                                if matches!(e, ProtocolError::Malformed(_)) {
                                    let _ = out_tx.try_send(ServerMessage::error(
                                        "Malformed command.",
                                    ));
                                }
                            }
                            session.close(CloseReason::Disconnected).await;
                            break;
                        }
                    }
                }
                reason = close_rx.recv() => {
                    session.close(reason.unwrap_or(CloseReason::Disconnected)).await;
                    break;
                }
                _ = shutdown_rx.recv() => {
                    let _ = out_tx.try_send(ServerMessage::info("Server shutting down."));
                    session.close(CloseReason::Shutdown).await;
                    break;
                }
            }
        }

        // Give the writer a moment to flush the final notice, then stop it.
        drop(session);
        drop(out_tx);
        if timeout(Duration::from_millis(250), &mut writer_task).await.is_err() {
            writer_task.abort();
        }
    }

    /// Dirty-game broadcast cycle.
    ///
    /// Drains the dirty set atomically, renders a snapshot of each game, and
    /// fans the updates out to every registered player. A game marked dirty
    /// while a cycle runs is picked up by the next one.
    async fn run_broadcast_loop(
        services: Services,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let dirty = services.games.drain_dirty();
                    if dirty.is_empty() {
                        continue;
                    }

                    let mut updates = Vec::with_capacity(dirty.len());
                    for id in dirty {
                        if let Some(game) = services.games.find_by_id(id).await {
                            updates.push(game.read().await.game_info());
                        }
                    }

                    for info in updates {
                        services
                            .players
                            .broadcast(&ServerMessage::GameInfo(info), |_| true)
                            .await;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Stale-game sweep.
    async fn run_eviction_loop(
        services: Services,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    services.games.evict_stale().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Ladder pairing step.
    async fn run_pairing_loop(
        services: Services,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    services.matchmaker.match_waiting_pairs().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Signal every task to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

// =============================================================================
// TESTS
// =============================================================================
