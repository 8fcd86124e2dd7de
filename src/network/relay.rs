//! NAT Traversal Relay
//!
//! Connectionless UDP relay that forwards hole-punch packets between two
//! game clients. Each datagram opens with a fixed envelope naming the game,
//! the sender, the requested peer, and the sender's session token; the
//! relay validates the token against the player registry, remembers the
//! sender's last-known address, and forwards the datagram verbatim to the
//! peer's last-known address.
//!
//! No acknowledgment, no retry, no ordering. Unknown destinations and
//! unverifiable senders are silently dropped - UDP has no sender-visible
//! failure anyway.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, trace, warn};

use crate::lobby::game::{GameId, PlayerId};
use crate::lobby::games::GameRegistry;
use crate::lobby::players::PlayerRegistry;

/// Receive buffer size; comfortably above any traversal datagram.
const RECV_BUFFER: usize = 2048;

/// Bincode-encoded size of [`RelayEnvelope`].
pub const ENVELOPE_SIZE: usize = 20;

/// How often dead endpoints are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Fixed header at the start of every traversal datagram.
///
/// Encoded with bincode's fixed-width integer layout; whatever follows the
/// envelope is opaque payload and travels untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Game both peers belong to.
    pub game_id: GameId,
    /// Sender's session token from the `welcome` message.
    pub session: u64,
    /// Sender's player id.
    pub player_id: PlayerId,
    /// Player the packet should reach.
    pub peer_id: PlayerId,
}

/// Address-table key: one endpoint of one game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RelayKey {
    game_id: GameId,
    player_id: PlayerId,
}

/// Best-effort UDP relay for NAT hole punching.
pub struct NatRelay {
    socket: Arc<UdpSocket>,
    players: Arc<PlayerRegistry>,
    games: Arc<GameRegistry>,
    table: RwLock<BTreeMap<RelayKey, SocketAddr>>,
}

impl NatRelay {
    /// Bind the relay socket.
    pub async fn bind(
        addr: SocketAddr,
        players: Arc<PlayerRegistry>,
        games: Arc<GameRegistry>,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        info!("NAT relay listening on {}", socket.local_addr()?);
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            players,
            games,
            table: RwLock::new(BTreeMap::new()),
        }))
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive loop plus periodic endpoint pruning; runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut buffer = [0u8; RECV_BUFFER];
        let mut prune_timer = tokio::time::interval(PRUNE_INTERVAL);
        prune_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, src)) => self.relay(src, &buffer[..len]).await,
                        Err(e) => {
                            warn!("relay receive error: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
                _ = prune_timer.tick() => {
                    self.prune().await;
                }
                _ = shutdown.recv() => {
                    info!("NAT relay shutting down");
                    break;
                }
            }
        }
    }

    /// Handle one datagram: validate, record the sender, forward verbatim.
    pub async fn relay(&self, src: SocketAddr, datagram: &[u8]) {
        if datagram.len() < ENVELOPE_SIZE {
            trace!("runt datagram ({} bytes) from {}", datagram.len(), src);
            return;
        }

        // bincode reads exactly the envelope and ignores the payload bytes.
        let envelope: RelayEnvelope = match bincode::deserialize(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!("undecodable datagram from {}: {}", src, e);
                return;
            }
        };

        // Correlate with an authenticated TCP session; spoofed or stale
        // tokens are dropped without a reply.
        let verified = match self
            .players
            .find_by_address_and_session(src.ip(), envelope.session)
            .await
        {
            Some(player) => player.read().await.id == envelope.player_id,
            None => false,
        };
        if !verified {
            debug!(
                "unverified traversal packet from {} (player {}, session {})",
                src,
                envelope.player_id,
                hex::encode(envelope.session.to_be_bytes())
            );
            return;
        }

        // Track the sender's last-known address for return traffic.
        {
            let mut table = self.table.write().await;
            table.insert(
                RelayKey {
                    game_id: envelope.game_id,
                    player_id: envelope.player_id,
                },
                src,
            );
        }

        let dest = {
            let table = self.table.read().await;
            table
                .get(&RelayKey {
                    game_id: envelope.game_id,
                    player_id: envelope.peer_id,
                })
                .copied()
        };

        match dest {
            Some(dest) => {
                if let Err(e) = self.socket.send_to(datagram, dest).await {
                    debug!("relay forward to {} failed: {}", dest, e);
                }
            }
            // Peer has not punched yet: silent drop.
            None => trace!(
                "no endpoint for game {} player {}",
                envelope.game_id,
                envelope.peer_id
            ),
        }
    }

    /// Drop endpoints whose game no longer exists.
    pub async fn prune(&self) {
        let mut dead = Vec::new();
        {
            let table = self.table.read().await;
            for key in table.keys() {
                if self.games.find_by_id(key.game_id).await.is_none() {
                    dead.push(*key);
                }
            }
        }
        if dead.is_empty() {
            return;
        }

        let mut table = self.table.write().await;
        for key in &dead {
            table.remove(key);
        }
        debug!("pruned {} relay endpoints", dead.len());
    }

    /// Number of tracked endpoints, for diagnostics.
    pub async fn endpoint_count(&self) -> usize {
        self.table.read().await.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
