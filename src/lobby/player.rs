//! Player Entities
//!
//! One `Player` exists per authenticated connection. Its fields are only
//! mutated by the owning session's task; shared access goes through the
//! registry's `Arc<RwLock<Player>>` handles. The current-game reference is
//! an id looked up in the game registry, never an owning pointer.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::lobby::game::{GameId, PlayerId};
use crate::network::protocol::ServerMessage;

/// A skill estimate: mean and deviation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    /// Estimated skill.
    pub mean: f64,
    /// Uncertainty of the estimate.
    pub deviation: f64,
}

impl Rating {
    /// Build a rating.
    pub fn new(mean: f64, deviation: f64) -> Self {
        Self { mean, deviation }
    }
}

impl Default for Rating {
    fn default() -> Self {
        // Placement rating for fresh accounts.
        Self::new(1500.0, 500.0)
    }
}

/// Connection state of a player with respect to games.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlayerState {
    /// In the lobby, not attached to a game.
    #[default]
    Idle,
    /// Hosting a game lobby or playing in it.
    Hosting,
    /// Joined someone else's game.
    Joining,
}

impl PlayerState {
    /// Legal transition table: games are entered from idle and left to idle.
    pub fn can_transition(self, to: PlayerState) -> bool {
        use PlayerState::*;
        matches!(
            (self, to),
            (Idle, Hosting) | (Idle, Joining) | (Hosting, Idle) | (Joining, Idle)
        )
    }
}

/// Player-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlayerError {
    /// Rejected player state transition.
    #[error("illegal player state transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// State the player was in.
        from: PlayerState,
        /// Requested state.
        to: PlayerState,
    },
}

/// Why a session is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer went away.
    Disconnected,
    /// No traffic within the idle window.
    IdleTimeout,
    /// Displaced by a newer session for the same identity.
    Kicked,
    /// Client stopped draining its outbound queue.
    Backpressure,
    /// Server is shutting down.
    Shutdown,
}

/// One online player.
#[derive(Debug)]
pub struct Player {
    /// Datastore account id.
    pub id: PlayerId,
    /// Account login.
    pub login: String,
    /// Address of the TCP session.
    pub ip: IpAddr,
    /// UDP port the client's game process listens on.
    pub game_port: u16,
    /// Session token, echoed in UDP traversal packets.
    pub session: u64,
    /// Global (custom games) rating.
    pub global_rating: Rating,
    /// Ranked 1v1 ladder rating.
    pub ladder_rating: Rating,
    /// Game the player currently occupies, by id.
    pub current_game: Option<GameId>,
    state: PlayerState,
    sender: mpsc::Sender<ServerMessage>,
    close: mpsc::Sender<CloseReason>,
}

impl Player {
    /// Create a player for a freshly authenticated session.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PlayerId,
        login: &str,
        ip: IpAddr,
        game_port: u16,
        session: u64,
        global_rating: Rating,
        ladder_rating: Rating,
        sender: mpsc::Sender<ServerMessage>,
        close: mpsc::Sender<CloseReason>,
    ) -> Self {
        Self {
            id,
            login: login.to_string(),
            ip,
            game_port,
            session,
            global_rating,
            ladder_rating,
            current_game: None,
            state: PlayerState::Idle,
            sender,
            close,
        }
    }

    /// Current game-attachment state.
    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// Apply a state transition, rejecting illegal ones.
    pub fn transition(&mut self, to: PlayerState) -> Result<(), PlayerError> {
        if !self.state.can_transition(to) {
            return Err(PlayerError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Queue a message for this player's client without blocking.
    ///
    /// Returns false when the outbound queue is full or the session is gone;
    /// the caller decides whether that is a disconnect-worthy condition.
    pub fn try_send(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!("dropping message for {}: {}", self.login, e);
                false
            }
        }
    }

    /// Ask the owning session to close.
    pub fn request_close(&self, reason: CloseReason) {
        let _ = self.close.try_send(reason);
    }

    /// Endpoint the game process uses for peer traffic.
    pub fn game_address(&self) -> String {
        format!("{}:{}", self.ip, self.game_port)
    }
}

// =============================================================================
// TESTS
// =============================================================================
