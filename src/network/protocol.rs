//! Protocol Messages
//!
//! Wire vocabulary for the lobby connection. Every message is a string-keyed
//! mapping whose `command` field selects the variant; the closed enums below
//! replace any ad hoc dispatch on raw maps, so an unknown command is a decode
//! error rather than a silent fall-through.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lobby::game::{GameState, GameVisibility, PlayerId};

/// Default UDP port game clients listen on for peer traffic.
pub const DEFAULT_CLIENT_GAME_PORT: u16 = 6112;

fn default_game_port() -> u16 {
    DEFAULT_CLIENT_GAME_PORT
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Hello {
        /// Account login, case sensitive.
        login: String,
        /// Account password, case sensitive.
        password: String,
        /// Client build, for compatibility checks.
        version: String,
        /// Installation identifier.
        unique_id: String,
        /// UDP port the client's game process listens on.
        #[serde(default = "default_game_port")]
        game_port: u16,
    },

    /// Host a new game.
    GameHost {
        /// Lobby title shown in listings.
        title: String,
        /// Game mode to host under.
        featured_mod: String,
        /// Map to open the lobby on.
        mapname: String,
        /// Public or private.
        #[serde(default)]
        visibility: GameVisibility,
        /// Password for private games.
        #[serde(default)]
        password: Option<String>,
    },

    /// Join an open game.
    GameJoin {
        /// Target game id.
        uid: u32,
        /// Password, when the game is private.
        #[serde(default)]
        password: Option<String>,
    },

    /// Launch the hosted game (host only).
    GameStart,

    /// Leave the current game.
    GameLeave,

    /// Request the current list of open games.
    GameList,

    /// Enter or leave the ranked matchmaking queue.
    Matchmaking {
        /// Start or stop searching.
        action: MatchmakingAction,
    },

    /// Keep-alive / latency probe.
    Ping {
        /// Echoed back in the pong.
        #[serde(default)]
        timestamp: u64,
    },
}

/// Matchmaking queue actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchmakingAction {
    /// Join the queue.
    Start,
    /// Leave the queue.
    Stop,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Successful authentication.
    Welcome {
        /// Player id from the datastore.
        id: PlayerId,
        /// Confirmed login.
        login: String,
        /// Session token for UDP traversal correlation.
        session: u64,
    },

    /// User-visible notification.
    Notice {
        /// Rendering hint for the client.
        style: NoticeStyle,
        /// Message text shown verbatim.
        text: String,
    },

    /// Listing entry for one game.
    GameInfo(GameInfoMessage),

    /// Instruct the client to start its game process.
    GameLaunch {
        /// Game id.
        uid: u32,
        /// Map to load.
        mapname: String,
        /// Game mode.
        featured_mod: String,
        /// Host endpoint for joiners, `ip:port`.
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },

    /// Matchmaking queue status change.
    MatchmakingInfo {
        /// Current queue state for this player.
        state: MatchmakingState,
    },

    /// Reply to a ping.
    Pong {
        /// Timestamp echoed from the ping.
        timestamp: u64,
    },
}

/// Rendering style for a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeStyle {
    /// Failure the user must act on.
    Error,
    /// Non-fatal warning.
    Warning,
    /// Informational.
    Info,
}

/// Matchmaking states reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchmakingState {
    /// Queued and waiting for an opponent.
    Searching,
    /// No longer queued.
    Stopped,
}

/// One entry of the open-games listing.
///
/// Empty teams are omitted from `teams` and the map name is lowercased
/// before it reaches the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameInfoMessage {
    /// Game id.
    pub uid: u32,
    /// Lobby title.
    pub title: String,
    /// Lifecycle state.
    pub state: GameState,
    /// Game mode.
    pub featured_mod: String,
    /// Lowercased map name.
    pub mapname: String,
    /// Host login.
    pub host: String,
    /// Seated player count.
    pub num_players: usize,
    /// Coarse rule-set marker.
    pub game_type: u8,
    /// Launch time, present once the game went live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launched_at: Option<DateTime<Utc>>,
    /// Team label -> member ids; empty teams omitted.
    pub teams: BTreeMap<String, Vec<PlayerId>>,
}

impl ServerMessage {
    /// Build an error notice.
    pub fn error(text: impl Into<String>) -> Self {
        ServerMessage::Notice {
            style: NoticeStyle::Error,
            text: text.into(),
        }
    }

    /// Build an informational notice.
    pub fn info(text: impl Into<String>) -> Self {
        ServerMessage::Notice {
            style: NoticeStyle::Info,
            text: text.into(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
