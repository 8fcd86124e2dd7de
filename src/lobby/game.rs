//! Game Entities
//!
//! A `Game` is one hosted session: its metadata, lifecycle state, and team
//! assignment. Lifecycle is an explicit finite-state machine; illegal
//! transitions are errors, never silent no-ops. Only the hosting session
//! mutates a game's metadata.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::network::protocol::GameInfoMessage;

/// Server-wide unique game identifier.
pub type GameId = u32;

/// Player identifier as assigned by the datastore.
pub type PlayerId = u32;

/// Default slot capacity for a hosted game.
pub const DEFAULT_MAX_PLAYERS: usize = 12;

/// Lifecycle state of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    /// Lobby is open, players may join.
    #[serde(rename = "open")]
    LobbyOpen,
    /// Lobby closed to new joiners, not yet started.
    #[serde(rename = "closed")]
    LobbyClosed,
    /// Host launched the game; it is being played.
    #[serde(rename = "playing")]
    Live,
    /// Game over or abandoned; awaiting sweep.
    #[serde(rename = "ended")]
    Ended,
}

impl GameState {
    /// Legal transition table.
    pub fn can_transition(self, to: GameState) -> bool {
        use GameState::*;
        matches!(
            (self, to),
            (LobbyOpen, LobbyClosed)
                | (LobbyOpen, Live)
                | (LobbyOpen, Ended)
                | (LobbyClosed, Live)
                | (LobbyClosed, Ended)
                | (Live, Ended)
        )
    }
}

/// Who may see and join a game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameVisibility {
    /// Listed for everyone.
    #[default]
    Public,
    /// Joinable only with the password.
    Private,
}

/// Game-level failures surfaced to the requesting session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    /// No game with that id.
    #[error("game {0} does not exist")]
    NotFound(GameId),

    /// Game is not accepting joiners.
    #[error("game is not open for joining")]
    NotOpen,

    /// Private game, password mismatch.
    #[error("incorrect game password")]
    WrongPassword,

    /// All slots taken.
    #[error("game is full")]
    Full,

    /// Rejected lifecycle transition.
    #[error("illegal game state transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// State the game was in.
        from: GameState,
        /// Requested state.
        to: GameState,
    },

    /// No container registered for the requested mode.
    #[error("unknown game mode {0:?}")]
    UnknownMode(String),
}

/// One hosted game session.
#[derive(Debug)]
pub struct Game {
    /// Server-wide unique id.
    pub id: GameId,
    /// Stable identifier for datastore records.
    pub uuid: Uuid,
    /// Human-readable title.
    pub title: String,
    /// Hosting player.
    pub host_id: PlayerId,
    /// Host login, for listings.
    pub host_login: String,
    /// Game mode (container key).
    pub featured_mod: String,
    /// Current map.
    pub mapname: String,
    /// Public or private.
    pub visibility: GameVisibility,
    /// Shown in listings when true.
    pub listable: bool,
    /// Coarse rule-set marker forwarded to clients.
    pub game_type: u8,
    /// Slot capacity.
    pub max_players: usize,
    /// Set when the game goes live.
    pub launched_at: Option<DateTime<Utc>>,
    password: Option<String>,
    state: GameState,
    /// Team label -> ordered member ids. The host is always a member.
    teams: BTreeMap<String, Vec<PlayerId>>,
    created_at: Instant,
    last_activity: Instant,
}

impl Game {
    /// Create a game in `LobbyOpen` with the host seated on team "1".
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: GameId,
        host_id: PlayerId,
        host_login: &str,
        title: &str,
        featured_mod: &str,
        mapname: &str,
        visibility: GameVisibility,
        password: Option<String>,
        listable: bool,
    ) -> Self {
        let mut teams = BTreeMap::new();
        teams.insert("1".to_string(), vec![host_id]);
        teams.insert("2".to_string(), Vec::new());

        let now = Instant::now();
        Self {
            id,
            uuid: Uuid::new_v4(),
            title: title.to_string(),
            host_id,
            host_login: host_login.to_string(),
            featured_mod: featured_mod.to_string(),
            mapname: mapname.to_string(),
            visibility,
            listable,
            game_type: 0,
            max_players: DEFAULT_MAX_PLAYERS,
            launched_at: None,
            password,
            state: GameState::LobbyOpen,
            teams,
            created_at: now,
            last_activity: now,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GameState {
        self.state
    }

    /// Apply a lifecycle transition, rejecting illegal ones.
    pub fn transition(&mut self, to: GameState) -> Result<(), GameError> {
        if !self.state.can_transition(to) {
            return Err(GameError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        if to == GameState::Live {
            self.launched_at = Some(Utc::now());
        }
        self.state = to;
        self.touch();
        Ok(())
    }

    /// Validate a join attempt without mutating anything.
    pub fn check_join(&self, password: Option<&str>) -> Result<(), GameError> {
        if self.state != GameState::LobbyOpen {
            return Err(GameError::NotOpen);
        }
        if self.num_players() >= self.max_players {
            return Err(GameError::Full);
        }
        if self.visibility == GameVisibility::Private && !self.password_matches(password) {
            return Err(GameError::WrongPassword);
        }
        Ok(())
    }

    /// Seat a player on the team with the fewest members.
    ///
    /// Callers validate with [`Game::check_join`] first; this re-checks so a
    /// race can never overfill the game.
    pub fn add_player(&mut self, player_id: PlayerId, password: Option<&str>) -> Result<(), GameError> {
        self.check_join(password)?;
        if self.contains(player_id) {
            return Ok(());
        }

        let team = self
            .teams
            .iter()
            .min_by_key(|(label, members)| (members.len(), label.as_str().to_string()))
            .map(|(label, _)| label.clone())
            .unwrap_or_else(|| "1".to_string());
        self.teams.entry(team).or_default().push(player_id);
        self.touch();
        Ok(())
    }

    /// Remove a player from the team assignment. Returns whether they were
    /// a member. Removing the host is the caller's cue to end the game.
    pub fn remove_player(&mut self, player_id: PlayerId) -> bool {
        let mut removed = false;
        for members in self.teams.values_mut() {
            let before = members.len();
            members.retain(|&id| id != player_id);
            removed |= members.len() != before;
        }
        if removed {
            self.touch();
        }
        removed
    }

    /// Whether the player is seated in any team.
    pub fn contains(&self, player_id: PlayerId) -> bool {
        self.teams.values().any(|members| members.contains(&player_id))
    }

    /// Whether the player hosts this game.
    pub fn is_host(&self, player_id: PlayerId) -> bool {
        self.host_id == player_id
    }

    /// Total seated players.
    pub fn num_players(&self) -> usize {
        self.teams.values().map(Vec::len).sum()
    }

    /// Full team assignment, empty teams included.
    pub fn teams(&self) -> &BTreeMap<String, Vec<PlayerId>> {
        &self.teams
    }

    /// Whether the supplied password grants entry.
    pub fn password_matches(&self, supplied: Option<&str>) -> bool {
        match (&self.password, supplied) {
            (None, _) => true,
            (Some(expected), Some(given)) => expected == given,
            (Some(_), None) => false,
        }
    }

    /// Time since creation.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last membership or lifecycle change.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Render the listing entry for this game.
    ///
    /// Map names are lowercased on the wire and teams with no members are
    /// omitted entirely.
    pub fn game_info(&self) -> GameInfoMessage {
        let teams = self
            .teams
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(label, members)| (label.clone(), members.clone()))
            .collect();

        GameInfoMessage {
            uid: self.id,
            title: self.title.clone(),
            state: self.state,
            featured_mod: self.featured_mod.clone(),
            mapname: self.mapname.to_lowercase(),
            host: self.host_login.clone(),
            num_players: self.num_players(),
            game_type: self.game_type,
            launched_at: self.launched_at,
            teams,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
