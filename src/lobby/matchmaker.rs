//! Ranked Matchmaking
//!
//! Queue and pairing for the 1v1 ladder. The map pool for a pairing always
//! contains the server-curated popular pool plus a personalization
//! contribution from one or both players, chosen by a uniform three-way
//! draw; a player without pre-selected maps still always gets a pool.
//!
//! All randomness goes through the injected [`Draw`] source so both the
//! branch and the final map pick are deterministic under a seed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::core::rng::{DeterministicRng, Draw};
use crate::lobby::game::{GameError, GameId, GameState, PlayerId, GameVisibility};
use crate::lobby::games::GameRegistry;
use crate::lobby::players::PlayerRegistry;
use crate::lobby::player::PlayerState;
use crate::network::protocol::ServerMessage;
use crate::store::{Datastore, StoreError};

/// Mode key of the ladder container.
pub const LADDER_MODE: &str = "ladder1v1";

/// Matchmaking failures.
#[derive(Debug, thiserror::Error)]
pub enum MatchmakerError {
    /// Map tables could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Game creation failed.
    #[error(transparent)]
    Game(#[from] GameError),

    /// A paired player is gone or no longer idle.
    #[error("player {0} is not available for pairing")]
    PlayerUnavailable(PlayerId),

    /// No maps to choose from (empty popular pool and selections).
    #[error("map pool is empty")]
    EmptyPool,
}

/// Ladder queue and pairing engine.
pub struct Matchmaker {
    games: Arc<GameRegistry>,
    players: Arc<PlayerRegistry>,
    store: Arc<dyn Datastore>,
    rng: Mutex<Box<dyn Draw>>,
    queue: Mutex<Vec<PlayerId>>,
}

impl Matchmaker {
    /// Matchmaker with a seeded RNG.
    pub fn new(
        games: Arc<GameRegistry>,
        players: Arc<PlayerRegistry>,
        store: Arc<dyn Datastore>,
        seed: u64,
    ) -> Self {
        Self::with_rng(games, players, store, Box::new(DeterministicRng::new(seed)))
    }

    /// Matchmaker with an explicit draw source (tests force branches here).
    pub fn with_rng(
        games: Arc<GameRegistry>,
        players: Arc<PlayerRegistry>,
        store: Arc<dyn Datastore>,
        rng: Box<dyn Draw>,
    ) -> Self {
        Self {
            games,
            players,
            store,
            rng: Mutex::new(rng),
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Add a player to the search queue. Returns false if already queued.
    pub fn enqueue(&self, player_id: PlayerId) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.contains(&player_id) {
            return false;
        }
        queue.push(player_id);
        debug!("player {} entered the ladder queue", player_id);
        true
    }

    /// Remove a player from the search queue. Returns whether they were in it.
    pub fn dequeue(&self, player_id: PlayerId) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|&id| id != player_id);
        queue.len() != before
    }

    /// Players currently searching.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Candidate maps for one pairing.
    ///
    /// Uniform draw from {0, 1, 2}:
    /// - 0: popular ∪ (p1 selected ∩ p2 selected)
    /// - 1: p1 selected ∪ popular
    /// - 2: p2 selected ∪ popular
    pub async fn choose_map_pool(
        &self,
        player1: PlayerId,
        player2: PlayerId,
    ) -> Result<BTreeSet<String>, StoreError> {
        let branch = self.rng.lock().unwrap().draw(3);
        let popular = self.store.popular_maps().await?;

        let pool: BTreeSet<String> = match branch {
            0 => {
                let p1: BTreeSet<String> = self.store.selected_maps(player1).await?.into_iter().collect();
                let p2: BTreeSet<String> = self.store.selected_maps(player2).await?.into_iter().collect();
                popular
                    .into_iter()
                    .chain(p1.intersection(&p2).cloned())
                    .collect()
            }
            1 => {
                let p1 = self.store.selected_maps(player1).await?;
                p1.into_iter().chain(popular).collect()
            }
            _ => {
                let p2 = self.store.selected_maps(player2).await?;
                p2.into_iter().chain(popular).collect()
            }
        };

        debug!(
            "ladder pool for {} vs {} (branch {}): {} maps",
            player1,
            player2,
            branch,
            pool.len()
        );
        Ok(pool)
    }

    /// Create and launch a ladder game for a matched pair.
    ///
    /// Picks one map uniformly from the ordered pool, creates the game with
    /// player1 hosting, seats player2, points both players at it, and tells
    /// both clients to launch.
    pub async fn start_game(
        &self,
        player1: PlayerId,
        player2: PlayerId,
    ) -> Result<GameId, MatchmakerError> {
        let p1 = self
            .players
            .get(player1)
            .await
            .ok_or(MatchmakerError::PlayerUnavailable(player1))?;
        let p2 = self
            .players
            .get(player2)
            .await
            .ok_or(MatchmakerError::PlayerUnavailable(player2))?;

        let pool = self.choose_map_pool(player1, player2).await?;
        if pool.is_empty() {
            return Err(MatchmakerError::EmptyPool);
        }

        // Second draw over the ordered pool keeps the pick replayable from
        // the seed.
        let mapname = {
            let idx = self.rng.lock().unwrap().draw(pool.len() as u32) as usize;
            pool.iter().nth(idx).cloned().unwrap_or_default()
        };

        let (login1, login2) = (
            p1.read().await.login.clone(),
            p2.read().await.login.clone(),
        );
        let title = format!("{login1} vs {login2}");

        let game = self
            .games
            .create_game(
                LADDER_MODE,
                player1,
                &login1,
                &title,
                &mapname,
                GameVisibility::Public,
                None,
            )
            .await?;

        let (game_id, featured_mod, host_address) = {
            let mut g = game.write().await;
            g.add_player(player2, None)?;
            // Ladder lobbies are not joinable by anyone else.
            g.transition(GameState::LobbyClosed)?;
            (g.id, g.featured_mod.clone(), None)
        };
        self.games.mark_dirty(game_id);

        {
            let mut p = p1.write().await;
            p.transition(PlayerState::Hosting)
                .map_err(|_| MatchmakerError::PlayerUnavailable(player1))?;
            p.current_game = Some(game_id);
            p.try_send(ServerMessage::GameLaunch {
                uid: game_id,
                mapname: mapname.clone(),
                featured_mod: featured_mod.clone(),
                host: host_address,
            });
        }
        {
            let mut p = p2.write().await;
            p.transition(PlayerState::Joining)
                .map_err(|_| MatchmakerError::PlayerUnavailable(player2))?;
            p.current_game = Some(game_id);
            let host = Some(p1.read().await.game_address());
            p.try_send(ServerMessage::GameLaunch {
                uid: game_id,
                mapname: mapname.clone(),
                featured_mod,
                host,
            });
        }

        info!(
            "ladder game {} started: {} vs {} on {}",
            game_id, login1, login2, mapname
        );
        Ok(game_id)
    }

    /// Periodic pairing step: pop queued players two at a time (FIFO) and
    /// start their games. Players who are gone or no longer idle are dropped
    /// from the queue. Returns the started game ids.
    pub async fn match_waiting_pairs(&self) -> Vec<GameId> {
        let mut started = Vec::new();

        loop {
            let pair = {
                let mut queue = self.queue.lock().unwrap();
                if queue.len() < 2 {
                    break;
                }
                let a = queue.remove(0);
                let b = queue.remove(0);
                (a, b)
            };

            match self.start_game(pair.0, pair.1).await {
                Ok(id) => started.push(id),
                Err(MatchmakerError::PlayerUnavailable(missing)) => {
                    // Requeue the survivor at the front.
                    let survivor = if missing == pair.0 { pair.1 } else { pair.0 };
                    warn!("dropping {} from the ladder queue", missing);
                    self.queue.lock().unwrap().insert(0, survivor);
                }
                Err(e) => {
                    warn!("failed to start ladder game for {:?}: {}", pair, e);
                }
            }
        }

        started
    }
}

// =============================================================================
// TESTS
// =============================================================================
