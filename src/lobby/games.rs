//! Game Registry
//!
//! Per-mode containers of active games, plus the registry that owns them:
//! creation, queries across modes, player removal, stale eviction, and the
//! dirty set that drives listing broadcasts.
//!
//! Ids are allocated from one server-global counter so a game id identifies
//! a game regardless of its mode. Ended games stay in their container until
//! their final listing update has been drained, then the periodic sweep
//! collects them; leaked games never accumulate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::lobby::game::{Game, GameError, GameId, GameState, GameVisibility, PlayerId};
use crate::network::protocol::GameInfoMessage;

/// Lobbies idle past this age are considered abandoned.
pub const DEFAULT_MAX_LOBBY_AGE: Duration = Duration::from_secs(30 * 60);

/// Holds every active game of one mode.
pub struct GameContainer {
    /// Mode key, e.g. `"vanguard"` or `"ladder1v1"`.
    pub mode: String,
    /// Human-readable mode name.
    pub description: String,
    /// Whether games of this mode appear in the public listing.
    pub listable: bool,
    games: RwLock<BTreeMap<GameId, Arc<RwLock<Game>>>>,
    next_id: Arc<AtomicU32>,
}

impl GameContainer {
    fn new(mode: &str, description: &str, listable: bool, next_id: Arc<AtomicU32>) -> Self {
        Self {
            mode: mode.to_string(),
            description: description.to_string(),
            listable,
            games: RwLock::new(BTreeMap::new()),
            next_id,
        }
    }

    /// Create a game of this mode with a fresh id.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_game(
        &self,
        host_id: PlayerId,
        host_login: &str,
        title: &str,
        mapname: &str,
        visibility: GameVisibility,
        password: Option<String>,
    ) -> Arc<RwLock<Game>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let game = Game::new(
            id,
            host_id,
            host_login,
            title,
            &self.mode,
            mapname,
            visibility,
            password,
            self.listable,
        );
        let game = Arc::new(RwLock::new(game));
        self.games.write().await.insert(id, game.clone());
        info!("created game {} ({:?}) hosted by {}", id, title, host_login);
        game
    }

    /// Look up a game of this mode by id.
    pub async fn find_by_id(&self, id: GameId) -> Option<Arc<RwLock<Game>>> {
        self.games.read().await.get(&id).cloned()
    }

    /// Remove a game outright.
    pub async fn remove(&self, id: GameId) -> Option<Arc<RwLock<Game>>> {
        self.games.write().await.remove(&id)
    }

    /// Snapshot of every game in this container.
    pub async fn games(&self) -> Vec<Arc<RwLock<Game>>> {
        self.games.read().await.values().cloned().collect()
    }

    /// Number of games in this container.
    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    /// Whether the container holds no games.
    pub async fn is_empty(&self) -> bool {
        self.games.read().await.is_empty()
    }
}

/// Registry of all game containers plus the broadcast dirty set.
///
/// Constructed once at startup and shared by reference with every session
/// task; there is no global instance.
pub struct GameRegistry {
    containers: RwLock<BTreeMap<String, Arc<GameContainer>>>,
    dirty: Mutex<BTreeSet<GameId>>,
    next_id: Arc<AtomicU32>,
    max_lobby_age: Duration,
}

impl Default for GameRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOBBY_AGE)
    }
}

impl GameRegistry {
    /// Registry with the given stale-lobby threshold.
    pub fn new(max_lobby_age: Duration) -> Self {
        Self {
            containers: RwLock::new(BTreeMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
            next_id: Arc::new(AtomicU32::new(1)),
            max_lobby_age,
        }
    }

    /// Add a container for a mode. Returns false if the mode already exists.
    pub async fn add_container(&self, mode: &str, description: &str, listable: bool) -> bool {
        let mut containers = self.containers.write().await;
        if containers.contains_key(mode) {
            return false;
        }
        containers.insert(
            mode.to_string(),
            Arc::new(GameContainer::new(
                mode,
                description,
                listable,
                self.next_id.clone(),
            )),
        );
        true
    }

    /// Container for a mode, if registered.
    pub async fn container(&self, mode: &str) -> Option<Arc<GameContainer>> {
        self.containers.read().await.get(mode).cloned()
    }

    /// `(mode, description)` of every registered container.
    pub async fn game_modes(&self) -> Vec<(String, String)> {
        self.containers
            .read()
            .await
            .values()
            .map(|c| (c.mode.clone(), c.description.clone()))
            .collect()
    }

    /// Create a game under the given mode and mark it dirty.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_game(
        &self,
        mode: &str,
        host_id: PlayerId,
        host_login: &str,
        title: &str,
        mapname: &str,
        visibility: GameVisibility,
        password: Option<String>,
    ) -> Result<Arc<RwLock<Game>>, GameError> {
        let container = self
            .container(mode)
            .await
            .ok_or_else(|| GameError::UnknownMode(mode.to_string()))?;

        let game = container
            .create_game(host_id, host_login, title, mapname, visibility, password)
            .await;
        let id = game.read().await.id;
        self.mark_dirty(id);
        Ok(game)
    }

    async fn containers_snapshot(&self) -> Vec<Arc<GameContainer>> {
        self.containers.read().await.values().cloned().collect()
    }

    /// Find a game in any container by id.
    pub async fn find_by_id(&self, id: GameId) -> Option<Arc<RwLock<Game>>> {
        for container in self.containers_snapshot().await {
            if let Some(game) = container.find_by_id(id).await {
                return Some(game);
            }
        }
        None
    }

    /// Find a game in any container by uuid.
    pub async fn find_by_uuid(&self, uuid: Uuid) -> Option<Arc<RwLock<Game>>> {
        for container in self.containers_snapshot().await {
            for game in container.games().await {
                if game.read().await.uuid == uuid {
                    return Some(game);
                }
            }
        }
        None
    }

    /// Find the game hosted by a player, if any.
    pub async fn find_by_host(&self, host_id: PlayerId) -> Option<Arc<RwLock<Game>>> {
        for container in self.containers_snapshot().await {
            for game in container.games().await {
                if game.read().await.is_host(host_id) {
                    return Some(game);
                }
            }
        }
        None
    }

    /// Remove a game from whichever container holds it.
    pub async fn remove_game(&self, id: GameId) -> Option<Arc<RwLock<Game>>> {
        for container in self.containers_snapshot().await {
            if let Some(game) = container.remove(id).await {
                return Some(game);
            }
        }
        None
    }

    /// Detach a player from every game.
    ///
    /// The host leaving ends the game; anyone else leaving just updates the
    /// team assignment. Every touched game is marked dirty. Returns the ids
    /// of games that ended, so the caller can persist results for the ones
    /// that were live.
    pub async fn remove_player(&self, player_id: PlayerId) -> Vec<GameId> {
        let mut ended = Vec::new();

        for container in self.containers_snapshot().await {
            for game in container.games().await {
                let mut g = game.write().await;
                if !g.contains(player_id) {
                    continue;
                }

                g.remove_player(player_id);
                if g.is_host(player_id) && g.state() != GameState::Ended {
                    // Transition is legal from every non-terminal state.
                    let _ = g.transition(GameState::Ended);
                    ended.push(g.id);
                    debug!("game {} ended: host {} left", g.id, player_id);
                }
                self.mark_dirty(g.id);
            }
        }

        ended
    }

    /// Listing of games that are open and listable.
    pub async fn list_open_listable(&self) -> Vec<GameInfoMessage> {
        let mut listing = Vec::new();
        for container in self.containers_snapshot().await {
            for game in container.games().await {
                let g = game.read().await;
                if g.listable && g.state() == GameState::LobbyOpen {
                    listing.push(g.game_info());
                }
            }
        }
        listing
    }

    /// Mark a game as changed since the last broadcast.
    pub fn mark_dirty(&self, id: GameId) {
        self.dirty.lock().unwrap().insert(id);
    }

    /// Atomically take the dirty set for one broadcast cycle.
    ///
    /// No id is returned twice in one call, and a mark that races the drain
    /// lands in the next cycle rather than being lost.
    pub fn drain_dirty(&self) -> BTreeSet<GameId> {
        std::mem::take(&mut *self.dirty.lock().unwrap())
    }

    fn is_dirty(&self, id: GameId) -> bool {
        self.dirty.lock().unwrap().contains(&id)
    }

    /// Periodic sweep: remove abandoned and finished games.
    ///
    /// Evicts games with no players, lobbies idle past the configured age,
    /// and ended games whose final listing update has already been drained.
    /// Returns the removed ids.
    pub async fn evict_stale(&self) -> Vec<GameId> {
        let mut removed = Vec::new();

        for container in self.containers_snapshot().await {
            for game in container.games().await {
                let (id, stale) = {
                    let g = game.read().await;
                    let stale = match g.state() {
                        _ if g.num_players() == 0 => true,
                        GameState::LobbyOpen | GameState::LobbyClosed => {
                            g.idle_for() > self.max_lobby_age
                        }
                        GameState::Ended => !self.is_dirty(g.id),
                        GameState::Live => false,
                    };
                    (g.id, stale)
                };

                if stale && container.remove(id).await.is_some() {
                    removed.push(id);
                }
            }
        }

        if !removed.is_empty() {
            info!("evicted {} stale games: {:?}", removed.len(), removed);
        }
        removed
    }

    /// Total games across all containers.
    pub async fn game_count(&self) -> usize {
        let mut count = 0;
        for container in self.containers_snapshot().await {
            count += container.len().await;
        }
        count
    }

    /// Titles of active games, for diagnostics.
    pub async fn titles(&self) -> Vec<String> {
        let mut titles = Vec::new();
        for container in self.containers_snapshot().await {
            for game in container.games().await {
                titles.push(game.read().await.title.clone());
            }
        }
        titles
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> GameRegistry {
        let registry = GameRegistry::default();
        registry.add_container("vanguard", "Vanguard Standard", true).await;
        registry.add_container("ladder1v1", "Ranked 1v1 Ladder", false).await;
        registry
    }

    async fn host_game(registry: &GameRegistry, host: PlayerId) -> Arc<RwLock<Game>> {
        registry
            .create_game(
                "vanguard",
                host,
                &format!("player{host}"),
                "Test",
                "SCMP_007",
                GameVisibility::Public,
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_container_once() {
        let registry = registry().await;
        assert!(!registry.add_container("vanguard", "again", true).await);
        assert_eq!(registry.game_modes().await.len(), 2);
    }

    #[tokio::test]
    async fn test_create_game_assigns_fresh_ids_and_marks_dirty() {
        let registry = registry().await;
        let a = host_game(&registry, 1).await;
        let b = host_game(&registry, 2).await;

        let (id_a, id_b) = (a.read().await.id, b.read().await.id);
        assert_ne!(id_a, id_b);
        assert_eq!(a.read().await.state(), GameState::LobbyOpen);

        // Both appear in exactly one drain.
        let drained = registry.drain_dirty();
        assert!(drained.contains(&id_a) && drained.contains(&id_b));
        assert!(registry.drain_dirty().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_mode_rejected() {
        let registry = registry().await;
        let err = registry
            .create_game(
                "nosuchmode",
                1,
                "host",
                "Test",
                "SCMP_007",
                GameVisibility::Public,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::UnknownMode(_)));
    }

    #[tokio::test]
    async fn test_find_queries() {
        let registry = registry().await;
        let game = host_game(&registry, 1).await;
        let (id, uuid) = {
            let g = game.read().await;
            (g.id, g.uuid)
        };

        assert!(registry.find_by_id(id).await.is_some());
        assert!(registry.find_by_id(id + 100).await.is_none());
        assert!(registry.find_by_uuid(uuid).await.is_some());
        assert!(registry.find_by_uuid(Uuid::new_v4()).await.is_none());
        assert!(registry.find_by_host(1).await.is_some());
        assert!(registry.find_by_host(2).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_game_across_containers() {
        let registry = registry().await;
        let game = host_game(&registry, 1).await;
        let id = game.read().await.id;

        let removed = registry.remove_game(id).await.unwrap();
        assert!(Arc::ptr_eq(&removed, &game));
        assert!(registry.find_by_id(id).await.is_none());
        assert!(registry.remove_game(id).await.is_none());
    }

    #[tokio::test]
    async fn test_game_modes() {
        let registry = registry().await;
        let modes = registry.game_modes().await;
        assert_eq!(
            modes,
            vec![
                ("ladder1v1".to_string(), "Ranked 1v1 Ladder".to_string()),
                ("vanguard".to_string(), "Vanguard Standard".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_mark_during_drain_lands_in_next_cycle() {
        let registry = registry().await;
        let game = host_game(&registry, 1).await;
        let id = game.read().await.id;

        let first = registry.drain_dirty();
        assert!(first.contains(&id));

        // A mutation after the drain began is not lost.
        registry.mark_dirty(id);
        let second = registry.drain_dirty();
        assert!(second.contains(&id));
    }

    #[tokio::test]
    async fn test_listing_filters() {
        let registry = registry().await;
        let open = host_game(&registry, 1).await;
        let closed = host_game(&registry, 2).await;
        closed.write().await.transition(GameState::LobbyClosed).unwrap();

        // Ladder games are not listable.
        registry
            .create_game(
                "ladder1v1",
                3,
                "player3",
                "ladder",
                "SCMP_009",
                GameVisibility::Public,
                None,
            )
            .await
            .unwrap();

        let listing = registry.list_open_listable().await;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].uid, open.read().await.id);

        // Empty teams never reach the listing.
        assert!(listing[0].teams.values().all(|members| !members.is_empty()));
    }

    #[tokio::test]
    async fn test_remove_player_nonhost_updates_teams() {
        let registry = registry().await;
        let game = host_game(&registry, 1).await;
        game.write().await.add_player(2, None).unwrap();
        registry.drain_dirty();

        let ended = registry.remove_player(2).await;
        assert!(ended.is_empty());

        let g = game.read().await;
        assert!(!g.contains(2));
        assert_eq!(g.state(), GameState::LobbyOpen);
        drop(g);

        // Touched game was re-marked for broadcast.
        assert!(registry.drain_dirty().contains(&game.read().await.id));
    }

    #[tokio::test]
    async fn test_remove_player_host_ends_game() {
        let registry = registry().await;
        let game = host_game(&registry, 1).await;
        game.write().await.add_player(2, None).unwrap();
        let id = game.read().await.id;

        let ended = registry.remove_player(1).await;
        assert_eq!(ended, vec![id]);
        assert_eq!(game.read().await.state(), GameState::Ended);

        // Ended games drop out of the listing immediately.
        assert!(registry.list_open_listable().await.is_empty());
    }

    #[tokio::test]
    async fn test_evict_empty_game() {
        let registry = registry().await;
        let game = host_game(&registry, 1).await;
        let id = game.read().await.id;
        game.write().await.remove_player(1);

        let removed = registry.evict_stale().await;
        assert_eq!(removed, vec![id]);
        assert!(registry.find_by_id(id).await.is_none());
    }

    #[tokio::test]
    async fn test_evict_stale_lobby_past_age() {
        let registry = GameRegistry::new(Duration::ZERO);
        registry.add_container("vanguard", "Vanguard Standard", true).await;
        let game = registry
            .create_game(
                "vanguard",
                1,
                "host",
                "Test",
                "SCMP_007",
                GameVisibility::Public,
                None,
            )
            .await
            .unwrap();
        let id = game.read().await.id;

        // Zero max age: any lobby is immediately stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = registry.evict_stale().await;
        assert_eq!(removed, vec![id]);
        assert!(registry.find_by_id(id).await.is_none());
    }

    #[tokio::test]
    async fn test_ended_game_survives_until_drained() {
        let registry = registry().await;
        let game = host_game(&registry, 1).await;
        game.write().await.add_player(2, None).unwrap();
        let id = game.read().await.id;

        registry.remove_player(1).await;

        // Still dirty: the closing update has not been broadcast yet.
        assert!(registry.evict_stale().await.is_empty());
        assert!(registry.find_by_id(id).await.is_some());

        registry.drain_dirty();
        let removed = registry.evict_stale().await;
        assert_eq!(removed, vec![id]);
        assert!(registry.find_by_id(id).await.is_none());
    }

    #[tokio::test]
    async fn test_live_games_not_evicted() {
        let registry = registry().await;
        let game = host_game(&registry, 1).await;
        game.write().await.transition(GameState::Live).unwrap();
        registry.drain_dirty();

        assert!(registry.evict_stale().await.is_empty());
        assert_eq!(registry.game_count().await, 1);
    }
}
