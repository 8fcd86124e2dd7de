//! Datastore Seam
//!
//! The lobby core never talks SQL. Everything it needs from persistent
//! storage goes through the [`Datastore`] trait: credential checks, ratings,
//! ladder map tables, and game results. Connection pooling, reconnection,
//! and schema belong to the implementation behind the trait.
//!
//! [`MemoryStore`] is the bundled implementation: an account/map table held
//! in memory, optionally loaded from a JSON file. It backs tests and small
//! deployments.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lobby::game::PlayerId;
use crate::lobby::player::Rating;

/// Datastore failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Unknown login or wrong password.
    #[error("login not found or password mismatch")]
    AuthFailure,

    /// The backing store cannot be reached.
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

/// Account facts returned by a successful credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    /// Stable account id.
    pub id: PlayerId,
    /// Canonical login spelling.
    pub login: String,
}

/// Outcome of a finished game, persisted for rating updates and history.
#[derive(Debug, Clone, PartialEq)]
pub struct GameResult {
    /// Stable game identifier.
    pub game_uuid: Uuid,
    /// Game mode the result belongs to.
    pub featured_mod: String,
    /// Map the game was played on.
    pub mapname: String,
    /// Everyone who was seated when the game ended.
    pub players: Vec<PlayerId>,
}

/// Narrow interface to persistent storage.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Check credentials. `Err(StoreError::AuthFailure)` for a bad login or
    /// password; the caller turns that into the fixed user-facing notice.
    async fn authenticate(&self, login: &str, password: &str) -> Result<PlayerRecord, StoreError>;

    /// Load (global, ladder) ratings for an account.
    async fn load_ratings(&self, player_id: PlayerId) -> Result<(Rating, Rating), StoreError>;

    /// Record the outcome of a finished game.
    async fn persist_game_result(&self, result: &GameResult) -> Result<(), StoreError>;

    /// Server-curated pool of frequently played ladder maps.
    async fn popular_maps(&self) -> Result<Vec<String>, StoreError>;

    /// Maps the player pre-selected for ladder play.
    async fn selected_maps(&self, player_id: PlayerId) -> Result<Vec<String>, StoreError>;
}

/// One account row in the JSON accounts file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Stable account id.
    pub id: PlayerId,
    /// Plaintext password. Fine for dev deployments; a real deployment puts
    /// a hashing store behind the trait instead.
    pub password: String,
    /// Global rating, placement default when absent.
    #[serde(default)]
    pub global_rating: Rating,
    /// Ladder rating, placement default when absent.
    #[serde(default)]
    pub ladder_rating: Rating,
}

/// In-memory datastore.
#[derive(Debug)]
pub struct MemoryStore {
    accounts: RwLock<BTreeMap<String, Account>>,
    popular: RwLock<Vec<String>>,
    selected: RwLock<BTreeMap<PlayerId, Vec<String>>>,
    results: Mutex<Vec<GameResult>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            popular: RwLock::new(Vec::new()),
            selected: RwLock::new(BTreeMap::new()),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Load accounts from a JSON file mapping login -> account.
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        let accounts: BTreeMap<String, Account> = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;

        let store = Self::new();
        *store.accounts.write().unwrap() = accounts;
        Ok(store)
    }

    /// Insert an account, replacing any previous one for the login.
    pub fn insert_account(&self, login: &str, account: Account) {
        self.accounts
            .write()
            .unwrap()
            .insert(login.to_string(), account);
    }

    /// Replace the popular-maps pool.
    pub fn set_popular_maps(&self, maps: Vec<String>) {
        *self.popular.write().unwrap() = maps;
    }

    /// Replace a player's selected ladder maps.
    pub fn set_selected_maps(&self, player_id: PlayerId, maps: Vec<String>) {
        self.selected.write().unwrap().insert(player_id, maps);
    }

    /// Results recorded so far, oldest first.
    pub fn recorded_results(&self) -> Vec<GameResult> {
        self.results.lock().unwrap().clone()
    }

    /// Number of known accounts.
    pub fn account_count(&self) -> usize {
        self.accounts.read().unwrap().len()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn authenticate(&self, login: &str, password: &str) -> Result<PlayerRecord, StoreError> {
        let accounts = self.accounts.read().unwrap();
        // Logins and passwords are case sensitive.
        match accounts.get(login) {
            Some(account) if account.password == password => Ok(PlayerRecord {
                id: account.id,
                login: login.to_string(),
            }),
            _ => Err(StoreError::AuthFailure),
        }
    }

    async fn load_ratings(&self, player_id: PlayerId) -> Result<(Rating, Rating), StoreError> {
        let accounts = self.accounts.read().unwrap();
        let account = accounts.values().find(|a| a.id == player_id);
        match account {
            Some(a) => Ok((a.global_rating, a.ladder_rating)),
            None => Ok((Rating::default(), Rating::default())),
        }
    }

    async fn persist_game_result(&self, result: &GameResult) -> Result<(), StoreError> {
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn popular_maps(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.popular.read().unwrap().clone())
    }

    async fn selected_maps(&self, player_id: PlayerId) -> Result<Vec<String>, StoreError> {
        Ok(self
            .selected
            .read()
            .unwrap()
            .get(&player_id)
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// TESTS
// =============================================================================
