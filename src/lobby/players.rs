//! Player Registry
//!
//! Authoritative set of currently connected players. Sessions register a
//! player after authentication and unregister it on close; nothing else
//! inserts or removes. Lookups by id, login, or network address+session
//! token; broadcast fan-out for the dirty-game cycle.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::lobby::game::PlayerId;
use crate::lobby::player::Player;
use crate::network::protocol::ServerMessage;

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// An active session already holds this login.
    #[error("an active session already exists for {0:?}")]
    DuplicateIdentity(String),
}

#[derive(Default)]
struct Inner {
    players: BTreeMap<PlayerId, Arc<RwLock<Player>>>,
    by_login: BTreeMap<String, PlayerId>,
}

/// Registry of online players.
///
/// Constructed once at startup and shared by reference with every session
/// task; there is no global instance.
#[derive(Default)]
pub struct PlayerRegistry {
    inner: RwLock<Inner>,
}

impl PlayerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated player.
    ///
    /// Fails with [`RegistryError::DuplicateIdentity`] when the login is
    /// already held. Policy is newest-connection-wins: the caller displaces
    /// the previous entry with [`PlayerRegistry::displace`], closes it, and
    /// registers again.
    pub async fn register(&self, player: Arc<RwLock<Player>>) -> Result<(), RegistryError> {
        let (id, login) = {
            let p = player.read().await;
            (p.id, p.login.clone())
        };

        let mut inner = self.inner.write().await;
        if inner.by_login.contains_key(&login) {
            return Err(RegistryError::DuplicateIdentity(login));
        }
        inner.by_login.insert(login, id);
        inner.players.insert(id, player);
        Ok(())
    }

    /// Remove and return the registered entry for a login, if any.
    pub async fn displace(&self, login: &str) -> Option<Arc<RwLock<Player>>> {
        let mut inner = self.inner.write().await;
        let id = inner.by_login.remove(login)?;
        inner.players.remove(&id)
    }

    /// Unregister a player, but only if the registry still holds this exact
    /// handle. A session displaced by a newer one for the same identity must
    /// not tear down its successor's registration.
    pub async fn unregister(&self, player: &Arc<RwLock<Player>>) -> bool {
        let (id, login) = {
            let p = player.read().await;
            (p.id, p.login.clone())
        };

        let mut inner = self.inner.write().await;
        match inner.players.get(&id) {
            Some(current) if Arc::ptr_eq(current, player) => {
                inner.players.remove(&id);
                inner.by_login.remove(&login);
                true
            }
            _ => false,
        }
    }

    /// Look up by account id.
    pub async fn get(&self, id: PlayerId) -> Option<Arc<RwLock<Player>>> {
        self.inner.read().await.players.get(&id).cloned()
    }

    /// Look up by login.
    pub async fn find_by_login(&self, login: &str) -> Option<Arc<RwLock<Player>>> {
        let inner = self.inner.read().await;
        let id = inner.by_login.get(login)?;
        inner.players.get(id).cloned()
    }

    /// Correlate a UDP traversal packet with an authenticated TCP session.
    pub async fn find_by_address_and_session(
        &self,
        ip: IpAddr,
        session: u64,
    ) -> Option<Arc<RwLock<Player>>> {
        let candidates: Vec<_> = {
            let inner = self.inner.read().await;
            inner.players.values().cloned().collect()
        };

        for player in candidates {
            let p = player.read().await;
            if p.ip == ip && p.session == session {
                drop(p);
                return Some(player);
            }
        }
        None
    }

    /// Send a message to every registered player whose state satisfies the
    /// predicate. Non-blocking: players with a full outbound queue are
    /// skipped (their session enforces the backpressure policy). Returns
    /// the number of players the message was queued for.
    pub async fn broadcast<F>(&self, message: &ServerMessage, predicate: F) -> usize
    where
        F: Fn(&Player) -> bool,
    {
        let targets: Vec<_> = {
            let inner = self.inner.read().await;
            inner.players.values().cloned().collect()
        };

        let mut sent = 0;
        for player in targets {
            let p = player.read().await;
            if predicate(&p) && p.try_send(message.clone()) {
                sent += 1;
            }
        }
        debug!("broadcast reached {} players", sent);
        sent
    }

    /// Number of registered players.
    pub async fn player_count(&self) -> usize {
        self.inner.read().await.players.len()
    }

    /// Logins of everyone online, for diagnostics.
    pub async fn logins(&self) -> Vec<String> {
        self.inner.read().await.by_login.keys().cloned().collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::player::{CloseReason, PlayerState, Rating};
    use tokio::sync::mpsc;

    fn make_player(
        id: PlayerId,
        login: &str,
        session: u64,
    ) -> (
        Arc<RwLock<Player>>,
        mpsc::Receiver<ServerMessage>,
        mpsc::Receiver<CloseReason>,
    ) {
        let (tx, rx) = mpsc::channel(2);
        let (close_tx, close_rx) = mpsc::channel(1);
        let player = Player::new(
            id,
            login,
            "127.0.0.1".parse().unwrap(),
            6112,
            session,
            Rating::default(),
            Rating::default(),
            tx,
            close_tx,
        );
        (Arc::new(RwLock::new(player)), rx, close_rx)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = PlayerRegistry::new();
        let (player, _rx, _close) = make_player(1, "Paula_Bean", 11);

        registry.register(player.clone()).await.unwrap();
        assert_eq!(registry.player_count().await, 1);
        assert!(registry.get(1).await.is_some());
        assert!(registry.find_by_login("Paula_Bean").await.is_some());
        assert!(registry.find_by_login("paula_bean").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let registry = PlayerRegistry::new();
        let (first, _rx1, _close1) = make_player(1, "Paula_Bean", 11);
        let (second, _rx2, _close2) = make_player(1, "Paula_Bean", 22);

        registry.register(first).await.unwrap();
        let err = registry.register(second).await.unwrap_err();
        assert_eq!(err, RegistryError::DuplicateIdentity("Paula_Bean".into()));
    }

    #[tokio::test]
    async fn test_displace_then_register() {
        let registry = PlayerRegistry::new();
        let (first, _rx1, mut close1) = make_player(1, "Paula_Bean", 11);
        let (second, _rx2, _close2) = make_player(1, "Paula_Bean", 22);

        registry.register(first.clone()).await.unwrap();

        // Newest connection wins: displace, close the old one, register.
        let prev = registry.displace("Paula_Bean").await.unwrap();
        assert!(Arc::ptr_eq(&prev, &first));
        prev.read().await.request_close(CloseReason::Kicked);
        registry.register(second.clone()).await.unwrap();

        assert_eq!(close1.recv().await, Some(CloseReason::Kicked));
        assert_eq!(registry.player_count().await, 1);
        let current = registry.get(1).await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn test_unregister_requires_same_handle() {
        let registry = PlayerRegistry::new();
        let (first, _rx1, _close1) = make_player(1, "Paula_Bean", 11);
        let (second, _rx2, _close2) = make_player(1, "Paula_Bean", 22);

        registry.register(first.clone()).await.unwrap();
        registry.displace("Paula_Bean").await.unwrap();
        registry.register(second.clone()).await.unwrap();

        // The displaced session's late unregister must not remove its
        // successor.
        assert!(!registry.unregister(&first).await);
        assert_eq!(registry.player_count().await, 1);

        assert!(registry.unregister(&second).await);
        assert_eq!(registry.player_count().await, 0);
    }

    #[tokio::test]
    async fn test_find_by_address_and_session() {
        let registry = PlayerRegistry::new();
        let (a, _rx1, _close1) = make_player(1, "Paula_Bean", 11);
        let (b, _rx2, _close2) = make_player(2, "That_Guy", 22);
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let found = registry.find_by_address_and_session(ip, 22).await.unwrap();
        assert_eq!(found.read().await.id, 2);

        assert!(registry.find_by_address_and_session(ip, 33).await.is_none());
        let other: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(registry.find_by_address_and_session(other, 22).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_respects_predicate() {
        let registry = PlayerRegistry::new();
        let (a, mut rx_a, _close1) = make_player(1, "Paula_Bean", 11);
        let (b, mut rx_b, _close2) = make_player(2, "That_Guy", 22);
        registry.register(a).await.unwrap();
        registry.register(b.clone()).await.unwrap();

        b.write().await.transition(PlayerState::Hosting).unwrap();

        let sent = registry
            .broadcast(&ServerMessage::info("lobby update"), |p| {
                p.state() == PlayerState::Idle
            })
            .await;
        assert_eq!(sent, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_full_queues() {
        let registry = PlayerRegistry::new();
        let (a, _rx_a, _close1) = make_player(1, "Paula_Bean", 11);
        registry.register(a.clone()).await.unwrap();

        // Fill the bounded queue (capacity 2) without draining.
        {
            let p = a.read().await;
            assert!(p.try_send(ServerMessage::info("1")));
            assert!(p.try_send(ServerMessage::info("2")));
        }

        let sent = registry
            .broadcast(&ServerMessage::info("3"), |_| true)
            .await;
        assert_eq!(sent, 0);
    }
}
