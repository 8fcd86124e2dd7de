//! Lobby Sessions
//!
//! One `LobbySession` per connected client. It consumes decoded messages,
//! authenticates against the datastore, issues commands to the registries
//! and matchmaker, and pushes replies through the bounded outbound channel.
//! Socket IO lives in `server.rs`; the state machine here is testable
//! without a socket.
//!
//! Nothing but `hello` is processed before authentication, and an
//! unauthenticated client never receives game or player data.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::rng::derive_session_seed;
use crate::lobby::game::{GameError, GameState, GameVisibility};
use crate::lobby::games::GameRegistry;
use crate::lobby::matchmaker::Matchmaker;
use crate::lobby::player::{CloseReason, Player, PlayerState};
use crate::lobby::players::{PlayerRegistry, RegistryError};
use crate::network::protocol::{
    ClientMessage, MatchmakingAction, MatchmakingState, ServerMessage,
};
use crate::store::{Datastore, GameResult, StoreError};

/// Exact text shown for a failed credential check. Clients match on it.
pub const LOGIN_FAILURE_TEXT: &str =
    "Login not found or password incorrect. They are case sensitive.";

/// Notice for commands sent before authentication.
pub const AUTH_REQUIRED_TEXT: &str = "You must log in first.";

/// Notice when the datastore fails mid-request.
pub const TEMPORARY_FAILURE_TEXT: &str = "Temporary server issue, please try again.";

/// States of a lobby session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, not authenticated.
    Connected,
    /// Credentials accepted, player registered.
    Authenticated,
    /// Watching the lobby (requested the game list).
    InLobby,
    /// Hosting or joined a game.
    InGame,
    /// Terminal; the player is detached.
    Closed,
}

/// Session-level failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Command arrived before authentication and was not processed.
    #[error("command requires authentication")]
    AuthRequired,
}

/// Shared service handles passed to every session.
#[derive(Clone)]
pub struct Services {
    /// Online-player registry.
    pub players: Arc<PlayerRegistry>,
    /// Game containers and dirty set.
    pub games: Arc<GameRegistry>,
    /// Ladder queue and pairing.
    pub matchmaker: Arc<Matchmaker>,
    /// Persistent storage seam.
    pub store: Arc<dyn Datastore>,
}

/// Per-connection state machine.
pub struct LobbySession {
    addr: SocketAddr,
    state: SessionState,
    services: Services,
    outbound: mpsc::Sender<ServerMessage>,
    close_tx: mpsc::Sender<CloseReason>,
    player: Option<Arc<RwLock<Player>>>,
}

impl LobbySession {
    /// Session for a freshly accepted connection.
    pub fn new(
        addr: SocketAddr,
        services: Services,
        outbound: mpsc::Sender<ServerMessage>,
        close_tx: mpsc::Sender<CloseReason>,
    ) -> Self {
        Self {
            addr,
            state: SessionState::Connected,
            services,
            outbound,
            close_tx,
            player: None,
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The registered player, once authenticated.
    pub fn player(&self) -> Option<&Arc<RwLock<Player>>> {
        self.player.as_ref()
    }

    /// Queue a reply without blocking. A full queue means the client is not
    /// draining; request closure instead of buffering unboundedly.
    fn send(&self, message: ServerMessage) {
        if let Err(e) = self.outbound.try_send(message) {
            warn!("outbound queue stalled for {}: {}", self.addr, e);
            let _ = self.close_tx.try_send(CloseReason::Backpressure);
        }
    }

    /// Dispatch one decoded message.
    pub async fn handle_message(&mut self, message: ClientMessage) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        // Matchmaking can move a player into a game between commands; keep
        // the session view in line with the player's state.
        self.sync_with_player().await;

        match message {
            ClientMessage::Hello {
                login,
                password,
                version,
                unique_id,
                game_port,
            } => {
                self.handle_hello(login, password, version, unique_id, game_port)
                    .await;
                Ok(())
            }
            // Nothing but hello is processed before authentication, and an
            // unauthenticated client never receives game or player data.
            _ if self.state == SessionState::Connected => {
                self.send(ServerMessage::error(AUTH_REQUIRED_TEXT));
                Err(SessionError::AuthRequired)
            }
            ClientMessage::Ping { timestamp } => {
                self.send(ServerMessage::Pong { timestamp });
                Ok(())
            }
            ClientMessage::GameHost {
                title,
                featured_mod,
                mapname,
                visibility,
                password,
            } => {
                self.handle_game_host(title, featured_mod, mapname, visibility, password)
                    .await;
                Ok(())
            }
            ClientMessage::GameJoin { uid, password } => {
                self.handle_game_join(uid, password).await;
                Ok(())
            }
            ClientMessage::GameStart => {
                self.handle_game_start().await;
                Ok(())
            }
            ClientMessage::GameLeave => {
                self.handle_game_leave().await;
                Ok(())
            }
            ClientMessage::GameList => {
                self.handle_game_list().await;
                Ok(())
            }
            ClientMessage::Matchmaking { action } => {
                self.handle_matchmaking(action).await;
                Ok(())
            }
        }
    }

    async fn sync_with_player(&mut self) {
        let Some(player) = &self.player else { return };
        let in_game = player.read().await.state() != PlayerState::Idle;
        self.state = match (self.state, in_game) {
            (SessionState::InLobby | SessionState::Authenticated, true) => SessionState::InGame,
            (SessionState::InGame, false) => SessionState::InLobby,
            (state, _) => state,
        };
    }

    async fn handle_hello(
        &mut self,
        login: String,
        password: String,
        version: String,
        unique_id: String,
        game_port: u16,
    ) {
        if self.state != SessionState::Connected {
            self.send(ServerMessage::info("You are already logged in."));
            return;
        }

        let record = match self.services.store.authenticate(&login, &password).await {
            Ok(record) => record,
            Err(StoreError::AuthFailure) => {
                // Fixed text; the connection stays open for another attempt.
                info!("failed login for {:?} from {}", login, self.addr);
                self.send(ServerMessage::error(LOGIN_FAILURE_TEXT));
                return;
            }
            Err(e) => {
                warn!("datastore error during login of {:?}: {}", login, e);
                self.send(ServerMessage::error(TEMPORARY_FAILURE_TEXT));
                return;
            }
        };

        let (global_rating, ladder_rating) =
            match self.services.store.load_ratings(record.id).await {
                Ok(ratings) => ratings,
                Err(e) => {
                    warn!("failed to load ratings for {}: {}", record.login, e);
                    self.send(ServerMessage::error(TEMPORARY_FAILURE_TEXT));
                    return;
                }
            };

        let session = derive_session_seed(&record.login, &unique_id, &Uuid::new_v4().into_bytes());
        let player = Arc::new(RwLock::new(Player::new(
            record.id,
            &record.login,
            self.addr.ip(),
            game_port,
            session,
            global_rating,
            ladder_rating,
            self.outbound.clone(),
            self.close_tx.clone(),
        )));

        // Newest connection wins: at most one displacement round.
        let mut registered = false;
        for _ in 0..2 {
            match self.services.players.register(player.clone()).await {
                Ok(()) => {
                    registered = true;
                    break;
                }
                Err(RegistryError::DuplicateIdentity(_)) => {
                    if let Some(prev) = self.services.players.displace(&record.login).await {
                        let prev_id = prev.read().await.id;
                        let ended = self.services.games.remove_player(prev_id).await;
                        self.persist_ended(&ended).await;
                        self.services.matchmaker.dequeue(prev_id);
                        prev.read().await.request_close(CloseReason::Kicked);
                        info!("displaced previous session of {}", record.login);
                    }
                }
            }
        }
        if !registered {
            self.send(ServerMessage::error(TEMPORARY_FAILURE_TEXT));
            return;
        }

        self.player = Some(player);
        self.state = SessionState::Authenticated;
        info!(
            "{} (id {}) logged in from {} with client {}",
            record.login, record.id, self.addr, version
        );
        self.send(ServerMessage::Welcome {
            id: record.id,
            login: record.login,
            session,
        });
    }

    async fn handle_game_host(
        &mut self,
        title: String,
        featured_mod: String,
        mapname: String,
        visibility: GameVisibility,
        password: Option<String>,
    ) {
        let Some(player) = self.player.clone() else { return };
        let (id, login, state) = {
            let p = player.read().await;
            (p.id, p.login.clone(), p.state())
        };

        if state != PlayerState::Idle {
            self.send(ServerMessage::error("You are already in a game."));
            return;
        }

        let game = match self
            .services
            .games
            .create_game(
                &featured_mod,
                id,
                &login,
                &title,
                &mapname,
                visibility,
                password,
            )
            .await
        {
            Ok(game) => game,
            Err(e) => {
                self.send(ServerMessage::error(e.to_string()));
                return;
            }
        };

        let (uid, mapname) = {
            let g = game.read().await;
            (g.id, g.mapname.clone())
        };
        {
            let mut p = player.write().await;
            // Idle -> Hosting is always legal.
            let _ = p.transition(PlayerState::Hosting);
            p.current_game = Some(uid);
        }
        self.services.matchmaker.dequeue(id);
        self.state = SessionState::InGame;
        self.send(ServerMessage::GameLaunch {
            uid,
            mapname,
            featured_mod,
            host: None,
        });
    }

    async fn handle_game_join(&mut self, uid: u32, password: Option<String>) {
        let Some(player) = self.player.clone() else { return };
        let (id, state) = {
            let p = player.read().await;
            (p.id, p.state())
        };

        if state != PlayerState::Idle {
            self.send(ServerMessage::error("You are already in a game."));
            return;
        }

        let Some(game) = self.services.games.find_by_id(uid).await else {
            self.send(ServerMessage::error(GameError::NotFound(uid).to_string()));
            return;
        };

        let join = {
            let mut g = game.write().await;
            g.add_player(id, password.as_deref())
        };
        if let Err(e) = join {
            // Validation failed: no state was mutated.
            self.send(ServerMessage::error(e.to_string()));
            return;
        }

        let (mapname, featured_mod, host) = {
            let g = game.read().await;
            let host = self.services.players.get(g.host_id).await;
            let host_address = match host {
                Some(h) => Some(h.read().await.game_address()),
                None => None,
            };
            (g.mapname.clone(), g.featured_mod.clone(), host_address)
        };
        {
            let mut p = player.write().await;
            let _ = p.transition(PlayerState::Joining);
            p.current_game = Some(uid);
        }
        self.services.matchmaker.dequeue(id);
        self.services.games.mark_dirty(uid);
        self.state = SessionState::InGame;
        self.send(ServerMessage::GameLaunch {
            uid,
            mapname,
            featured_mod,
            host,
        });
    }

    async fn handle_game_start(&mut self) {
        let Some(player) = self.player.clone() else { return };
        let (id, current_game) = {
            let p = player.read().await;
            (p.id, p.current_game)
        };

        let Some(uid) = current_game else {
            self.send(ServerMessage::error("You are not in a game."));
            return;
        };
        let Some(game) = self.services.games.find_by_id(uid).await else {
            self.send(ServerMessage::error(GameError::NotFound(uid).to_string()));
            return;
        };

        let result = {
            let mut g = game.write().await;
            if !g.is_host(id) {
                Err("Only the host can start the game.".to_string())
            } else {
                g.transition(GameState::Live).map_err(|e| e.to_string())
            }
        };

        match result {
            Ok(()) => {
                self.services.games.mark_dirty(uid);
                debug!("game {} went live", uid);
            }
            Err(text) => self.send(ServerMessage::error(text)),
        }
    }

    async fn handle_game_leave(&mut self) {
        let Some(player) = self.player.clone() else { return };
        let (id, current_game) = {
            let p = player.read().await;
            (p.id, p.current_game)
        };
        if current_game.is_none() {
            return;
        }

        let ended = self.services.games.remove_player(id).await;
        self.persist_ended(&ended).await;
        {
            let mut p = player.write().await;
            let _ = p.transition(PlayerState::Idle);
            p.current_game = None;
        }
        self.state = SessionState::InLobby;
    }

    async fn handle_game_list(&mut self) {
        if self.state == SessionState::Authenticated {
            self.state = SessionState::InLobby;
        }
        for info in self.services.games.list_open_listable().await {
            self.send(ServerMessage::GameInfo(info));
        }
    }

    async fn handle_matchmaking(&mut self, action: MatchmakingAction) {
        let Some(player) = self.player.clone() else { return };
        let (id, state) = {
            let p = player.read().await;
            (p.id, p.state())
        };

        match action {
            MatchmakingAction::Start => {
                if state != PlayerState::Idle {
                    self.send(ServerMessage::error("You are already in a game."));
                    return;
                }
                self.services.matchmaker.enqueue(id);
                self.send(ServerMessage::MatchmakingInfo {
                    state: MatchmakingState::Searching,
                });
            }
            MatchmakingAction::Stop => {
                self.services.matchmaker.dequeue(id);
                self.send(ServerMessage::MatchmakingInfo {
                    state: MatchmakingState::Stopped,
                });
            }
        }
    }

    async fn persist_ended(&self, ended: &[u32]) {
        for &uid in ended {
            let Some(game) = self.services.games.find_by_id(uid).await else {
                continue;
            };
            let result = {
                let g = game.read().await;
                if g.launched_at.is_none() {
                    // Lobby never went live; nothing worth recording.
                    continue;
                }
                GameResult {
                    game_uuid: g.uuid,
                    featured_mod: g.featured_mod.clone(),
                    mapname: g.mapname.clone(),
                    players: g.teams().values().flatten().copied().collect(),
                }
            };
            if let Err(e) = self.services.store.persist_game_result(&result).await {
                warn!("failed to persist result of game {}: {}", uid, e);
            }
        }
    }

    /// Tear the session down. Idempotent; completes every detachment before
    /// returning so no other task can observe a half-removed player.
    pub async fn close(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        let Some(player) = self.player.take() else {
            debug!("session {} closed ({:?})", self.addr, reason);
            return;
        };

        let (id, login) = {
            let p = player.read().await;
            (p.id, p.login.clone())
        };

        self.services.matchmaker.dequeue(id);

        // A displaced session's registry entry (and games) were already
        // taken over by its successor; only the owning handle detaches.
        if self.services.players.unregister(&player).await {
            let ended = self.services.games.remove_player(id).await;
            self.persist_ended(&ended).await;
        }

        info!("session of {} closed ({:?})", login, reason);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::game::GameVisibility;
    use crate::lobby::matchmaker::LADDER_MODE;
    use crate::network::protocol::NoticeStyle;
    use crate::store::{Account, MemoryStore};

    struct Harness {
        session: LobbySession,
        outbound: mpsc::Receiver<ServerMessage>,
        services: Services,
        #[allow(dead_code)]
        close_rx: mpsc::Receiver<CloseReason>,
    }

    async fn harness() -> Harness {
        harness_at("127.0.0.1:50000".parse().unwrap()).await
    }

    async fn harness_at(addr: SocketAddr) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.insert_account(
            "Paula_Bean",
            Account {
                id: 1,
                password: "epic".to_string(),
                global_rating: Default::default(),
                ladder_rating: Default::default(),
            },
        );
        store.insert_account(
            "That_Guy",
            Account {
                id: 2,
                password: "epic".to_string(),
                global_rating: Default::default(),
                ladder_rating: Default::default(),
            },
        );
        store.set_popular_maps(vec!["scmp_007".to_string()]);

        let players = Arc::new(PlayerRegistry::new());
        let games = Arc::new(GameRegistry::default());
        games.add_container("vanguard", "Vanguard Standard", true).await;
        games.add_container(LADDER_MODE, "Ranked 1v1 Ladder", false).await;
        let matchmaker = Arc::new(Matchmaker::new(
            games.clone(),
            players.clone(),
            store.clone(),
            7,
        ));
        let services = Services {
            players,
            games,
            matchmaker,
            store,
        };

        let (out_tx, out_rx) = mpsc::channel(32);
        let (close_tx, close_rx) = mpsc::channel(4);
        Harness {
            session: LobbySession::new(addr, services.clone(), out_tx, close_tx),
            outbound: out_rx,
            services,
            close_rx,
        }
    }

    fn hello(login: &str, password: &str) -> ClientMessage {
        ClientMessage::Hello {
            login: login.to_string(),
            password: password.to_string(),
            version: "0.3.0".to_string(),
            unique_id: "install-1".to_string(),
            game_port: 6112,
        }
    }

    async fn login(h: &mut Harness) {
        h.session.handle_message(hello("Paula_Bean", "epic")).await.unwrap();
        match h.outbound.recv().await.unwrap() {
            ServerMessage::Welcome { .. } => {}
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    fn host_cmd() -> ClientMessage {
        ClientMessage::GameHost {
            title: "Test".to_string(),
            featured_mod: "vanguard".to_string(),
            mapname: "SCMP_007".to_string(),
            visibility: GameVisibility::Public,
            password: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_login_gets_fixed_notice_and_stays_open() {
        let mut h = harness().await;
        h.session.handle_message(hello("Cat", "epic")).await.unwrap();

        match h.outbound.recv().await.unwrap() {
            ServerMessage::Notice { style, text } => {
                assert_eq!(style, NoticeStyle::Error);
                assert_eq!(text, LOGIN_FAILURE_TEXT);
            }
            other => panic!("expected notice, got {other:?}"),
        }

        // Session remains connected and can retry.
        assert_eq!(h.session.state(), SessionState::Connected);
        login(&mut h).await;
        assert_eq!(h.session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_wrong_password_same_notice() {
        let mut h = harness().await;
        h.session
            .handle_message(hello("Paula_Bean", "wrong"))
            .await
            .unwrap();
        match h.outbound.recv().await.unwrap() {
            ServerMessage::Notice { text, .. } => assert_eq!(text, LOGIN_FAILURE_TEXT),
            other => panic!("expected notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_command_before_auth_rejected() {
        let mut h = harness().await;
        let err = h.session.handle_message(ClientMessage::GameList).await;
        assert!(matches!(err, Err(SessionError::AuthRequired)));

        // The only reply is an error notice; no game data leaked.
        match h.outbound.recv().await.unwrap() {
            ServerMessage::Notice { style, text } => {
                assert_eq!(style, NoticeStyle::Error);
                assert_eq!(text, AUTH_REQUIRED_TEXT);
            }
            other => panic!("expected notice, got {other:?}"),
        }
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_gated_until_auth() {
        let mut h = harness().await;
        let err = h
            .session
            .handle_message(ClientMessage::Ping { timestamp: 42 })
            .await;
        assert!(matches!(err, Err(SessionError::AuthRequired)));
        h.outbound.recv().await.unwrap();

        login(&mut h).await;
        h.session
            .handle_message(ClientMessage::Ping { timestamp: 42 })
            .await
            .unwrap();
        assert_eq!(
            h.outbound.recv().await.unwrap(),
            ServerMessage::Pong { timestamp: 42 }
        );
    }

    #[tokio::test]
    async fn test_login_registers_player() {
        let mut h = harness().await;
        login(&mut h).await;
        assert_eq!(h.services.players.player_count().await, 1);
        let player = h.services.players.get(1).await.unwrap();
        assert_eq!(player.read().await.login, "Paula_Bean");
    }

    #[tokio::test]
    async fn test_duplicate_login_displaces_previous() {
        let mut first = harness().await;
        login(&mut first).await;

        let mut second = harness_at("127.0.0.1:50001".parse().unwrap()).await;
        // Second harness must share the first's services.
        second.services = first.services.clone();
        second.session = LobbySession::new(
            "127.0.0.1:50001".parse().unwrap(),
            first.services.clone(),
            second.session.outbound.clone(),
            second.session.close_tx.clone(),
        );
        login(&mut second).await;

        // First session was asked to close and its registration replaced.
        assert_eq!(first.close_rx.recv().await, Some(CloseReason::Kicked));
        assert_eq!(first.services.players.player_count().await, 1);
        let current = first.services.players.get(1).await.unwrap();
        assert!(Arc::ptr_eq(&current, second.session.player().unwrap()));

        // The displaced session's close must not remove the new entry.
        first.session.close(CloseReason::Kicked).await;
        assert_eq!(first.services.players.player_count().await, 1);
    }

    #[tokio::test]
    async fn test_host_game_flow() {
        let mut h = harness().await;
        login(&mut h).await;

        h.session.handle_message(host_cmd()).await.unwrap();
        match h.outbound.recv().await.unwrap() {
            ServerMessage::GameLaunch { uid, mapname, .. } => {
                assert_eq!(mapname, "SCMP_007");
                assert!(h.services.games.find_by_id(uid).await.is_some());
            }
            other => panic!("expected game_launch, got {other:?}"),
        }
        assert_eq!(h.session.state(), SessionState::InGame);

        let player = h.services.players.get(1).await.unwrap();
        assert_eq!(player.read().await.state(), PlayerState::Hosting);

        // Hosting twice is rejected.
        h.session.handle_message(host_cmd()).await.unwrap();
        match h.outbound.recv().await.unwrap() {
            ServerMessage::Notice { style, .. } => assert_eq!(style, NoticeStyle::Error),
            other => panic!("expected notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_validations() {
        let mut host = harness().await;
        login(&mut host).await;
        host.session.handle_message(host_cmd()).await.unwrap();
        let uid = match host.outbound.recv().await.unwrap() {
            ServerMessage::GameLaunch { uid, .. } => uid,
            other => panic!("expected game_launch, got {other:?}"),
        };

        let mut joiner = harness_at("127.0.0.1:50002".parse().unwrap()).await;
        joiner.services = host.services.clone();
        joiner.session = LobbySession::new(
            "127.0.0.1:50002".parse().unwrap(),
            host.services.clone(),
            joiner.session.outbound.clone(),
            joiner.session.close_tx.clone(),
        );
        joiner
            .session
            .handle_message(hello("That_Guy", "epic"))
            .await
            .unwrap();
        joiner.outbound.recv().await.unwrap();

        // Unknown game id.
        joiner
            .session
            .handle_message(ClientMessage::GameJoin {
                uid: uid + 999,
                password: None,
            })
            .await
            .unwrap();
        match joiner.outbound.recv().await.unwrap() {
            ServerMessage::Notice { style, .. } => assert_eq!(style, NoticeStyle::Error),
            other => panic!("expected notice, got {other:?}"),
        }

        // Successful join.
        joiner
            .session
            .handle_message(ClientMessage::GameJoin {
                uid,
                password: None,
            })
            .await
            .unwrap();
        match joiner.outbound.recv().await.unwrap() {
            ServerMessage::GameLaunch { uid: joined, host: host_addr, .. } => {
                assert_eq!(joined, uid);
                assert_eq!(host_addr.as_deref(), Some("127.0.0.1:6112"));
            }
            other => panic!("expected game_launch, got {other:?}"),
        }

        let game = host.services.games.find_by_id(uid).await.unwrap();
        assert!(game.read().await.contains(2));
    }

    #[tokio::test]
    async fn test_game_list_renders_open_games() {
        let mut host = harness().await;
        login(&mut host).await;
        host.session.handle_message(host_cmd()).await.unwrap();
        host.outbound.recv().await.unwrap();

        let mut watcher = harness_at("127.0.0.1:50003".parse().unwrap()).await;
        watcher.services = host.services.clone();
        watcher.session = LobbySession::new(
            "127.0.0.1:50003".parse().unwrap(),
            host.services.clone(),
            watcher.session.outbound.clone(),
            watcher.session.close_tx.clone(),
        );
        watcher
            .session
            .handle_message(hello("That_Guy", "epic"))
            .await
            .unwrap();
        watcher.outbound.recv().await.unwrap();

        watcher
            .session
            .handle_message(ClientMessage::GameList)
            .await
            .unwrap();
        match watcher.outbound.recv().await.unwrap() {
            ServerMessage::GameInfo(info) => {
                assert_eq!(info.title, "Test");
                assert_eq!(info.mapname, "scmp_007");
                assert_eq!(info.host, "Paula_Bean");
                assert!(info.teams.values().all(|t| !t.is_empty()));
            }
            other => panic!("expected game_info, got {other:?}"),
        }
        assert_eq!(watcher.session.state(), SessionState::InLobby);
    }

    #[tokio::test]
    async fn test_game_start_host_only() {
        let mut h = harness().await;
        login(&mut h).await;
        h.session.handle_message(host_cmd()).await.unwrap();
        let uid = match h.outbound.recv().await.unwrap() {
            ServerMessage::GameLaunch { uid, .. } => uid,
            other => panic!("expected game_launch, got {other:?}"),
        };

        h.session.handle_message(ClientMessage::GameStart).await.unwrap();
        let game = h.services.games.find_by_id(uid).await.unwrap();
        assert_eq!(game.read().await.state(), GameState::Live);
        assert!(game.read().await.launched_at.is_some());

        // Starting again is an illegal transition, reported as a notice.
        h.session.handle_message(ClientMessage::GameStart).await.unwrap();
        match h.outbound.recv().await.unwrap() {
            ServerMessage::Notice { style, .. } => assert_eq!(style, NoticeStyle::Error),
            other => panic!("expected notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_matchmaking_queue_commands() {
        let mut h = harness().await;
        login(&mut h).await;

        h.session
            .handle_message(ClientMessage::Matchmaking {
                action: MatchmakingAction::Start,
            })
            .await
            .unwrap();
        assert_eq!(
            h.outbound.recv().await.unwrap(),
            ServerMessage::MatchmakingInfo {
                state: MatchmakingState::Searching
            }
        );
        assert_eq!(h.services.matchmaker.queue_len(), 1);

        h.session
            .handle_message(ClientMessage::Matchmaking {
                action: MatchmakingAction::Stop,
            })
            .await
            .unwrap();
        assert_eq!(
            h.outbound.recv().await.unwrap(),
            ServerMessage::MatchmakingInfo {
                state: MatchmakingState::Stopped
            }
        );
        assert_eq!(h.services.matchmaker.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_close_detaches_everything() {
        let mut h = harness().await;
        login(&mut h).await;
        h.session.handle_message(host_cmd()).await.unwrap();
        let uid = match h.outbound.recv().await.unwrap() {
            ServerMessage::GameLaunch { uid, .. } => uid,
            other => panic!("expected game_launch, got {other:?}"),
        };
        h.services.games.drain_dirty();

        h.session.close(CloseReason::Disconnected).await;
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.services.players.player_count().await, 0);

        // Host leaving ended the game; it is dirty and out of the listing.
        let game = h.services.games.find_by_id(uid).await.unwrap();
        assert_eq!(game.read().await.state(), GameState::Ended);
        assert!(h.services.games.drain_dirty().contains(&uid));
        assert!(h.services.games.list_open_listable().await.is_empty());

        // Idempotent.
        h.session.close(CloseReason::Disconnected).await;
        assert_eq!(h.services.players.player_count().await, 0);
    }

    #[tokio::test]
    async fn test_nonhost_leave_updates_team_assignment() {
        let mut host = harness().await;
        login(&mut host).await;
        host.session.handle_message(host_cmd()).await.unwrap();
        let uid = match host.outbound.recv().await.unwrap() {
            ServerMessage::GameLaunch { uid, .. } => uid,
            other => panic!("expected game_launch, got {other:?}"),
        };

        let mut joiner = harness_at("127.0.0.1:50004".parse().unwrap()).await;
        joiner.services = host.services.clone();
        joiner.session = LobbySession::new(
            "127.0.0.1:50004".parse().unwrap(),
            host.services.clone(),
            joiner.session.outbound.clone(),
            joiner.session.close_tx.clone(),
        );
        joiner
            .session
            .handle_message(hello("That_Guy", "epic"))
            .await
            .unwrap();
        joiner.outbound.recv().await.unwrap();
        joiner
            .session
            .handle_message(ClientMessage::GameJoin { uid, password: None })
            .await
            .unwrap();
        joiner.outbound.recv().await.unwrap();

        joiner.session.close(CloseReason::Disconnected).await;

        let game = host.services.games.find_by_id(uid).await.unwrap();
        let g = game.read().await;
        assert_eq!(g.state(), GameState::LobbyOpen);
        assert!(!g.contains(2));
        assert!(g.contains(1));
    }

    #[tokio::test]
    async fn test_backpressure_requests_close() {
        let store = Arc::new(MemoryStore::new());
        let players = Arc::new(PlayerRegistry::new());
        let games = Arc::new(GameRegistry::default());
        let matchmaker = Arc::new(Matchmaker::new(
            games.clone(),
            players.clone(),
            store.clone(),
            7,
        ));
        let services = Services {
            players,
            games,
            matchmaker,
            store,
        };

        // Outbound queue of one, never drained.
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (close_tx, mut close_rx) = mpsc::channel(4);
        let mut session = LobbySession::new(
            "127.0.0.1:50005".parse().unwrap(),
            services,
            out_tx,
            close_tx,
        );

        // Each rejected command queues an error notice; the first fills the
        // queue, the second cannot be queued and trips the policy.
        let _ = session
            .handle_message(ClientMessage::Ping { timestamp: 1 })
            .await;
        let _ = session
            .handle_message(ClientMessage::Ping { timestamp: 2 })
            .await;

        assert_eq!(close_rx.recv().await, Some(CloseReason::Backpressure));
    }
}
