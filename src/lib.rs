//! # Vanguard Lobby Server
//!
//! Authoritative lobby and matchmaking server for Vanguard. Authenticates
//! players, tracks who is online, manages hosted game sessions, pairs ranked
//! ladder opponents, and assists NAT traversal for peer-to-peer game traffic.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   VANGUARD LOBBY SERVER                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Deterministic primitives                 │
//! │  └── rng.rs       - Seeded Xorshift128+ PRNG, session tokens │
//! │                                                              │
//! │  lobby/           - Domain state (socket-agnostic)           │
//! │  ├── player.rs    - Player entity and state machine          │
//! │  ├── players.rs   - Online-player registry                   │
//! │  ├── game.rs      - Game entity and lifecycle FSM            │
//! │  ├── games.rs     - Mode containers, dirty set, eviction     │
//! │  └── matchmaker.rs- Ladder queue and map-pool pairing        │
//! │                                                              │
//! │  network/         - Sockets and message flow                 │
//! │  ├── codec.rs     - Length-prefixed JSON framing             │
//! │  ├── protocol.rs  - Command vocabulary (tagged enums)        │
//! │  ├── session.rs   - Per-connection state machine             │
//! │  ├── server.rs    - Accept loop and timer tasks              │
//! │  ├── relay.rs     - UDP NAT traversal relay                  │
//! │  └── control.rs   - Loopback diagnostics endpoint            │
//! │                                                              │
//! │  store.rs         - Datastore trait + in-memory backend      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency Guarantees
//!
//! Per-entity mutation happens only on the owning session's task; the shared
//! registries use coarse locks around insert/remove/list. The dirty-game set
//! is drained atomically once per broadcast cycle: a mutation is announced
//! exactly once, and a mark racing a drain lands in the next cycle rather
//! than being lost. Closing a session detaches its player from the registry
//! and from every game before the close call returns.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod lobby;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use core::rng::{DeterministicRng, Draw};
pub use lobby::game::{Game, GameError, GameId, GameState, GameVisibility};
pub use lobby::games::GameRegistry;
pub use lobby::matchmaker::Matchmaker;
pub use lobby::player::{Player, PlayerState, Rating};
pub use lobby::players::PlayerRegistry;
pub use network::codec::ProtocolError;
pub use network::protocol::{ClientMessage, ServerMessage};
pub use network::relay::NatRelay;
pub use network::server::{LobbyServer, ServerConfig};
pub use network::session::{LobbySession, Services};
pub use store::{Datastore, MemoryStore, StoreError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default lobby TCP port
pub const DEFAULT_LOBBY_PORT: u16 = 8001;

/// Default game/NAT UDP port
pub const DEFAULT_GAME_PORT: u16 = 8000;

/// Default diagnostics port (loopback only)
pub const DEFAULT_CONTROL_PORT: u16 = 4040;
