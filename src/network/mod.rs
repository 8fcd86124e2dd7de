//! Network Layer
//!
//! Length-prefixed TCP protocol, per-connection sessions, the UDP traversal
//! relay, and the loopback diagnostics endpoint. All lobby state lives in
//! `lobby/`; this layer owns sockets and message flow.

pub mod codec;
pub mod control;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;

pub use codec::{read_frame, read_message, write_frame, write_message, ProtocolError, MAX_FRAME_SIZE};
pub use control::run_control_server;
pub use protocol::{ClientMessage, GameInfoMessage, NoticeStyle, ServerMessage};
pub use relay::{NatRelay, RelayEnvelope};
pub use server::{LobbyServer, ServerConfig, ServerError};
pub use session::{LobbySession, Services, SessionError, SessionState, LOGIN_FAILURE_TEXT};
