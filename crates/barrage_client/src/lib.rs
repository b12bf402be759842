#![forbid(unsafe_code)]

pub mod api;
pub mod client;
pub mod normalize;
pub mod reconnect;
pub mod session;
pub mod wbi;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use barrage_domain::{LiveEvent, RoomId};

pub use api::{BiliApiClient, ChatServerHost, ChatServerInfo, Credentials, RoomDirectory, RoomSnapshot};
pub use client::{ClientConfig, LiveClient};
pub use reconnect::{ReconnectController, ReconnectDecision, ReconnectPhase, ReconnectPolicy};
pub use session::{SessionEnd, WsConnector};
pub use wbi::{WbiKeys, WbiSigner};

/// Errors for establishing a room session.
#[derive(Debug, Error)]
pub enum ClientError {
	/// Room-info / chat-server lookup failed.
	#[error("room directory error: {0}")]
	Directory(String),

	/// WebSocket connect failed.
	#[error("websocket connect failed: {0}")]
	Connect(String),

	/// Handshake was rejected or the socket dropped before the reply.
	#[error("handshake failed: {0}")]
	Handshake(String),

	/// A bounded wait expired.
	#[error("timed out waiting for {0}")]
	Timeout(&'static str),
}

/// Connection lifecycle notifications delivered on the owner channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
	Connected {
		room_id: RoomId,
	},

	/// The active session ended (remote close, transport failure, or a
	/// local disconnect).
	Disconnected {
		reason: String,
	},

	/// A connect attempt failed before reaching Connected.
	ConnectFailed {
		error: String,
	},

	/// Backing off before the next attempt.
	Reconnecting {
		attempt: u32,
		delay: Duration,
	},

	/// The retry budget ran out; the client has given up. Terminal.
	ReconnectExhausted {
		attempts: u32,
	},
}

/// Everything the owner receives: normalized room events (after the
/// extension pipeline) plus connection status changes.
#[derive(Debug, Clone)]
pub enum ClientEvent {
	Event(LiveEvent),
	Status(ClientStatus),
}

pub type ClientEventTx = mpsc::Sender<ClientEvent>;
pub type ClientEventRx = mpsc::Receiver<ClientEvent>;
