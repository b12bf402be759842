#![forbid(unsafe_code)]

//! The owner-facing client: configuration, the supervisor task that drives
//! session lifecycle and reconnection, and the teardown path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use barrage_bus::EventBus;
use barrage_domain::RoomId;
use barrage_protocol::FrameLimits;

use crate::api::{Credentials, RoomDirectory};
use crate::reconnect::{ReconnectController, ReconnectDecision, ReconnectPolicy};
use crate::session::{Session, SessionEnd, SharedBus, WsConnector};
use crate::{ClientEvent, ClientEventRx, ClientEventTx, ClientStatus};

/// Client configuration. Defaults target the public upstream endpoints.
#[derive(Clone)]
pub struct ClientConfig {
	/// Room to join (short or canonical id).
	pub room_id: RoomId,
	pub credentials: Credentials,
	/// Overrides the server-advertised chat endpoint.
	pub ws_url_override: Option<String>,
	pub connect_timeout: Duration,
	pub handshake_timeout: Duration,
	pub heartbeat_interval: Duration,
	/// Bound on waiting for loops to observe cancellation.
	pub shutdown_grace: Duration,
	pub frame_limits: FrameLimits,
	pub reconnect: ReconnectPolicy,
	/// Emit a synthetic join the first time a user is sighted.
	pub synthesize_joins: bool,
	pub events_capacity: usize,
	/// Injectable socket factory for tests.
	pub ws_connector: Option<WsConnector>,
}

impl ClientConfig {
	pub fn new(room_id: RoomId) -> Self {
		Self {
			room_id,
			credentials: Credentials::anonymous(),
			ws_url_override: None,
			connect_timeout: Duration::from_secs(10),
			handshake_timeout: Duration::from_secs(3),
			heartbeat_interval: Duration::from_secs(30),
			shutdown_grace: Duration::from_secs(3),
			frame_limits: FrameLimits::default(),
			reconnect: ReconnectPolicy::default(),
			synthesize_joins: true,
			events_capacity: 256,
			ws_connector: None,
		}
	}
}

/// Handle to a running room connection.
///
/// Owns the supervisor task. Normalized events and status changes arrive
/// on the channel returned by [`LiveClient::connect`]; dropping the
/// receiver does not stop the client, only [`LiveClient::disconnect`] does.
pub struct LiveClient {
	bus: SharedBus,
	shutdown: watch::Sender<bool>,
	supervisor: Option<JoinHandle<()>>,
	join_grace: Duration,
}

impl LiveClient {
	/// Spawn the supervisor and return the handle plus the owner channel.
	pub fn connect(cfg: ClientConfig, directory: Arc<dyn RoomDirectory>, bus: EventBus) -> (Self, ClientEventRx) {
		let (events_tx, events_rx) = mpsc::channel(cfg.events_capacity);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let bus = Arc::new(Mutex::new(bus));
		// One session teardown plus slack.
		let join_grace = cfg.shutdown_grace + Duration::from_secs(2);

		let supervisor = tokio::spawn(run_supervisor(cfg, directory, Arc::clone(&bus), events_tx, shutdown_rx));

		(
			Self {
				bus,
				shutdown: shutdown_tx,
				supervisor: Some(supervisor),
				join_grace,
			},
			events_rx,
		)
	}

	/// Shared handle to the extension pipeline, e.g. for toggling
	/// extensions while connected.
	pub fn bus(&self) -> SharedBus {
		Arc::clone(&self.bus)
	}

	/// Idempotent teardown: stops the active session and the supervisor,
	/// waiting a bounded time before aborting.
	pub async fn disconnect(&mut self) {
		let _ = self.shutdown.send(true);
		if let Some(mut task) = self.supervisor.take() {
			if timeout(self.join_grace, &mut task).await.is_err() {
				warn!("supervisor ignored shutdown; aborting");
				task.abort();
			}
		}
	}
}

async fn run_supervisor(
	cfg: ClientConfig,
	directory: Arc<dyn RoomDirectory>,
	bus: SharedBus,
	events_tx: ClientEventTx,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let mut controller = ReconnectController::new(cfg.reconnect.clone());

	loop {
		if *shutdown_rx.borrow() {
			return;
		}

		controller.on_attempt();
		let connected = tokio::select! {
			res = Session::connect(&cfg, &directory, &bus, &events_tx) => res,
			_ = watch_shutdown(&mut shutdown_rx) => return,
		};

		match connected {
			Ok(mut session) => {
				controller.on_success();
				send_status(&events_tx, ClientStatus::Connected { room_id: session.room_id() }).await;

				let end = tokio::select! {
					end = session.wait_end() => end,
					_ = watch_shutdown(&mut shutdown_rx) => SessionEnd::LocalDisconnect,
				};

				// Full teardown before any reconnect: loops joined, socket
				// closed, buffer gone with the session.
				session.disconnect().await;
				send_status(&events_tx, ClientStatus::Disconnected { reason: end.to_string() }).await;
				if end == SessionEnd::LocalDisconnect {
					return;
				}
			}
			Err(err) => {
				warn!(error = %err, "connect attempt failed");
				send_status(&events_tx, ClientStatus::ConnectFailed { error: err.to_string() }).await;
			}
		}

		match controller.next_retry() {
			ReconnectDecision::Disabled => {
				info!("auto-reconnect disabled; stopping");
				return;
			}
			ReconnectDecision::GiveUp { attempts } => {
				warn!(attempts, "reconnect budget exhausted; giving up");
				send_status(&events_tx, ClientStatus::ReconnectExhausted { attempts }).await;
				return;
			}
			ReconnectDecision::Retry { attempt, delay } => {
				metrics::counter!("barrage_reconnect_attempts_total").increment(1);
				send_status(&events_tx, ClientStatus::Reconnecting { attempt, delay }).await;
				tokio::select! {
					_ = sleep(delay) => {}
					_ = watch_shutdown(&mut shutdown_rx) => return,
				}
			}
		}
	}
}

/// Resolves when shutdown is requested (or the handle is gone).
async fn watch_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
	loop {
		if *shutdown_rx.borrow() {
			return;
		}
		if shutdown_rx.changed().await.is_err() {
			return;
		}
	}
}

async fn send_status(events_tx: &ClientEventTx, status: ClientStatus) {
	let _ = events_tx.send(ClientEvent::Status(status)).await;
}
