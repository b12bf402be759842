#![forbid(unsafe_code)]

//! One live chat connection: socket, handshake, heartbeat and read loops.
//!
//! A `Session` is single-use. It is built by `connect`, runs until the
//! remote drops it or `disconnect` is called, and is then discarded; the
//! supervisor builds a fresh one to reconnect, so no two sessions ever
//! share a socket or buffer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use barrage_bus::EventBus;
use barrage_domain::RoomId;
use barrage_protocol::{Frame, FrameLimits, Operation, compress, encode_frame, split_frames};

use crate::api::{ChatServerInfo, RoomDirectory};
use crate::client::ClientConfig;
use crate::normalize::Normalizer;
use crate::{ClientError, ClientEvent, ClientEventTx};

pub const DEFAULT_WS_URL: &str = "wss://broadcastlv.chat.bilibili.com/sub";

/// The heartbeat body the web client sends; the server ignores it.
const HEARTBEAT_BODY: &[u8] = b"[object Object]";
/// Outbound frames advertise protocol version 1.
const OUTBOUND_PROTOCOL_VERSION: u16 = 1;
/// Give up on the socket after this many back-to-back read errors.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Injectable socket factory; tests swap the dialer out.
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<WsStream>> + Send + Sync>;

pub type SharedBus = Arc<Mutex<EventBus>>;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
	RemoteClosed,
	TransportError(String),
	LocalDisconnect,
}

impl fmt::Display for SessionEnd {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SessionEnd::RemoteClosed => f.write_str("remote closed"),
			SessionEnd::TransportError(err) => write!(f, "transport error: {err}"),
			SessionEnd::LocalDisconnect => f.write_str("local disconnect"),
		}
	}
}

/// A live connection to one room.
pub struct Session {
	room_id: RoomId,
	writer: Arc<Mutex<WsSink>>,
	running: Arc<watch::Sender<bool>>,
	heartbeat_task: Option<JoinHandle<()>>,
	receive_task: Option<JoinHandle<()>>,
	end_rx: Option<oneshot::Receiver<SessionEnd>>,
	shutdown_grace: Duration,
}

impl Session {
	/// Resolve the room, open the socket, perform the handshake and start
	/// the heartbeat and read loops. Exactly one handshake frame goes out
	/// per call.
	pub(crate) async fn connect(
		cfg: &ClientConfig,
		directory: &Arc<dyn RoomDirectory>,
		bus: &SharedBus,
		events_tx: &ClientEventTx,
	) -> Result<Session, ClientError> {
		let snapshot = directory
			.room_info(cfg.room_id)
			.await
			.map_err(|e| ClientError::Directory(format!("{e:#}")))?;
		let room_id = snapshot.room_id;

		let chat_info = directory
			.chat_server_info(room_id)
			.await
			.map_err(|e| ClientError::Directory(format!("{e:#}")))?;

		let url = resolve_ws_url(cfg, &chat_info)?;
		info!(room = %room_id, url = %url, live_status = snapshot.live_status, "connecting chat socket");

		let connector = cfg.ws_connector.clone().unwrap_or_else(default_connector);
		let ws = match timeout(cfg.connect_timeout, connector(url)).await {
			Ok(Ok(ws)) => ws,
			Ok(Err(err)) => return Err(ClientError::Connect(format!("{err:#}"))),
			Err(_) => return Err(ClientError::Timeout("websocket connect")),
		};

		let (mut sink, mut stream) = ws.split();

		let hello = json!({
			"uid": cfg.credentials.uid,
			"roomid": room_id.as_u64(),
			"protover": 3,
			"platform": "web",
			"type": 2,
			"key": chat_info.token,
		});
		let handshake = encode_frame(Operation::Auth, OUTBOUND_PROTOCOL_VERSION, 1, hello.to_string().as_bytes());
		if let Err(err) = sink.send(Message::binary(handshake)).await {
			return Err(ClientError::Handshake(format!("send: {err}")));
		}

		// Wait for the reply; frames riding in the same reads are kept and
		// routed once the loops start.
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut pending: Vec<Frame> = Vec::new();
		match timeout(
			cfg.handshake_timeout,
			wait_for_handshake_reply(&mut stream, &mut buf, &mut pending, &cfg.frame_limits),
		)
		.await
		{
			Ok(Ok(())) => {}
			Ok(Err(reason)) => {
				let _ = sink.close().await;
				return Err(ClientError::Handshake(reason));
			}
			Err(_) => {
				let _ = sink.close().await;
				return Err(ClientError::Timeout("handshake reply"));
			}
		}

		metrics::counter!("barrage_sessions_connected_total").increment(1);

		let writer = Arc::new(Mutex::new(sink));
		let (running_tx, running_rx) = watch::channel(true);
		let running = Arc::new(running_tx);
		let (end_tx, end_rx) = oneshot::channel();

		let heartbeat_task = tokio::spawn(run_heartbeat(
			Arc::clone(&writer),
			running_rx.clone(),
			cfg.heartbeat_interval,
		));
		let receive_task = tokio::spawn(run_receive(ReceiveLoop {
			stream,
			buf,
			pending,
			writer: Arc::clone(&writer),
			router: Router {
				limits: cfg.frame_limits.clone(),
				normalizer: Normalizer::new(cfg.synthesize_joins),
				bus: Arc::clone(bus),
				events_tx: events_tx.clone(),
			},
			running: Arc::clone(&running),
			running_rx,
			end_tx,
		}));

		Ok(Session {
			room_id,
			writer,
			running,
			heartbeat_task: Some(heartbeat_task),
			receive_task: Some(receive_task),
			end_rx: Some(end_rx),
			shutdown_grace: cfg.shutdown_grace,
		})
	}

	pub fn room_id(&self) -> RoomId {
		self.room_id
	}

	/// Wait for the session to stop on its own.
	pub async fn wait_end(&mut self) -> SessionEnd {
		match self.end_rx.take() {
			Some(end_rx) => end_rx
				.await
				.unwrap_or_else(|_| SessionEnd::TransportError("receive loop vanished".to_string())),
			None => SessionEnd::LocalDisconnect,
		}
	}

	/// Idempotent teardown: stop both loops (bounded wait, abort on
	/// expiry), then close the socket. Safe to call at any point after
	/// construction, including after the session already ended.
	pub async fn disconnect(&mut self) {
		let _ = self.running.send(false);

		for task in [self.heartbeat_task.take(), self.receive_task.take()].into_iter().flatten() {
			let mut task = task;
			if timeout(self.shutdown_grace, &mut task).await.is_err() {
				warn!(room = %self.room_id, "session task ignored shutdown; aborting");
				task.abort();
			}
		}

		let _ = self.writer.lock().await.close().await;
		debug!(room = %self.room_id, "session torn down");
	}
}

fn resolve_ws_url(cfg: &ClientConfig, info: &ChatServerInfo) -> Result<Url, ClientError> {
	let raw = if let Some(override_url) = &cfg.ws_url_override {
		override_url.clone()
	} else if let Some(host) = info.hosts.iter().find(|h| !h.host.is_empty() && h.wss_port != 0) {
		format!("wss://{}:{}/sub", host.host, host.wss_port)
	} else {
		DEFAULT_WS_URL.to_string()
	};
	Url::parse(&raw).map_err(|e| ClientError::Connect(format!("invalid ws url {raw}: {e}")))
}

fn default_connector() -> WsConnector {
	Arc::new(|url: Url| {
		Box::pin(async move {
			let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
				.await
				.context("connect_async to chat endpoint")?;
			Ok(ws)
		}) as BoxFuture<'static, anyhow::Result<WsStream>>
	})
}

async fn wait_for_handshake_reply(
	stream: &mut SplitStream<WsStream>,
	buf: &mut BytesMut,
	pending: &mut Vec<Frame>,
	limits: &FrameLimits,
) -> Result<(), String> {
	loop {
		match stream.next().await {
			Some(Ok(Message::Binary(data))) => {
				buf.extend_from_slice(&data);
				let report = split_frames(buf, limits);
				let mut got_reply = false;
				for frame in report.frames {
					if frame.header.operation.is_handshake_reply() {
						debug!(body_len = frame.body.len(), "handshake reply received");
						got_reply = true;
					}
					pending.push(frame);
				}
				if got_reply {
					return Ok(());
				}
			}
			Some(Ok(Message::Close(_))) | None => return Err("socket closed before handshake reply".to_string()),
			Some(Ok(_)) => {}
			Some(Err(err)) => return Err(err.to_string()),
		}
	}
}

async fn run_heartbeat(writer: Arc<Mutex<WsSink>>, mut running_rx: watch::Receiver<bool>, interval: Duration) {
	// The handshake used sequence 1.
	let mut sequence: u32 = 2;

	loop {
		if !*running_rx.borrow() {
			return;
		}

		let frame = encode_frame(Operation::Heartbeat, OUTBOUND_PROTOCOL_VERSION, sequence, HEARTBEAT_BODY);
		if let Err(err) = writer.lock().await.send(Message::binary(frame)).await {
			// The read loop notices a dead socket; nothing to do here.
			warn!(error = %err, "heartbeat send failed");
		} else {
			debug!(sequence, "heartbeat sent");
		}
		sequence = sequence.wrapping_add(1);

		tokio::select! {
			_ = sleep(interval) => {}
			changed = running_rx.changed() => {
				if changed.is_err() || !*running_rx.borrow() {
					return;
				}
			}
		}
	}
}

struct Router {
	limits: FrameLimits,
	normalizer: Normalizer,
	bus: SharedBus,
	events_tx: ClientEventTx,
}

impl Router {
	/// Split the buffer and push every resulting event through the
	/// extension pipeline, in arrival order.
	async fn drain(&mut self, buf: &mut BytesMut) {
		let report = split_frames(buf, &self.limits);
		if report.skipped_bytes > 0 {
			metrics::counter!("barrage_resync_skipped_bytes_total").increment(report.skipped_bytes as u64);
			warn!(skipped = report.skipped_bytes, "resynchronized chat stream");
		}
		if report.discarded_bytes > 0 {
			metrics::counter!("barrage_buffer_discards_total").increment(1);
			warn!(discarded = report.discarded_bytes, "discarded unframeable buffer");
		}

		for frame in report.frames {
			self.route_frame(frame).await;
		}
	}

	async fn route_frame(&mut self, frame: Frame) {
		let leaves = match compress::expand(frame, &self.limits) {
			Ok(leaves) => leaves,
			Err(err) => {
				metrics::counter!("barrage_frame_drops_total").increment(1);
				warn!(error = %err, "dropping undecodable frame");
				return;
			}
		};

		for leaf in leaves {
			metrics::counter!("barrage_frames_total").increment(1);
			for event in self.normalizer.apply(&leaf) {
				let event = self.bus.lock().await.dispatch(event).await;
				metrics::counter!("barrage_events_total", "kind" => event.kind()).increment(1);
				if self.events_tx.send(ClientEvent::Event(event)).await.is_err() {
					debug!("event receiver dropped");
				}
			}
		}
	}
}

struct ReceiveLoop {
	stream: SplitStream<WsStream>,
	buf: BytesMut,
	pending: Vec<Frame>,
	writer: Arc<Mutex<WsSink>>,
	router: Router,
	running: Arc<watch::Sender<bool>>,
	running_rx: watch::Receiver<bool>,
	end_tx: oneshot::Sender<SessionEnd>,
}

async fn run_receive(rl: ReceiveLoop) {
	let ReceiveLoop {
		mut stream,
		mut buf,
		pending,
		writer,
		mut router,
		running,
		mut running_rx,
		end_tx,
	} = rl;

	// Frames that arrived alongside the handshake reply.
	for frame in pending {
		router.route_frame(frame).await;
	}

	let mut read_errors: u32 = 0;
	let end = loop {
		tokio::select! {
			changed = running_rx.changed() => {
				if changed.is_err() || !*running_rx.borrow() {
					break SessionEnd::LocalDisconnect;
				}
			}
			message = stream.next() => {
				let Some(message) = message else {
					break SessionEnd::RemoteClosed;
				};
				match message {
					Ok(Message::Binary(data)) => {
						read_errors = 0;
						buf.extend_from_slice(&data);
						router.drain(&mut buf).await;
					}
					Ok(Message::Ping(payload)) => {
						let _ = writer.lock().await.send(Message::Pong(payload)).await;
					}
					Ok(Message::Close(frame)) => {
						debug!(?frame, "server closed chat socket");
						break SessionEnd::RemoteClosed;
					}
					Ok(_) => {}
					Err(err) => {
						use tokio_tungstenite::tungstenite::Error as WsError;
						match err {
							WsError::ConnectionClosed | WsError::AlreadyClosed => break SessionEnd::RemoteClosed,
							other => {
								// Transient read errors keep the loop alive,
								// but not forever.
								read_errors += 1;
								warn!(error = %other, read_errors, "chat socket read error");
								if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
									break SessionEnd::TransportError(other.to_string());
								}
							}
						}
					}
				}
			}
		}
	};

	buf.clear();
	let _ = running.send(false);
	if end != SessionEnd::LocalDisconnect {
		info!(end = %end, "chat session ended");
	}
	let _ = end_tx.send(end);
}
