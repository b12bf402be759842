#![forbid(unsafe_code)]

use std::sync::Arc;

use barrage_bus::EventBus;
use barrage_client::{
	BiliApiClient, ClientConfig, ClientEvent, ClientStatus, Credentials, LiveClient, RoomDirectory,
};
use barrage_domain::{LiveEvent, RoomId, UserRef};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: barrage_tail --room <id> [--uid <uid>] [--sessdata <token>] [--buvid <id>]\n\
\n\
Options:\n\
	--room      Live room id (short or canonical)\n\
	--uid       Logged-in user id (default: 0, anonymous)\n\
	--sessdata  Web session token (alias: env BARRAGE_SESSDATA)\n\
	--buvid     Device cookie (alias: env BARRAGE_BUVID)\n\
	--help      Show this help\n\
\n\
Examples:\n\
	barrage_tail --room 21452505\n\
	BARRAGE_SESSDATA=... barrage_tail --room 510 --uid 12345\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,barrage_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn env_nonempty(key: &str) -> Option<String> {
	std::env::var(key).ok().and_then(|v| {
		let v = v.trim().to_string();
		(!v.is_empty()).then_some(v)
	})
}

fn parse_args() -> (RoomId, Credentials) {
	let mut room: Option<RoomId> = None;
	let mut creds = Credentials {
		uid: 0,
		session_token: env_nonempty("BARRAGE_SESSDATA"),
		buvid: env_nonempty("BARRAGE_BUVID"),
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--room" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				room = Some(v.parse().unwrap_or_else(|e| {
					eprintln!("Invalid --room value: {v} ({e})");
					usage_and_exit()
				}));
			}
			"--uid" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				creds.uid = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --uid value: {v}");
					usage_and_exit()
				});
			}
			"--sessdata" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				creds.session_token = Some(v);
			}
			"--buvid" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				creds.buvid = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit()
			}
		}
	}

	let Some(room) = room else {
		eprintln!("--room is required");
		usage_and_exit()
	};
	(room, creds)
}

fn display_user(user: &Option<UserRef>) -> String {
	match user {
		Some(u) if !u.display_name.is_empty() => u.display_name.clone(),
		Some(u) => format!("uid:{}", u.uid),
		None => "<room>".to_string(),
	}
}

fn print_event(event: &LiveEvent) {
	match event {
		LiveEvent::Chat(e) => println!("[chat] {}: {}", display_user(&e.user), e.text),
		LiveEvent::Gift(e) => println!(
			"[gift] {} sent {} x{} ({} {:?})",
			display_user(&e.user),
			e.gift_name,
			e.count,
			e.total_coin,
			e.coin_type
		),
		LiveEvent::PaidMessage(e) => {
			println!("[superchat {}] {}: {}", e.price, display_user(&e.user), e.text);
		}
		LiveEvent::Subscription(e) => {
			println!("[guard] {} bought {} x{}", display_user(&e.user), e.tier, e.count);
		}
		LiveEvent::ViewerJoin(e) => println!("[join] {} ({:?})", display_user(&e.user), e.source),
		LiveEvent::ViewerFollow(e) => println!("[follow] {}", display_user(&e.user)),
		LiveEvent::ViewerCount(e) => println!("[online] {} ({:?})", e.count, e.source),
		LiveEvent::EntryEffect(e) => println!("[entry] {} {}", display_user(&e.user), e.text),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (room, creds) = parse_args();

	let directory: Arc<dyn RoomDirectory> = Arc::new(BiliApiClient::new(&creds)?);

	let mut cfg = ClientConfig::new(room);
	cfg.credentials = creds;

	info!(%room, "connecting");
	let (mut client, mut events) = LiveClient::connect(cfg, directory, EventBus::new());

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!("interrupted; disconnecting");
				client.disconnect().await;
				break;
			}
			event = events.recv() => {
				let Some(event) = event else { break };
				match event {
					ClientEvent::Event(event) => print_event(&event),
					ClientEvent::Status(status) => {
						info!(?status, "status");
						if matches!(status, ClientStatus::ReconnectExhausted { .. }) {
							warn!("connection lost for good; exiting");
							break;
						}
					}
				}
			}
		}
	}

	Ok(())
}
