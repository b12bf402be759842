#![forbid(unsafe_code)]

//! Maps decoded frames onto [`LiveEvent`]s.
//!
//! The push stream is a JSON command envelope keyed by `cmd`, except for
//! the viewer-join record which only exists in a binary form. The mapping
//! is total over the recognized command set and silently drops anything it
//! does not know; upstream adds commands over time. Every optional field
//! has an explicit default; a missing key never fails a frame.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde_json::Value;
use tracing::debug;

use barrage_domain::{
	ChatEvent, CoinType, EntryEffectEvent, FanMedal, GiftEvent, GuardTier, JoinSource, LiveEvent, PaidMessageEvent,
	SubscriptionEvent, UserRef, ViewerCountEvent, ViewerCountSource, ViewerFollowEvent, ViewerJoinEvent,
};
use barrage_protocol::{Frame, Operation, record};

const DEFAULT_PAID_MESSAGE_BACKGROUND: &str = "#EDF5FF";
const INTERACT_SUBTYPE_JOIN: u32 = 1;
const INTERACT_SUBTYPE_FOLLOW: u32 = 2;

/// Per-session normalizer. Holds the first-sighting state used to
/// synthesize join events, so it lives and dies with one connection.
pub struct Normalizer {
	synthesize_joins: bool,
	seen_users: HashSet<u64>,
}

impl Normalizer {
	pub fn new(synthesize_joins: bool) -> Self {
		Self {
			synthesize_joins,
			seen_users: HashSet::new(),
		}
	}

	/// Normalize one decompressed leaf frame into zero or more events.
	pub fn apply(&mut self, frame: &Frame) -> Vec<LiveEvent> {
		match frame.header.operation {
			Operation::HeartbeatReply => heartbeat_count(&frame.body),
			Operation::MessagePush => match serde_json::from_slice::<Value>(&frame.body) {
				Ok(envelope) => self.route_command(&envelope),
				Err(err) => {
					debug!(error = %err, "dropping malformed push payload");
					Vec::new()
				}
			},
			// Handshake traffic is handled by the session itself.
			_ => Vec::new(),
		}
	}

	fn route_command(&mut self, envelope: &Value) -> Vec<LiveEvent> {
		let cmd = envelope.get("cmd").and_then(Value::as_str).unwrap_or("");
		match cmd {
			"DANMU_MSG" => self.chat(envelope),
			"SEND_GIFT" => self.gift(envelope),
			"SUPER_CHAT_MESSAGE" => self.paid_message(envelope),
			"GUARD_BUY" => self.subscription(envelope),
			"INTERACT_WORD" => self.interact_json(envelope),
			"INTERACT_WORD_V2" => self.interact_record(envelope),
			"ENTRY_EFFECT" => entry_effect(envelope),
			"WATCHED_CHANGE" => viewer_count(envelope, "num", ViewerCountSource::WatchedChange),
			"ONLINE_RANK_COUNT" => viewer_count(envelope, "count", ViewerCountSource::RankCount),
			other => {
				debug!(cmd = other, "unrecognized command dropped");
				Vec::new()
			}
		}
	}

	fn chat(&mut self, envelope: &Value) -> Vec<LiveEvent> {
		let Some(info) = envelope.get("info").and_then(Value::as_array) else {
			return Vec::new();
		};
		if info.len() < 3 {
			return Vec::new();
		}

		let text = info[1].as_str().unwrap_or("").to_string();

		let sender = info[2].as_array().map(Vec::as_slice).unwrap_or(&[]);
		let uid = sender.first().and_then(Value::as_u64).unwrap_or(0);
		let name = sender.get(1).and_then(Value::as_str).unwrap_or("");
		let flag = |index: usize| sender.get(index).and_then(Value::as_u64).unwrap_or(0) == 1;

		let medal = info
			.get(3)
			.and_then(Value::as_array)
			.filter(|medal| !medal.is_empty())
			.map(|medal| FanMedal {
				level: medal.first().and_then(Value::as_u64).unwrap_or(0) as u32,
				name: medal.get(1).and_then(Value::as_str).unwrap_or("").to_string(),
				anchor_name: medal.get(2).and_then(Value::as_str).unwrap_or("").to_string(),
				anchor_room_id: medal.get(3).and_then(Value::as_u64).unwrap_or(0),
			});

		let timestamp = info
			.first()
			.and_then(Value::as_array)
			.and_then(|meta| meta.get(4))
			.and_then(Value::as_u64)
			.unwrap_or(0);

		let user = user_ref(uid, name);
		let mut events = self.first_sighting(user.as_ref(), JoinSource::Chat, timestamp);
		events.push(LiveEvent::Chat(ChatEvent {
			user,
			text,
			medal,
			is_moderator: flag(2),
			is_monthly_vip: flag(3),
			is_yearly_vip: flag(4),
			timestamp,
		}));
		events
	}

	fn gift(&mut self, envelope: &Value) -> Vec<LiveEvent> {
		let data = data_of(envelope);
		let uid = u64_of(data, "uid");
		let name = str_of(data, "uname");
		let timestamp = u64_of(data, "timestamp");

		let user = user_ref(uid, name);
		let mut events = self.first_sighting(user.as_ref(), JoinSource::Gift, timestamp);
		events.push(LiveEvent::Gift(GiftEvent {
			user,
			gift_id: u64_of(data, "giftId"),
			gift_name: str_of(data, "giftName").to_string(),
			count: data.get("num").and_then(Value::as_u64).unwrap_or(1),
			coin_type: CoinType::parse(data.get("coin_type").and_then(Value::as_str).unwrap_or("gold")),
			price: u64_of(data, "price"),
			total_coin: u64_of(data, "total_coin"),
			timestamp,
		}));
		events
	}

	fn paid_message(&mut self, envelope: &Value) -> Vec<LiveEvent> {
		let data = data_of(envelope);
		let user_info = data.get("user_info").unwrap_or(&Value::Null);
		let uid = u64_of(data, "uid");
		let name = str_of(user_info, "uname");
		let starts_at = u64_of(data, "start_time");

		let user = user_ref(uid, name);
		let mut events = self.first_sighting(user.as_ref(), JoinSource::PaidMessage, starts_at);
		events.push(LiveEvent::PaidMessage(PaidMessageEvent {
			user,
			text: str_of(data, "message").to_string(),
			price: u64_of(data, "price"),
			starts_at,
			ends_at: u64_of(data, "end_time"),
			background_color: data
				.get("background_bottom_color")
				.and_then(Value::as_str)
				.unwrap_or(DEFAULT_PAID_MESSAGE_BACKGROUND)
				.to_string(),
		}));
		events
	}

	fn subscription(&mut self, envelope: &Value) -> Vec<LiveEvent> {
		let data = data_of(envelope);
		let uid = u64_of(data, "uid");
		let name = str_of(data, "username");
		let starts_at = u64_of(data, "start_time");

		let user = user_ref(uid, name);
		let mut events = self.first_sighting(user.as_ref(), JoinSource::Subscription, starts_at);
		events.push(LiveEvent::Subscription(SubscriptionEvent {
			user,
			tier: GuardTier::from_level(data.get("guard_level").and_then(Value::as_u64).unwrap_or(3)),
			price: u64_of(data, "price"),
			count: data.get("num").and_then(Value::as_u64).unwrap_or(1),
			starts_at,
		}));
		events
	}

	fn interact_json(&mut self, envelope: &Value) -> Vec<LiveEvent> {
		let data = data_of(envelope);
		let uid = u64_of(data, "uid");
		// Older payloads spread the name across several keys.
		let raw_name = [str_of(data, "uname"), str_of(data, "username"), str_of(data, "user_name")]
			.into_iter()
			.find(|n| !n.is_empty())
			.unwrap_or("");
		let subtype = data.get("msg_type").and_then(Value::as_u64).unwrap_or(1) as u32;
		let timestamp = u64_of(data, "timestamp");

		self.interaction(uid, raw_name, subtype, timestamp)
	}

	fn interact_record(&mut self, envelope: &Value) -> Vec<LiveEvent> {
		let data = data_of(envelope);
		let encoded = str_of(data, "pb");
		if encoded.is_empty() {
			debug!("viewer-join record missing payload");
			return Vec::new();
		}

		let bytes = match BASE64_STANDARD.decode(encoded) {
			Ok(bytes) => bytes,
			Err(err) => {
				debug!(error = %err, "viewer-join record is not valid base64");
				return Vec::new();
			}
		};

		let rec = record::decode(&bytes);
		self.interaction(rec.uid, &rec.display_name, rec.event_subtype, rec.timestamp)
	}

	fn interaction(&mut self, uid: u64, raw_name: &str, subtype: u32, timestamp: u64) -> Vec<LiveEvent> {
		let name = clean_display_name(raw_name);
		let user = user_ref(uid, &name);
		self.mark_seen(user.as_ref());

		let event = match subtype {
			INTERACT_SUBTYPE_FOLLOW => LiveEvent::ViewerFollow(ViewerFollowEvent { user, timestamp }),
			_ => LiveEvent::ViewerJoin(ViewerJoinEvent {
				user,
				subtype,
				source: JoinSource::Announced,
				timestamp,
			}),
		};
		vec![event]
	}

	/// Emit a synthetic join the first time a user shows up through
	/// another event kind. Only fires with a real uid and a usable name;
	/// users are never fabricated.
	fn first_sighting(&mut self, user: Option<&UserRef>, source: JoinSource, timestamp: u64) -> Vec<LiveEvent> {
		if !self.synthesize_joins {
			return Vec::new();
		}
		let Some(user) = user else {
			return Vec::new();
		};
		if user.uid == 0 {
			return Vec::new();
		}
		let name = clean_display_name(&user.display_name);
		if name.is_empty() {
			return Vec::new();
		}
		if !self.seen_users.insert(user.uid) {
			return Vec::new();
		}

		let timestamp = if timestamp != 0 { timestamp } else { unix_now() };
		vec![LiveEvent::ViewerJoin(ViewerJoinEvent {
			user: Some(UserRef::new(user.uid, name)),
			subtype: INTERACT_SUBTYPE_JOIN,
			source,
			timestamp,
		})]
	}

	fn mark_seen(&mut self, user: Option<&UserRef>) {
		if let Some(user) = user
			&& user.uid != 0
		{
			self.seen_users.insert(user.uid);
		}
	}
}

fn heartbeat_count(body: &[u8]) -> Vec<LiveEvent> {
	if body.len() < 4 {
		return Vec::new();
	}
	let count = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
	vec![LiveEvent::ViewerCount(ViewerCountEvent {
		count: u64::from(count),
		source: ViewerCountSource::HeartbeatReply,
	})]
}

fn viewer_count(envelope: &Value, key: &str, source: ViewerCountSource) -> Vec<LiveEvent> {
	let count = u64_of(data_of(envelope), key);
	vec![LiveEvent::ViewerCount(ViewerCountEvent { count, source })]
}

fn entry_effect(envelope: &Value) -> Vec<LiveEvent> {
	let data = data_of(envelope);
	vec![LiveEvent::EntryEffect(EntryEffectEvent {
		user: user_ref(u64_of(data, "uid"), str_of(data, "uname")),
		effect_id: u64_of(data, "effect_id"),
		text: str_of(data, "copy_writing").to_string(),
		timestamp: u64_of(data, "timestamp"),
	})]
}

fn data_of(envelope: &Value) -> &Value {
	envelope.get("data").unwrap_or(&Value::Null)
}

fn u64_of(value: &Value, key: &str) -> u64 {
	value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn str_of<'a>(value: &'a Value, key: &str) -> &'a str {
	value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn user_ref(uid: u64, name: &str) -> Option<UserRef> {
	(uid != 0 || !name.is_empty()).then(|| UserRef::new(uid, name))
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Scrub a display name: drop control characters, cut out an embedded
/// avatar URL (some records concatenate name and face image), collapse
/// whitespace, cap the length. An unusable name becomes empty; the caller
/// must not substitute a placeholder.
pub(crate) fn clean_display_name(name: &str) -> String {
	let mut cleaned: String = name.chars().filter(|c| !c.is_control()).collect();

	if cleaned.contains("http") && cleaned.contains("bfs/face/") {
		if let Some(start) = cleaned.find("http") {
			let url_end = [".jpg", ".png", ".jpeg", ".gif", ".webp"]
				.iter()
				.filter_map(|ext| cleaned[start..].find(ext).map(|i| start + i + ext.len()))
				.min();
			cleaned = match url_end {
				Some(end) => {
					let before = cleaned[..start].trim_end();
					let after = cleaned[end..].trim_start();
					if after.is_empty() {
						before.to_string()
					} else {
						format!("{before} {after}")
					}
				}
				None => match cleaned[start..].find(' ') {
					Some(space) => format!("{}{}", cleaned[..start].trim_end(), &cleaned[start + space..]),
					None => cleaned[..start].trim_end().to_string(),
				},
			};
		}
	}

	let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
	let capped: String = collapsed.chars().take(20).collect();
	capped.trim_end().to_string()
}

#[cfg(test)]
mod tests {
	use barrage_protocol::{FrameHeader, HEADER_LEN};
	use bytes::Bytes;
	use serde_json::json;

	use super::*;

	fn push_frame(envelope: &Value) -> Frame {
		let body = envelope.to_string().into_bytes();
		Frame {
			header: FrameHeader {
				packet_length: (HEADER_LEN + body.len()) as u32,
				header_length: HEADER_LEN as u16,
				protocol_version: 0,
				operation: Operation::MessagePush,
				sequence: 1,
			},
			body: Bytes::from(body),
		}
	}

	fn apply(normalizer: &mut Normalizer, envelope: Value) -> Vec<LiveEvent> {
		normalizer.apply(&push_frame(&envelope))
	}

	fn quiet() -> Normalizer {
		Normalizer::new(false)
	}

	#[test]
	fn chat_maps_user_medal_and_flags() {
		let events = apply(
			&mut quiet(),
			json!({
				"cmd": "DANMU_MSG",
				"info": [
					[0, 1, 25, 16777215, 1_700_000_000_000u64, "x"],
					"hello room",
					[42u64, "alice", 1, 0, 1],
					[21, "club", "anchor", 999]
				]
			}),
		);

		let [LiveEvent::Chat(chat)] = events.as_slice() else {
			panic!("expected one chat event, got {events:?}");
		};
		assert_eq!(chat.text, "hello room");
		let user = chat.user.as_ref().unwrap();
		assert_eq!(user.uid, 42);
		assert_eq!(user.display_name, "alice");
		assert!(chat.is_moderator);
		assert!(!chat.is_monthly_vip);
		assert!(chat.is_yearly_vip);
		assert_eq!(chat.timestamp, 1_700_000_000_000);

		let medal = chat.medal.as_ref().unwrap();
		assert_eq!(medal.level, 21);
		assert_eq!(medal.name, "club");
		assert_eq!(medal.anchor_room_id, 999);
	}

	#[test]
	fn chat_with_short_info_is_dropped() {
		let events = apply(&mut quiet(), json!({"cmd": "DANMU_MSG", "info": [[0], "text"]}));
		assert!(events.is_empty());
	}

	#[test]
	fn gift_defaults_for_missing_fields() {
		let events = apply(
			&mut quiet(),
			json!({"cmd": "SEND_GIFT", "data": {"uid": 9, "uname": "bob", "giftName": "rose"}}),
		);

		let [LiveEvent::Gift(gift)] = events.as_slice() else {
			panic!("expected one gift event, got {events:?}");
		};
		assert_eq!(gift.gift_name, "rose");
		assert_eq!(gift.count, 1);
		assert_eq!(gift.price, 0);
		assert_eq!(gift.total_coin, 0);
		assert_eq!(gift.coin_type, CoinType::Gold);
	}

	#[test]
	fn paid_message_maps_price_window_and_color() {
		let events = apply(
			&mut quiet(),
			json!({
				"cmd": "SUPER_CHAT_MESSAGE",
				"data": {
					"uid": 5,
					"message": "look at me",
					"price": 30,
					"start_time": 100,
					"end_time": 160,
					"user_info": {"uname": "carol"}
				}
			}),
		);

		let [LiveEvent::PaidMessage(sc)] = events.as_slice() else {
			panic!("expected one paid message, got {events:?}");
		};
		assert_eq!(sc.text, "look at me");
		assert_eq!(sc.price, 30);
		assert_eq!(sc.starts_at, 100);
		assert_eq!(sc.ends_at, 160);
		assert_eq!(sc.background_color, DEFAULT_PAID_MESSAGE_BACKGROUND);
		assert_eq!(sc.user.as_ref().unwrap().display_name, "carol");
	}

	#[test]
	fn subscription_maps_tier() {
		let events = apply(
			&mut quiet(),
			json!({"cmd": "GUARD_BUY", "data": {"uid": 6, "username": "dave", "guard_level": 2, "price": 1998, "num": 1}}),
		);

		let [LiveEvent::Subscription(sub)] = events.as_slice() else {
			panic!("expected one subscription, got {events:?}");
		};
		assert_eq!(sub.tier, GuardTier::Admiral);
		assert_eq!(sub.price, 1998);

		// Absent guard_level falls back to the base tier.
		let events = apply(&mut quiet(), json!({"cmd": "GUARD_BUY", "data": {"uid": 6, "username": "dave"}}));
		let [LiveEvent::Subscription(sub)] = events.as_slice() else {
			panic!("expected one subscription, got {events:?}");
		};
		assert_eq!(sub.tier, GuardTier::Captain);
	}

	#[test]
	fn interact_json_join_and_follow() {
		let events = apply(
			&mut quiet(),
			json!({"cmd": "INTERACT_WORD", "data": {"uid": 7, "uname": "erin", "msg_type": 1, "timestamp": 11}}),
		);
		let [LiveEvent::ViewerJoin(join)] = events.as_slice() else {
			panic!("expected a join, got {events:?}");
		};
		assert_eq!(join.subtype, 1);
		assert_eq!(join.source, JoinSource::Announced);
		assert_eq!(join.user.as_ref().unwrap().display_name, "erin");

		let events = apply(
			&mut quiet(),
			json!({"cmd": "INTERACT_WORD", "data": {"uid": 7, "username": "erin", "msg_type": 2}}),
		);
		assert!(matches!(events.as_slice(), [LiveEvent::ViewerFollow(_)]));
	}

	#[test]
	fn interact_record_decodes_binary_payload() {
		// field 1 (uid) = 7, field 2 (name) = "erin", field 5 (subtype) = 2
		let record_bytes: Vec<u8> = vec![0x08, 0x07, 0x12, 0x04, b'e', b'r', b'i', b'n', 0x28, 0x02];
		let encoded = BASE64_STANDARD.encode(&record_bytes);

		let events = apply(&mut quiet(), json!({"cmd": "INTERACT_WORD_V2", "data": {"pb": encoded}}));
		let [LiveEvent::ViewerFollow(follow)] = events.as_slice() else {
			panic!("expected a follow, got {events:?}");
		};
		let user = follow.user.as_ref().unwrap();
		assert_eq!(user.uid, 7);
		assert_eq!(user.display_name, "erin");
	}

	#[test]
	fn interact_record_with_bad_base64_is_dropped() {
		let events = apply(&mut quiet(), json!({"cmd": "INTERACT_WORD_V2", "data": {"pb": "%%%"}}));
		assert!(events.is_empty());
		let events = apply(&mut quiet(), json!({"cmd": "INTERACT_WORD_V2", "data": {}}));
		assert!(events.is_empty());
	}

	#[test]
	fn viewer_counts_from_commands_and_heartbeat() {
		let events = apply(&mut quiet(), json!({"cmd": "WATCHED_CHANGE", "data": {"num": 1234}}));
		assert!(matches!(
			events.as_slice(),
			[LiveEvent::ViewerCount(ViewerCountEvent { count: 1234, source: ViewerCountSource::WatchedChange })]
		));

		let events = apply(&mut quiet(), json!({"cmd": "ONLINE_RANK_COUNT", "data": {"count": 55}}));
		assert!(matches!(
			events.as_slice(),
			[LiveEvent::ViewerCount(ViewerCountEvent { count: 55, source: ViewerCountSource::RankCount })]
		));

		let frame = Frame {
			header: FrameHeader {
				packet_length: 20,
				header_length: HEADER_LEN as u16,
				protocol_version: 1,
				operation: Operation::HeartbeatReply,
				sequence: 1,
			},
			body: Bytes::copy_from_slice(&42u32.to_be_bytes()),
		};
		let events = quiet().apply(&frame);
		assert!(matches!(
			events.as_slice(),
			[LiveEvent::ViewerCount(ViewerCountEvent { count: 42, source: ViewerCountSource::HeartbeatReply })]
		));
	}

	#[test]
	fn unknown_command_is_dropped_without_error() {
		let events = apply(&mut quiet(), json!({"cmd": "SOME_FUTURE_COMMAND", "data": {"x": 1}}));
		assert!(events.is_empty());
	}

	#[test]
	fn malformed_json_is_dropped() {
		let frame = Frame {
			header: FrameHeader {
				packet_length: 21,
				header_length: HEADER_LEN as u16,
				protocol_version: 0,
				operation: Operation::MessagePush,
				sequence: 1,
			},
			body: Bytes::from_static(b"not json"),
		};
		assert!(quiet().apply(&frame).is_empty());
	}

	#[test]
	fn first_sighting_synthesizes_one_join_per_user() {
		let mut normalizer = Normalizer::new(true);
		let chat = json!({
			"cmd": "DANMU_MSG",
			"info": [[0, 1, 25, 0, 10u64, "x"], "hi", [42u64, "alice", 0, 0, 0]]
		});

		let events = apply(&mut normalizer, chat.clone());
		assert_eq!(events.len(), 2);
		let LiveEvent::ViewerJoin(join) = &events[0] else {
			panic!("expected the synthesized join first, got {events:?}");
		};
		assert_eq!(join.source, JoinSource::Chat);
		assert_eq!(join.user.as_ref().unwrap().uid, 42);
		assert!(matches!(events[1], LiveEvent::Chat(_)));

		// Same user again: no second join.
		let events = apply(&mut normalizer, chat);
		assert_eq!(events.len(), 1);
		assert!(matches!(events[0], LiveEvent::Chat(_)));
	}

	#[test]
	fn announced_join_suppresses_later_synthesis() {
		let mut normalizer = Normalizer::new(true);
		let events = apply(
			&mut normalizer,
			json!({"cmd": "INTERACT_WORD", "data": {"uid": 42, "uname": "alice", "msg_type": 1}}),
		);
		assert_eq!(events.len(), 1);

		let events = apply(
			&mut normalizer,
			json!({"cmd": "DANMU_MSG", "info": [[0, 1, 25, 0, 10u64, "x"], "hi", [42u64, "alice", 0, 0, 0]]}),
		);
		assert_eq!(events.len(), 1);
		assert!(matches!(events[0], LiveEvent::Chat(_)));
	}

	#[test]
	fn anonymous_events_never_synthesize_joins() {
		let mut normalizer = Normalizer::new(true);
		let events = apply(
			&mut normalizer,
			json!({"cmd": "SEND_GIFT", "data": {"giftName": "rose"}}),
		);
		assert_eq!(events.len(), 1);
		assert!(matches!(events[0], LiveEvent::Gift(_)));
	}

	#[test]
	fn clean_display_name_scrubs_noise() {
		assert_eq!(clean_display_name("plain"), "plain");
		assert_eq!(clean_display_name("tab\u{7}here"), "tabhere");
		assert_eq!(
			clean_display_name("alice https://i0.hdslb.com/bfs/face/abc.jpg trailing"),
			"alice trailing"
		);
		assert_eq!(clean_display_name("bob https://i0.hdslb.com/bfs/face/abc.webp"), "bob");
		assert_eq!(clean_display_name("  spaced   out  "), "spaced out");
		assert_eq!(clean_display_name(&"x".repeat(64)).chars().count(), 20);
		assert_eq!(clean_display_name("\u{1}\u{2}"), "");
	}
}
