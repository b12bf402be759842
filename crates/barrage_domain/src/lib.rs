#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("room id must be a positive integer: {0}")]
	InvalidRoomId(String),
}

/// Live room identifier.
///
/// Rooms are addressed by a positive numeric id. A short vanity id and the
/// canonical id are both represented by this type; resolution between the
/// two happens at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(u64);

impl RoomId {
	/// Create a non-zero `RoomId`.
	pub fn new(id: u64) -> Result<Self, ParseIdError> {
		if id == 0 {
			return Err(ParseIdError::InvalidRoomId("0".to_string()));
		}
		Ok(Self(id))
	}

	pub fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let id: u64 = s.parse().map_err(|_| ParseIdError::InvalidRoomId(s.to_string()))?;
		RoomId::new(id)
	}
}

/// Normalized reference to the user behind an event.
///
/// Events originating from the room itself (viewer counters, some system
/// notices) carry no user; in that case the event holds `None` rather than
/// a fabricated placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
	pub uid: u64,
	pub display_name: String,
}

impl UserRef {
	pub fn new(uid: u64, display_name: impl Into<String>) -> Self {
		Self {
			uid,
			display_name: display_name.into(),
		}
	}
}

/// Fan-club medal attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanMedal {
	pub level: u32,
	pub name: String,
	pub anchor_name: String,
	pub anchor_room_id: u64,
}

/// Paid recurring-support tier (upstream `guard_level`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardTier {
	Governor,
	Admiral,
	Captain,
}

impl GuardTier {
	/// Map the upstream numeric level (1..=3). Anything else is treated as
	/// the base tier, matching the upstream default.
	pub fn from_level(level: u64) -> Self {
		match level {
			1 => GuardTier::Governor,
			2 => GuardTier::Admiral,
			_ => GuardTier::Captain,
		}
	}

	pub fn level(self) -> u8 {
		match self {
			GuardTier::Governor => 1,
			GuardTier::Admiral => 2,
			GuardTier::Captain => 3,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			GuardTier::Governor => "governor",
			GuardTier::Admiral => "admiral",
			GuardTier::Captain => "captain",
		}
	}
}

impl fmt::Display for GuardTier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Gift currency kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinType {
	Gold,
	Silver,
}

impl CoinType {
	/// Upstream sends the coin type as a string; unknown values count as
	/// gold, the upstream default.
	pub fn parse(s: &str) -> Self {
		match s {
			"silver" => CoinType::Silver,
			_ => CoinType::Gold,
		}
	}
}

/// Where a viewer-count reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerCountSource {
	HeartbeatReply,
	RankCount,
	WatchedChange,
}

/// How a viewer-join event was observed.
///
/// `Announced` joins come off the wire; the rest are synthesized the first
/// time a user is sighted through another event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSource {
	Announced,
	Chat,
	Gift,
	PaidMessage,
	Subscription,
}

/// A scrolling chat (danmaku) message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
	pub user: Option<UserRef>,
	pub text: String,
	pub medal: Option<FanMedal>,
	pub is_moderator: bool,
	pub is_monthly_vip: bool,
	pub is_yearly_vip: bool,
	pub timestamp: u64,
}

/// A gift sent to the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftEvent {
	pub user: Option<UserRef>,
	pub gift_id: u64,
	pub gift_name: String,
	pub count: u64,
	pub coin_type: CoinType,
	/// Unit price in coins.
	pub price: u64,
	pub total_coin: u64,
	pub timestamp: u64,
}

/// A paid, time-limited highlighted message (super chat).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaidMessageEvent {
	pub user: Option<UserRef>,
	pub text: String,
	pub price: u64,
	pub starts_at: u64,
	pub ends_at: u64,
	pub background_color: String,
}

/// A paid tiered subscription purchase (guard buy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
	pub user: Option<UserRef>,
	pub tier: GuardTier,
	pub price: u64,
	pub count: u64,
	pub starts_at: u64,
}

/// A viewer entering the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerJoinEvent {
	pub user: Option<UserRef>,
	/// Raw upstream interaction subtype (1 = join; higher values are other
	/// interactions carried on the same wire command).
	pub subtype: u32,
	pub source: JoinSource,
	pub timestamp: u64,
}

/// A viewer following the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerFollowEvent {
	pub user: Option<UserRef>,
	pub timestamp: u64,
}

/// A viewer-count reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerCountEvent {
	pub count: u64,
	pub source: ViewerCountSource,
}

/// A privileged-entry effect (subscriber walk-on).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryEffectEvent {
	pub user: Option<UserRef>,
	pub effect_id: u64,
	pub text: String,
	pub timestamp: u64,
}

/// Normalized room events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
	Chat(ChatEvent),
	Gift(GiftEvent),
	PaidMessage(PaidMessageEvent),
	Subscription(SubscriptionEvent),
	ViewerJoin(ViewerJoinEvent),
	ViewerFollow(ViewerFollowEvent),
	ViewerCount(ViewerCountEvent),
	EntryEffect(EntryEffectEvent),
}

impl LiveEvent {
	/// Stable kind string, useful for logs and metrics labels.
	pub fn kind(&self) -> &'static str {
		match self {
			LiveEvent::Chat(_) => "chat",
			LiveEvent::Gift(_) => "gift",
			LiveEvent::PaidMessage(_) => "paid_message",
			LiveEvent::Subscription(_) => "subscription",
			LiveEvent::ViewerJoin(_) => "viewer_join",
			LiveEvent::ViewerFollow(_) => "viewer_follow",
			LiveEvent::ViewerCount(_) => "viewer_count",
			LiveEvent::EntryEffect(_) => "entry_effect",
		}
	}

	/// The user behind the event, when one is attached.
	pub fn user(&self) -> Option<&UserRef> {
		match self {
			LiveEvent::Chat(e) => e.user.as_ref(),
			LiveEvent::Gift(e) => e.user.as_ref(),
			LiveEvent::PaidMessage(e) => e.user.as_ref(),
			LiveEvent::Subscription(e) => e.user.as_ref(),
			LiveEvent::ViewerJoin(e) => e.user.as_ref(),
			LiveEvent::ViewerFollow(e) => e.user.as_ref(),
			LiveEvent::ViewerCount(_) => None,
			LiveEvent::EntryEffect(e) => e.user.as_ref(),
		}
	}
}
