#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use barrage_domain::RoomId;

use crate::wbi::WbiKeys;

pub const DEFAULT_API_BASE_URL: &str = "https://api.live.bilibili.com";
pub const DEFAULT_NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";

// The live API rejects requests without a browser identity.
const BROWSER_USER_AGENT: &str =
	"Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const LIVE_REFERER: &str = "https://live.bilibili.com/";

/// Already-obtained login state. This layer never performs a login flow;
/// credentials are only forwarded to the transport and API calls.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
	pub uid: u64,
	/// Web session token (`SESSDATA`).
	pub session_token: Option<String>,
	/// Device fingerprint cookie (`buvid3`).
	pub buvid: Option<String>,
}

impl Credentials {
	pub fn anonymous() -> Self {
		Self::default()
	}

	/// Assemble the cookie header, or `None` when fully anonymous.
	pub fn cookie_header(&self) -> Option<String> {
		let mut parts = Vec::new();
		if let Some(token) = &self.session_token {
			parts.push(format!("SESSDATA={token}"));
		}
		if let Some(buvid) = &self.buvid {
			parts.push(format!("buvid3={buvid}"));
		}
		if self.uid != 0 {
			parts.push(format!("DedeUserID={}", self.uid));
		}
		(!parts.is_empty()).then(|| parts.join("; "))
	}
}

/// Room metadata returned by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
	/// Canonical room id (short vanity ids resolve to this).
	pub room_id: RoomId,
	pub short_id: Option<RoomId>,
	pub title: String,
	/// 0 = offline, 1 = live, 2 = loop.
	pub live_status: u8,
	pub online: u64,
	pub anchor_uid: u64,
}

/// One chat endpoint candidate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatServerHost {
	pub host: String,
	#[serde(default)]
	pub port: u16,
	#[serde(default)]
	pub ws_port: u16,
	#[serde(default)]
	pub wss_port: u16,
}

/// Token and endpoint list required to open the chat socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatServerInfo {
	pub token: String,
	pub hosts: Vec<ChatServerHost>,
}

/// Connect-time lookups the engine depends on. Implemented over HTTP in
/// production and stubbed in tests.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
	/// Resolve a (possibly short) room id into its canonical snapshot.
	async fn room_info(&self, room_id: RoomId) -> anyhow::Result<RoomSnapshot>;

	/// Fetch the chat server token and host list for a canonical room id.
	async fn chat_server_info(&self, room_id: RoomId) -> anyhow::Result<ChatServerInfo>;

	/// Fetch the current WBI signing keys from the nav endpoint.
	async fn wbi_keys(&self) -> anyhow::Result<WbiKeys>;
}

/// HTTP directory client against the upstream live API.
#[derive(Debug, Clone)]
pub struct BiliApiClient {
	base_url: String,
	nav_url: String,
	cookie: Option<String>,
	client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
	code: i64,
	#[serde(default)]
	message: String,
	data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RoomInfoData {
	room_id: u64,
	#[serde(default)]
	short_id: u64,
	#[serde(default)]
	title: String,
	#[serde(default)]
	live_status: u8,
	#[serde(default)]
	online: u64,
	#[serde(default)]
	uid: u64,
}

#[derive(Debug, Deserialize)]
struct DanmuConfData {
	#[serde(default)]
	token: String,
	#[serde(default)]
	host_server_list: Vec<ChatServerHost>,
}

#[derive(Debug, Deserialize)]
struct NavData {
	wbi_img: WbiImg,
}

#[derive(Debug, Deserialize)]
struct WbiImg {
	img_url: String,
	sub_url: String,
}

impl BiliApiClient {
	pub fn new(credentials: &Credentials) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.connect_timeout(Duration::from_secs(5))
			.build()
			.context("build http client")?;

		Ok(Self {
			base_url: DEFAULT_API_BASE_URL.to_string(),
			nav_url: DEFAULT_NAV_URL.to_string(),
			cookie: credentials.cookie_header(),
			client,
		})
	}

	pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
		self.base_url = base_url.into();
		self
	}

	pub fn with_nav_url(mut self, nav_url: impl Into<String>) -> Self {
		self.nav_url = nav_url.into();
		self
	}

	fn get(&self, url: &str) -> reqwest::RequestBuilder {
		let mut req = self
			.client
			.get(url)
			.header("User-Agent", BROWSER_USER_AGENT)
			.header("Referer", LIVE_REFERER);
		if let Some(cookie) = &self.cookie {
			req = req.header("Cookie", cookie.clone());
		}
		req
	}

	async fn fetch<T: serde::de::DeserializeOwned>(&self, url: &str, what: &'static str) -> anyhow::Result<T> {
		let resp = self.get(url).send().await.with_context(|| format!("request {what}"))?;
		let status = resp.status();
		if !status.is_success() {
			return Err(anyhow!("{what} failed: status={status}"));
		}

		let envelope: ApiEnvelope<T> = resp.json().await.with_context(|| format!("parse {what} response"))?;
		if envelope.code != 0 {
			return Err(anyhow!("{what} failed: code={} message={}", envelope.code, envelope.message));
		}
		envelope.data.ok_or_else(|| anyhow!("{what} failed: empty data"))
	}
}

#[async_trait]
impl RoomDirectory for BiliApiClient {
	async fn room_info(&self, room_id: RoomId) -> anyhow::Result<RoomSnapshot> {
		let url = format!("{}/room/v1/Room/get_info?room_id={}", self.base_url.trim_end_matches('/'), room_id);
		let data: RoomInfoData = self.fetch(&url, "room info").await?;

		let canonical = RoomId::new(data.room_id).map_err(|e| anyhow!("room info returned bad room_id: {e}"))?;
		debug!(requested = %room_id, canonical = %canonical, live_status = data.live_status, "resolved room");

		Ok(RoomSnapshot {
			room_id: canonical,
			short_id: RoomId::new(data.short_id).ok(),
			title: data.title,
			live_status: data.live_status,
			online: data.online,
			anchor_uid: data.uid,
		})
	}

	async fn chat_server_info(&self, room_id: RoomId) -> anyhow::Result<ChatServerInfo> {
		let url = format!("{}/room/v1/Danmu/getConf?room_id={}", self.base_url.trim_end_matches('/'), room_id);
		let data: DanmuConfData = self.fetch(&url, "chat server info").await?;

		Ok(ChatServerInfo {
			token: data.token,
			hosts: data.host_server_list,
		})
	}

	async fn wbi_keys(&self) -> anyhow::Result<WbiKeys> {
		let data: NavData = self.fetch(&self.nav_url, "wbi keys").await?;

		let img_key = key_from_url(&data.wbi_img.img_url).ok_or_else(|| anyhow!("malformed wbi img_url"))?;
		let sub_key = key_from_url(&data.wbi_img.sub_url).ok_or_else(|| anyhow!("malformed wbi sub_url"))?;
		Ok(WbiKeys { img_key, sub_key })
	}
}

/// The key is the basename of the image URL without its extension.
fn key_from_url(url: &str) -> Option<String> {
	let name = url.rsplit('/').next()?;
	let stem = name.split('.').next()?;
	(!stem.is_empty()).then(|| stem.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_extraction_from_wbi_urls() {
		let url = "https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png";
		assert_eq!(key_from_url(url).as_deref(), Some("7cd084941338484aae1ad9425b84077c"));
		assert_eq!(key_from_url("x.png").as_deref(), Some("x"));
		assert!(key_from_url("https://host/dir/.png").is_none());
	}

	#[test]
	fn cookie_header_assembly() {
		assert!(Credentials::anonymous().cookie_header().is_none());

		let creds = Credentials {
			uid: 77,
			session_token: Some("tok".to_string()),
			buvid: Some("dev".to_string()),
		};
		assert_eq!(creds.cookie_header().as_deref(), Some("SESSDATA=tok; buvid3=dev; DedeUserID=77"));
	}
}
