#![forbid(unsafe_code)]

//! WBI request signing for outbound web-API calls.
//!
//! The upstream service signs query strings with a rolling pair of keys
//! published on its nav endpoint. The derived mixin key and the MD5
//! signature must match the reference implementation bit for bit or every
//! signed request is rejected.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::api::RoomDirectory;

/// Character-shuffle table applied to the concatenated key pair.
pub const MIXIN_KEY_TABLE: [usize; 64] = [
	46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29, 28, 14, 39, 12, 38,
	41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25, 54, 21, 56, 59, 6, 63, 57, 62, 11, 36,
	20, 34, 44, 52,
];

/// Keys are refreshed from the nav endpoint at most once per day.
const KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Characters stripped from parameter values before encoding.
const STRIPPED_VALUE_CHARS: &str = "!()*";

/// The signing key pair as published by the nav endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WbiKeys {
	pub img_key: String,
	pub sub_key: String,
}

/// Derive the 32-character mixin key from the two published keys.
pub fn mixin_key(img_key: &str, sub_key: &str) -> String {
	let combined = format!("{img_key}{sub_key}");
	let bytes = combined.as_bytes();

	let mut out = String::with_capacity(32);
	for &index in MIXIN_KEY_TABLE.iter() {
		if let Some(&b) = bytes.get(index) {
			out.push(b as char);
		}
	}
	out.truncate(32);
	out
}

/// Sign a parameter set with a fixed mixin key and timestamp.
///
/// Returns the full signed parameter list: the inputs (values sanitized),
/// `wts`, and the `w_rid` signature, sorted by key with `w_rid` last.
pub fn sign_query(params: &[(String, String)], mixin_key: &str, wts: u64) -> Vec<(String, String)> {
	let mut entries: Vec<(String, String)> = params
		.iter()
		.map(|(k, v)| (k.clone(), sanitize_value(v)))
		.collect();
	entries.push(("wts".to_string(), wts.to_string()));
	entries.sort_by(|a, b| a.0.cmp(&b.0));

	let query = entries
		.iter()
		.map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
		.collect::<Vec<_>>()
		.join("&");

	let mut hasher = Md5::new();
	hasher.update(query.as_bytes());
	hasher.update(mixin_key.as_bytes());
	let w_rid = hex::encode(hasher.finalize());

	entries.push(("w_rid".to_string(), w_rid));
	entries
}

fn sanitize_value(value: &str) -> String {
	value.chars().filter(|c| !STRIPPED_VALUE_CHARS.contains(*c)).collect()
}

/// Caching signer. Fetches keys through the directory on first use,
/// refreshes after [`KEY_REFRESH_INTERVAL`], and keeps stale keys when a
/// refresh fails.
#[derive(Debug, Default)]
pub struct WbiSigner {
	keys: Option<WbiKeys>,
	fetched_at: Option<Instant>,
}

impl WbiSigner {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cached_keys(&self) -> Option<&WbiKeys> {
		self.keys.as_ref()
	}

	fn keys_fresh(&self) -> bool {
		self.keys.is_some() && self.fetched_at.is_some_and(|t| t.elapsed() < KEY_REFRESH_INTERVAL)
	}

	async fn ensure_keys(&mut self, directory: &dyn RoomDirectory) -> anyhow::Result<()> {
		if self.keys_fresh() {
			return Ok(());
		}

		match directory.wbi_keys().await {
			Ok(keys) => {
				debug!("wbi keys refreshed");
				self.keys = Some(keys);
				self.fetched_at = Some(Instant::now());
				Ok(())
			}
			Err(err) if self.keys.is_some() => {
				warn!(error = %err, "wbi key refresh failed; keeping stale keys");
				Ok(())
			}
			Err(err) => Err(err),
		}
	}

	/// Sign `params` with current keys and the current unix timestamp.
	pub async fn sign(
		&mut self,
		directory: &dyn RoomDirectory,
		params: &[(String, String)],
	) -> anyhow::Result<Vec<(String, String)>> {
		self.ensure_keys(directory).await?;
		let Some(keys) = self.keys.as_ref() else {
			return Err(anyhow!("wbi keys unavailable"));
		};

		let wts = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or(0);
		Ok(sign_query(params, &mixin_key(&keys.img_key, &keys.sub_key), wts))
	}
}
