#![forbid(unsafe_code)]

//! Ordered, sequential event dispatch to registered extensions.
//!
//! Extensions form a mutable pipeline: each one sees the payload as left by
//! the extensions registered before it and may replace it or pass it
//! through. A failing extension never takes the pipeline down; its error
//! is recorded and dispatch continues with the previous payload.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use barrage_domain::{
	ChatEvent, EntryEffectEvent, GiftEvent, LiveEvent, PaidMessageEvent, SubscriptionEvent, ViewerCountEvent,
	ViewerFollowEvent, ViewerJoinEvent,
};

/// A loadable extension.
///
/// Every handler defaults to "not interested": `Ok(None)` leaves the
/// payload unchanged, `Ok(Some(event))` substitutes it for downstream
/// extensions, `Err` is isolated by the bus. Lifecycle hooks run at
/// registration (`on_init`), toggling (`on_enable`/`on_disable`) and
/// removal (`on_destroy`), never during event dispatch.
#[async_trait]
pub trait Extension: Send + Sync {
	fn name(&self) -> &str;

	fn description(&self) -> &str {
		""
	}

	fn version(&self) -> &str {
		"0.1.0"
	}

	async fn on_init(&mut self) -> anyhow::Result<()> {
		Ok(())
	}

	async fn on_enable(&mut self) -> anyhow::Result<()> {
		Ok(())
	}

	async fn on_disable(&mut self) -> anyhow::Result<()> {
		Ok(())
	}

	async fn on_destroy(&mut self) -> anyhow::Result<()> {
		Ok(())
	}

	async fn on_chat(&mut self, _event: &ChatEvent) -> anyhow::Result<Option<ChatEvent>> {
		Ok(None)
	}

	async fn on_gift(&mut self, _event: &GiftEvent) -> anyhow::Result<Option<GiftEvent>> {
		Ok(None)
	}

	async fn on_paid_message(&mut self, _event: &PaidMessageEvent) -> anyhow::Result<Option<PaidMessageEvent>> {
		Ok(None)
	}

	async fn on_subscription(&mut self, _event: &SubscriptionEvent) -> anyhow::Result<Option<SubscriptionEvent>> {
		Ok(None)
	}

	async fn on_viewer_join(&mut self, _event: &ViewerJoinEvent) -> anyhow::Result<Option<ViewerJoinEvent>> {
		Ok(None)
	}

	async fn on_viewer_follow(&mut self, _event: &ViewerFollowEvent) -> anyhow::Result<Option<ViewerFollowEvent>> {
		Ok(None)
	}

	async fn on_viewer_count(&mut self, _event: &ViewerCountEvent) -> anyhow::Result<Option<ViewerCountEvent>> {
		Ok(None)
	}

	async fn on_entry_effect(&mut self, _event: &EntryEffectEvent) -> anyhow::Result<Option<EntryEffectEvent>> {
		Ok(None)
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
	#[error("extension already registered: {0}")]
	AlreadyRegistered(String),

	#[error("no such extension: {0}")]
	Unknown(String),
}

/// Point-in-time view of a registered extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionStatus {
	pub name: String,
	pub description: String,
	pub version: String,
	pub enabled: bool,
	/// Dispatch errors swallowed so far.
	pub failures: u64,
}

struct Registered {
	extension: Box<dyn Extension>,
	enabled: bool,
	failures: u64,
}

/// The extension pipeline. Registration order is dispatch order.
#[derive(Default)]
pub struct EventBus {
	extensions: Vec<Registered>,
}

impl std::fmt::Debug for EventBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventBus")
			.field(
				"extensions",
				&self
					.extensions
					.iter()
					.map(|r| (r.extension.name(), r.enabled, r.failures))
					.collect::<Vec<_>>(),
			)
			.finish()
	}
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.extensions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.extensions.is_empty()
	}

	fn index_of(&self, name: &str) -> Option<usize> {
		self.extensions.iter().position(|r| r.extension.name() == name)
	}

	/// Register an extension at the end of the pipeline and run its
	/// `on_init` hook. A failing hook is recorded but does not reject the
	/// extension.
	pub async fn register(&mut self, mut extension: Box<dyn Extension>) -> Result<(), BusError> {
		let name = extension.name().to_string();
		if self.index_of(&name).is_some() {
			return Err(BusError::AlreadyRegistered(name));
		}

		let mut failures = 0;
		if let Err(err) = extension.on_init().await {
			warn!(extension = %name, error = %err, "extension on_init failed");
			failures = 1;
		}
		debug!(extension = %name, "extension registered");

		self.extensions.push(Registered {
			extension,
			enabled: true,
			failures,
		});
		Ok(())
	}

	/// Remove an extension and run its `on_destroy` hook.
	pub async fn unregister(&mut self, name: &str) -> Result<(), BusError> {
		let idx = self.index_of(name).ok_or_else(|| BusError::Unknown(name.to_string()))?;
		let mut removed = self.extensions.remove(idx);
		if let Err(err) = removed.extension.on_destroy().await {
			warn!(extension = %name, error = %err, "extension on_destroy failed");
		}
		debug!(extension = %name, "extension unregistered");
		Ok(())
	}

	/// Flip an extension's enabled flag, running the matching hook on the
	/// edge. Setting the current value is a no-op.
	pub async fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), BusError> {
		let idx = self.index_of(name).ok_or_else(|| BusError::Unknown(name.to_string()))?;
		let entry = &mut self.extensions[idx];
		if entry.enabled == enabled {
			return Ok(());
		}

		entry.enabled = enabled;
		let hook = if enabled {
			entry.extension.on_enable().await
		} else {
			entry.extension.on_disable().await
		};
		if let Err(err) = hook {
			entry.failures += 1;
			warn!(extension = %name, enabled, error = %err, "extension toggle hook failed");
		}
		Ok(())
	}

	pub fn statuses(&self) -> Vec<ExtensionStatus> {
		self.extensions
			.iter()
			.map(|r| ExtensionStatus {
				name: r.extension.name().to_string(),
				description: r.extension.description().to_string(),
				version: r.extension.version().to_string(),
				enabled: r.enabled,
				failures: r.failures,
			})
			.collect()
	}

	/// Run one event through the pipeline and return the final payload.
	///
	/// Extensions run strictly in registration order, one at a time. Later
	/// extensions observe earlier mutations; a failing extension is skipped
	/// over, leaving the payload as the previous extension produced it.
	pub async fn dispatch(&mut self, event: LiveEvent) -> LiveEvent {
		let mut current = event;
		for entry in &mut self.extensions {
			if !entry.enabled {
				continue;
			}
			match deliver(entry.extension.as_mut(), &current).await {
				Ok(Some(updated)) => current = updated,
				Ok(None) => {}
				Err(err) => {
					entry.failures += 1;
					warn!(
						extension = entry.extension.name(),
						kind = current.kind(),
						error = %err,
						"extension dispatch failed; continuing"
					);
				}
			}
		}
		current
	}

	/// Destroy every extension in registration order and empty the bus.
	pub async fn shutdown(&mut self) {
		for mut entry in self.extensions.drain(..) {
			if let Err(err) = entry.extension.on_destroy().await {
				warn!(extension = entry.extension.name(), error = %err, "extension on_destroy failed");
			}
		}
	}
}

/// Factory producing a fresh instance of one extension.
pub type ExtensionFactory = Box<dyn Fn() -> Box<dyn Extension> + Send + Sync>;

/// Startup catalogue of every extension the host ships.
///
/// Stands in for filesystem plugin scanning: the host provides factories
/// once, and a configuration list of names decides which extensions a bus
/// actually gets, in which pipeline order.
#[derive(Default)]
pub struct ExtensionRegistry {
	factories: Vec<(String, ExtensionFactory)>,
}

impl ExtensionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Catalogue a factory under `name`.
	pub fn provide(
		&mut self,
		name: impl Into<String>,
		factory: impl Fn() -> Box<dyn Extension> + Send + Sync + 'static,
	) -> Result<(), BusError> {
		let name = name.into();
		if self.factories.iter().any(|(n, _)| *n == name) {
			return Err(BusError::AlreadyRegistered(name));
		}
		self.factories.push((name, Box::new(factory)));
		Ok(())
	}

	pub fn names(&self) -> Vec<&str> {
		self.factories.iter().map(|(n, _)| n.as_str()).collect()
	}

	/// Build a bus holding the named extensions, registered in list order.
	/// A name missing from the catalogue fails the whole build.
	pub async fn build(&self, names: &[String]) -> Result<EventBus, BusError> {
		let mut bus = EventBus::new();
		for name in names {
			let factory = self
				.factories
				.iter()
				.find(|(n, _)| n == name)
				.map(|(_, f)| f)
				.ok_or_else(|| BusError::Unknown(name.clone()))?;
			bus.register(factory()).await?;
		}
		Ok(bus)
	}
}

async fn deliver(extension: &mut dyn Extension, event: &LiveEvent) -> anyhow::Result<Option<LiveEvent>> {
	match event {
		LiveEvent::Chat(e) => Ok(extension.on_chat(e).await?.map(LiveEvent::Chat)),
		LiveEvent::Gift(e) => Ok(extension.on_gift(e).await?.map(LiveEvent::Gift)),
		LiveEvent::PaidMessage(e) => Ok(extension.on_paid_message(e).await?.map(LiveEvent::PaidMessage)),
		LiveEvent::Subscription(e) => Ok(extension.on_subscription(e).await?.map(LiveEvent::Subscription)),
		LiveEvent::ViewerJoin(e) => Ok(extension.on_viewer_join(e).await?.map(LiveEvent::ViewerJoin)),
		LiveEvent::ViewerFollow(e) => Ok(extension.on_viewer_follow(e).await?.map(LiveEvent::ViewerFollow)),
		LiveEvent::ViewerCount(e) => Ok(extension.on_viewer_count(e).await?.map(LiveEvent::ViewerCount)),
		LiveEvent::EntryEffect(e) => Ok(extension.on_entry_effect(e).await?.map(LiveEvent::EntryEffect)),
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use anyhow::anyhow;
	use barrage_domain::UserRef;

	use super::*;

	fn chat(text: &str) -> LiveEvent {
		LiveEvent::Chat(ChatEvent {
			user: Some(UserRef::new(1, "tester")),
			text: text.to_string(),
			medal: None,
			is_moderator: false,
			is_monthly_vip: false,
			is_yearly_vip: false,
			timestamp: 0,
		})
	}

	struct Tagger {
		name: &'static str,
		log: Arc<Mutex<Vec<String>>>,
		fail: bool,
	}

	#[async_trait]
	impl Extension for Tagger {
		fn name(&self) -> &str {
			self.name
		}

		async fn on_init(&mut self) -> anyhow::Result<()> {
			self.log.lock().unwrap().push(format!("{}:init", self.name));
			Ok(())
		}

		async fn on_enable(&mut self) -> anyhow::Result<()> {
			self.log.lock().unwrap().push(format!("{}:enable", self.name));
			Ok(())
		}

		async fn on_disable(&mut self) -> anyhow::Result<()> {
			self.log.lock().unwrap().push(format!("{}:disable", self.name));
			Ok(())
		}

		async fn on_destroy(&mut self) -> anyhow::Result<()> {
			self.log.lock().unwrap().push(format!("{}:destroy", self.name));
			Ok(())
		}

		async fn on_chat(&mut self, event: &ChatEvent) -> anyhow::Result<Option<ChatEvent>> {
			self.log.lock().unwrap().push(format!("{}:{}", self.name, event.text));
			if self.fail {
				return Err(anyhow!("boom"));
			}
			let mut updated = event.clone();
			updated.text = format!("{}+{}", event.text, self.name);
			Ok(Some(updated))
		}
	}

	fn tagger(name: &'static str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Box<dyn Extension> {
		Box::new(Tagger {
			name,
			log: Arc::clone(log),
			fail,
		})
	}

	#[tokio::test]
	async fn mutations_thread_through_the_pipeline() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let mut bus = EventBus::new();
		bus.register(tagger("a", &log, false)).await.unwrap();
		bus.register(tagger("b", &log, false)).await.unwrap();
		bus.register(tagger("c", &log, false)).await.unwrap();

		let out = bus.dispatch(chat("m")).await;
		let LiveEvent::Chat(out) = out else { panic!("kind changed") };
		assert_eq!(out.text, "m+a+b+c");

		// C observed B's mutation.
		let seen = log.lock().unwrap();
		assert!(seen.contains(&"c:m+a+b".to_string()));
	}

	#[tokio::test]
	async fn failing_extension_is_isolated() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let mut bus = EventBus::new();
		bus.register(tagger("a", &log, false)).await.unwrap();
		bus.register(tagger("b", &log, true)).await.unwrap();
		bus.register(tagger("c", &log, false)).await.unwrap();

		let out = bus.dispatch(chat("m")).await;
		let LiveEvent::Chat(out) = out else { panic!("kind changed") };
		// B failed, so C saw A's payload and appended to it.
		assert_eq!(out.text, "m+a+c");

		let seen = log.lock().unwrap();
		assert!(seen.contains(&"c:m+a".to_string()));

		let status = bus.statuses().into_iter().find(|s| s.name == "b").unwrap();
		assert_eq!(status.failures, 1);
	}

	#[tokio::test]
	async fn disabled_extensions_are_skipped() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let mut bus = EventBus::new();
		bus.register(tagger("a", &log, false)).await.unwrap();
		bus.register(tagger("b", &log, false)).await.unwrap();
		bus.set_enabled("b", false).await.unwrap();

		let out = bus.dispatch(chat("m")).await;
		let LiveEvent::Chat(out) = out else { panic!("kind changed") };
		assert_eq!(out.text, "m+a");

		// Re-enabling brings it back, with the hook fired on each edge.
		bus.set_enabled("b", true).await.unwrap();
		let out = bus.dispatch(chat("n")).await;
		let LiveEvent::Chat(out) = out else { panic!("kind changed") };
		assert_eq!(out.text, "n+a+b");

		let seen = log.lock().unwrap();
		assert!(seen.contains(&"b:disable".to_string()));
		assert!(seen.contains(&"b:enable".to_string()));
	}

	#[tokio::test]
	async fn lifecycle_hooks_fire_at_boundaries() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let mut bus = EventBus::new();
		bus.register(tagger("a", &log, false)).await.unwrap();
		bus.register(tagger("b", &log, false)).await.unwrap();
		bus.unregister("a").await.unwrap();
		bus.shutdown().await;

		let seen = log.lock().unwrap();
		assert_eq!(*seen, vec!["a:init", "b:init", "a:destroy", "b:destroy"]);
		drop(seen);
		assert!(bus.is_empty());
	}

	#[tokio::test]
	async fn duplicate_and_unknown_names_error() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let mut bus = EventBus::new();
		bus.register(tagger("a", &log, false)).await.unwrap();

		let err = bus.register(tagger("a", &log, false)).await.unwrap_err();
		assert_eq!(err, BusError::AlreadyRegistered("a".to_string()));

		let err = bus.unregister("missing").await.unwrap_err();
		assert_eq!(err, BusError::Unknown("missing".to_string()));

		let err = bus.set_enabled("missing", false).await.unwrap_err();
		assert_eq!(err, BusError::Unknown("missing".to_string()));
	}

	#[tokio::test]
	async fn registry_builds_bus_from_a_name_list() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let mut registry = ExtensionRegistry::new();
		for name in ["a", "b", "c"] {
			let log = Arc::clone(&log);
			registry
				.provide(name, move || {
					Box::new(Tagger {
						name,
						log: Arc::clone(&log),
						fail: false,
					})
				})
				.unwrap();
		}
		assert_eq!(registry.names(), vec!["a", "b", "c"]);

		// The list picks the members and the pipeline order.
		let mut bus = registry
			.build(&["c".to_string(), "a".to_string()])
			.await
			.unwrap();
		let out = bus.dispatch(chat("m")).await;
		let LiveEvent::Chat(out) = out else { panic!("kind changed") };
		assert_eq!(out.text, "m+c+a");

		let err = registry.build(&["nope".to_string()]).await.unwrap_err();
		assert_eq!(err, BusError::Unknown("nope".to_string()));
	}

	#[tokio::test]
	async fn registry_rejects_duplicate_names() {
		let mut registry = ExtensionRegistry::new();
		registry.provide("a", || Box::new(Rewrap("a"))).unwrap();
		let err = registry.provide("a", || Box::new(Rewrap("a"))).unwrap_err();
		assert_eq!(err, BusError::AlreadyRegistered("a".to_string()));
	}

	struct Rewrap(&'static str);

	#[async_trait]
	impl Extension for Rewrap {
		fn name(&self) -> &str {
			self.0
		}
	}

	#[tokio::test]
	async fn unhandled_kinds_pass_through_unchanged() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let mut bus = EventBus::new();
		bus.register(tagger("a", &log, false)).await.unwrap();

		let ev = LiveEvent::ViewerCount(ViewerCountEvent {
			count: 7,
			source: barrage_domain::ViewerCountSource::RankCount,
		});
		let out = bus.dispatch(ev.clone()).await;
		assert_eq!(out, ev);
	}
}
