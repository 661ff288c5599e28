#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use catcore_domain::RosterDiff;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::EventSubSettings;
use super::agent::EventSubAgent;
use super::events::*;
use super::helix::ConduitApi;
use crate::CancelToken;
use crate::auth::{CredentialStore, TwitchCredentials};
use crate::callbacks::{Callback, CallbackSet, Transition};
use crate::roster::ChannelRoster;
use crate::topics::{AgentMap, TopicRegistry};
use crate::ws::WsConnector;

/// A typed EventSub payload with its own callback set.
pub trait EventSubEvent: DeserializeOwned + Send + Sync + 'static {
	const SUBSCRIPTION_TYPE: &'static str;

	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self>;
}

/// One callback set per subscribed event type.
#[derive(Default)]
pub struct EventSubCallbacks {
	stream_online: CallbackSet<StreamOnlineEvent>,
	stream_offline: CallbackSet<StreamOfflineEvent>,
	follow: CallbackSet<ChannelFollowEvent>,
	subscribe: CallbackSet<ChannelSubscribeEvent>,
	points_redeem: CallbackSet<ChannelPointsRedeemEvent>,
	prediction_begin: CallbackSet<ChannelPredictionBeginEvent>,
	chat_message: CallbackSet<ChannelChatMessageEvent>,
	chat_message_delete: CallbackSet<ChannelChatMessageDeleteEvent>,
	shoutout_create: CallbackSet<ChannelShoutoutCreateEvent>,
	shoutout_receive: CallbackSet<ChannelShoutoutReceiveEvent>,
}

impl EventSubCallbacks {
	pub fn new() -> Self {
		Self::default()
	}

	/// Decodes `event` as the payload for `kind` and notifies its callbacks.
	///
	/// `Ok(false)` for a type without a callback set.
	pub fn dispatch(&self, channel_id: &str, kind: &str, event: serde_json::Value) -> anyhow::Result<bool> {
		use types::*;

		match kind {
			STREAM_ONLINE => self.deliver::<StreamOnlineEvent>(channel_id, event)?,
			STREAM_OFFLINE => self.deliver::<StreamOfflineEvent>(channel_id, event)?,
			CHANNEL_FOLLOW => self.deliver::<ChannelFollowEvent>(channel_id, event)?,
			CHANNEL_SUBSCRIBE => self.deliver::<ChannelSubscribeEvent>(channel_id, event)?,
			CHANNEL_POINTS_REDEEM => self.deliver::<ChannelPointsRedeemEvent>(channel_id, event)?,
			CHANNEL_PREDICTION_BEGIN => self.deliver::<ChannelPredictionBeginEvent>(channel_id, event)?,
			CHANNEL_CHAT_MESSAGE => self.deliver::<ChannelChatMessageEvent>(channel_id, event)?,
			CHANNEL_CHAT_MESSAGE_DELETE => self.deliver::<ChannelChatMessageDeleteEvent>(channel_id, event)?,
			CHANNEL_SHOUTOUT_CREATE => self.deliver::<ChannelShoutoutCreateEvent>(channel_id, event)?,
			CHANNEL_SHOUTOUT_RECEIVE => self.deliver::<ChannelShoutoutReceiveEvent>(channel_id, event)?,
			_ => return Ok(false),
		}
		Ok(true)
	}

	fn deliver<E: EventSubEvent>(&self, channel_id: &str, event: serde_json::Value) -> anyhow::Result<()> {
		let event: E = serde_json::from_value(event).with_context(|| format!("decode {}", E::SUBSCRIPTION_TYPE))?;
		E::callbacks(self).notify(channel_id, &event);
		Ok(())
	}
}

impl EventSubEvent for StreamOnlineEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::STREAM_ONLINE;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.stream_online
	}
}

impl EventSubEvent for StreamOfflineEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::STREAM_OFFLINE;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.stream_offline
	}
}

impl EventSubEvent for ChannelFollowEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::CHANNEL_FOLLOW;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.follow
	}
}

impl EventSubEvent for ChannelSubscribeEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::CHANNEL_SUBSCRIBE;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.subscribe
	}
}

impl EventSubEvent for ChannelPointsRedeemEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::CHANNEL_POINTS_REDEEM;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.points_redeem
	}
}

impl EventSubEvent for ChannelPredictionBeginEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::CHANNEL_PREDICTION_BEGIN;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.prediction_begin
	}
}

impl EventSubEvent for ChannelChatMessageEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::CHANNEL_CHAT_MESSAGE;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.chat_message
	}
}

impl EventSubEvent for ChannelChatMessageDeleteEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::CHANNEL_CHAT_MESSAGE_DELETE;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.chat_message_delete
	}
}

impl EventSubEvent for ChannelShoutoutCreateEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::CHANNEL_SHOUTOUT_CREATE;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.shoutout_create
	}
}

impl EventSubEvent for ChannelShoutoutReceiveEvent {
	const SUBSCRIPTION_TYPE: &'static str = types::CHANNEL_SHOUTOUT_RECEIVE;
	fn callbacks(set: &EventSubCallbacks) -> &CallbackSet<Self> {
		&set.shoutout_receive
	}
}

struct ManagerInner {
	settings: EventSubSettings,
	auth: Arc<CredentialStore>,
	roster: Arc<ChannelRoster>,
	api: Arc<dyn ConduitApi>,
	connector: WsConnector,
	callbacks: Arc<EventSubCallbacks>,
	agents: AgentMap<EventSubAgent>,
	topics: TopicRegistry,
	/// Held across a callback-set edge and the matching registry update.
	registration: Mutex<()>,
	running: AtomicBool,
	shutdown: CancelToken,
}

/// Owns one [`EventSubAgent`] per active roster channel.
///
/// Agents connect lazily: the first callback for an event type registers its topic,
/// which asks every agent to start.
#[derive(Clone)]
pub struct EventSubManager {
	inner: Arc<ManagerInner>,
}

impl EventSubManager {
	pub fn new(
		settings: EventSubSettings,
		auth: Arc<CredentialStore>,
		roster: Arc<ChannelRoster>,
		api: Arc<dyn ConduitApi>,
		connector: WsConnector,
	) -> Self {
		Self {
			inner: Arc::new(ManagerInner {
				settings,
				auth,
				roster,
				api,
				connector,
				callbacks: Arc::new(EventSubCallbacks::new()),
				agents: RwLock::new(HashMap::new()),
				topics: TopicRegistry::new(&[]),
				registration: Mutex::new(()),
				running: AtomicBool::new(false),
				shutdown: CancelToken::new(),
			}),
		}
	}

	fn self_channel(&self) -> Option<String> {
		self.inner.auth.logged_in_user().map(|u| u.user_id)
	}

	/// Adds `cb`; the first callback for `E` requests its topic on every agent.
	pub fn add_callback<E: EventSubEvent>(&self, cb: Callback<E>) {
		let self_channel = self.self_channel();
		let _registration = self.inner.registration.lock();
		if E::callbacks(&self.inner.callbacks).add(cb) == Transition::Edge {
			self.inner
				.topics
				.register(E::SUBSCRIPTION_TYPE, &self.inner.agents, self_channel.as_deref());
		}
	}

	/// Removes `cb`; the last callback for `E` releases its topic.
	pub fn remove_callback<E: EventSubEvent>(&self, cb: &Callback<E>) {
		let self_channel = self.self_channel();
		let _registration = self.inner.registration.lock();
		if E::callbacks(&self.inner.callbacks).remove(cb) == Transition::Edge {
			self.inner
				.topics
				.unregister(E::SUBSCRIPTION_TYPE, &self.inner.agents, self_channel.as_deref());
		}
	}

	/// Topics that currently have at least one callback.
	pub fn registered_topics(&self) -> Vec<String> {
		self.inner.topics.topics()
	}

	pub fn agent_count(&self) -> usize {
		self.inner.agents.read().len()
	}

	pub fn agent(&self, channel_id: &str) -> Option<Arc<EventSubAgent>> {
		self.inner.agents.read().get(channel_id).cloned()
	}

	/// Creates agents for every active channel.
	pub fn start(&self) {
		self.inner.running.store(true, Ordering::SeqCst);
		for id in self.inner.roster.active_channel_ids() {
			self.create_agent(id.as_str());
		}
		info!(agents = self.agent_count(), "eventsub manager started");
	}

	/// Disposes every agent, deleting their subscriptions.
	pub async fn stop(&self) {
		self.inner.running.store(false, Ordering::SeqCst);
		let agents: Vec<Arc<EventSubAgent>> = self.inner.agents.write().drain().map(|(_, a)| a).collect();
		for agent in agents {
			agent.dispose().await;
		}
		info!("eventsub manager stopped");
	}

	/// Stops the agents and the watcher tasks.
	pub async fn shutdown(&self) {
		self.inner.shutdown.cancel();
		self.stop().await;
	}

	fn create_agent(&self, channel_id: &str) {
		let inner = &self.inner;
		let self_channel = self.self_channel();
		let mut agents = inner.agents.write();
		if agents.contains_key(channel_id) {
			return;
		}

		let agent = Arc::new(EventSubAgent::new(
			channel_id,
			inner.settings.clone(),
			inner.auth.clone(),
			inner.api.clone(),
			inner.connector.clone(),
			inner.callbacks.clone(),
		));
		inner
			.topics
			.send_all_current_topics_to_agent(channel_id, agent.as_ref(), self_channel.as_deref());
		agents.insert(channel_id.to_string(), agent);
		debug!(%channel_id, "created eventsub agent");
	}

	async fn destroy_agent(&self, channel_id: &str) {
		let removed = self.inner.agents.write().remove(channel_id);
		if let Some(agent) = removed {
			agent.dispose().await;
			debug!(%channel_id, "destroyed eventsub agent");
		}
	}

	fn agents_snapshot(&self) -> Vec<Arc<EventSubAgent>> {
		self.inner.agents.read().values().cloned().collect()
	}

	/// Spawns the credential and roster watchers. They exit on `shutdown`.
	pub fn spawn_watchers(&self) -> Vec<JoinHandle<()>> {
		let credentials = self.inner.auth.subscribe_credentials();
		let roster = self.inner.roster.subscribe();
		vec![
			tokio::spawn(self.clone().watch_credentials(credentials)),
			tokio::spawn(self.clone().watch_roster(roster)),
		]
	}

	async fn watch_credentials(self, mut rx: watch::Receiver<TwitchCredentials>) {
		loop {
			tokio::select! {
				_ = self.inner.shutdown.cancelled() => break,
				changed = rx.changed() => {
					if changed.is_err() {
						break;
					}
					let has_tokens = rx.borrow_and_update().has_tokens();
					self.on_credentials_changed(has_tokens).await;
				}
			}
		}
	}

	async fn on_credentials_changed(&self, has_tokens: bool) {
		if !has_tokens {
			for agent in self.agents_snapshot() {
				agent.stop().await;
			}
			return;
		}
		if !self.inner.running.load(Ordering::SeqCst) {
			return;
		}

		for id in self.inner.roster.active_channel_ids() {
			self.create_agent(id.as_str());
		}
		for agent in self.agents_snapshot() {
			tokio::spawn(async move {
				agent.start(false).await;
			});
		}
	}

	async fn watch_roster(self, mut rx: broadcast::Receiver<RosterDiff>) {
		loop {
			tokio::select! {
				_ = self.inner.shutdown.cancelled() => break,
				diff = rx.recv() => match diff {
					Ok(diff) => self.apply_roster_diff(&diff).await,
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!(skipped, "eventsub roster watcher lagged");
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		}
	}

	async fn apply_roster_diff(&self, diff: &RosterDiff) {
		if !self.inner.running.load(Ordering::SeqCst) {
			return;
		}
		for entry in &diff.disabled {
			self.destroy_agent(entry.id.as_str()).await;
		}
		for entry in &diff.enabled {
			self.create_agent(entry.id.as_str());
		}
	}
}
