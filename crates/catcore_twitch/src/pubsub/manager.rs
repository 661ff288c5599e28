#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use catcore_domain::RosterDiff;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::agent::PubSubAgent;
use super::events::{Follow, PollData, PollEnvelope, RewardRedeemedData, TypedMessage};
use super::{PubSubSettings, topics};
use crate::CancelToken;
use crate::auth::{CredentialStore, TwitchCredentials};
use crate::callbacks::{Callback, CallbackSet, Transition};
use crate::roster::ChannelRoster;
use crate::topics::{AgentMap, TopicRegistry};
use crate::ws::WsConnector;

/// A PubSub payload with its own topic and callback set.
pub trait PubSubEvent: Sized + Send + Sync + 'static {
	const TOPIC: &'static str;

	fn callbacks(set: &PubSubCallbacks) -> &CallbackSet<Self>;
}

impl PubSubEvent for Follow {
	const TOPIC: &'static str = topics::FOLLOWING;
	fn callbacks(set: &PubSubCallbacks) -> &CallbackSet<Self> {
		&set.follow
	}
}

impl PubSubEvent for PollData {
	const TOPIC: &'static str = topics::POLLS;
	fn callbacks(set: &PubSubCallbacks) -> &CallbackSet<Self> {
		&set.poll
	}
}

impl PubSubEvent for RewardRedeemedData {
	const TOPIC: &'static str = topics::CHANNEL_POINTS_CHANNEL_V1;
	fn callbacks(set: &PubSubCallbacks) -> &CallbackSet<Self> {
		&set.reward_redeemed
	}
}

#[derive(Default)]
pub struct PubSubCallbacks {
	follow: CallbackSet<Follow>,
	poll: CallbackSet<PollData>,
	reward_redeemed: CallbackSet<RewardRedeemedData>,
}

impl PubSubCallbacks {
	pub fn new() -> Self {
		Self::default()
	}

	/// Decodes the string-encoded `message` for `topic` and notifies its callbacks.
	///
	/// `Ok(false)` when the topic or the inner message type is not handled.
	pub fn dispatch(&self, channel_id: &str, topic: &str, message: &str) -> anyhow::Result<bool> {
		match topic {
			topics::FOLLOWING => {
				let follow: Follow = serde_json::from_str(message).context("decode follow")?;
				self.follow.notify(channel_id, &follow);
			}
			topics::POLLS => {
				let typed: TypedMessage = serde_json::from_str(message).context("decode poll message")?;
				let envelope: PollEnvelope = serde_json::from_value(typed.data)
					.with_context(|| format!("decode poll payload of {}", typed.kind))?;
				self.poll.notify(channel_id, &envelope.poll);
			}
			topics::CHANNEL_POINTS_CHANNEL_V1 => {
				let typed: TypedMessage = serde_json::from_str(message).context("decode channel points message")?;
				if typed.kind != "reward-redeemed" {
					return Ok(false);
				}
				let data: RewardRedeemedData = serde_json::from_value(typed.data).context("decode reward redemption")?;
				self.reward_redeemed.notify(channel_id, &data);
			}
			_ => return Ok(false),
		}
		Ok(true)
	}
}

struct ManagerInner {
	settings: PubSubSettings,
	auth: Arc<CredentialStore>,
	roster: Arc<ChannelRoster>,
	connector: WsConnector,
	callbacks: Arc<PubSubCallbacks>,
	agents: AgentMap<PubSubAgent>,
	topics: TopicRegistry,
	/// Held across a callback-set edge and the matching registry update.
	registration: Mutex<()>,
	running: AtomicBool,
	shutdown: CancelToken,
}

/// Owns one [`PubSubAgent`] per active roster channel.
#[derive(Clone)]
pub struct PubSubManager {
	inner: Arc<ManagerInner>,
}

impl PubSubManager {
	pub fn new(
		settings: PubSubSettings,
		auth: Arc<CredentialStore>,
		roster: Arc<ChannelRoster>,
		connector: WsConnector,
	) -> Self {
		Self {
			inner: Arc::new(ManagerInner {
				settings,
				auth,
				roster,
				connector,
				callbacks: Arc::new(PubSubCallbacks::new()),
				agents: RwLock::new(HashMap::new()),
				topics: TopicRegistry::new(&[topics::CHANNEL_POINTS_CHANNEL_V1]),
				registration: Mutex::new(()),
				running: AtomicBool::new(false),
				shutdown: CancelToken::new(),
			}),
		}
	}

	fn self_channel(&self) -> Option<String> {
		self.inner.auth.logged_in_user().map(|u| u.user_id)
	}

	pub fn add_callback<E: PubSubEvent>(&self, cb: Callback<E>) {
		let self_channel = self.self_channel();
		let _registration = self.inner.registration.lock();
		if E::callbacks(&self.inner.callbacks).add(cb) == Transition::Edge {
			self.inner
				.topics
				.register(E::TOPIC, &self.inner.agents, self_channel.as_deref());
		}
	}

	pub fn remove_callback<E: PubSubEvent>(&self, cb: &Callback<E>) {
		let self_channel = self.self_channel();
		let _registration = self.inner.registration.lock();
		if E::callbacks(&self.inner.callbacks).remove(cb) == Transition::Edge {
			self.inner
				.topics
				.unregister(E::TOPIC, &self.inner.agents, self_channel.as_deref());
		}
	}

	/// Topics that currently have at least one callback.
	pub fn registered_topics(&self) -> Vec<String> {
		self.inner.topics.topics()
	}

	pub fn agent_count(&self) -> usize {
		self.inner.agents.read().len()
	}

	pub fn agent(&self, channel_id: &str) -> Option<Arc<PubSubAgent>> {
		self.inner.agents.read().get(channel_id).cloned()
	}

	pub fn start(&self) {
		self.inner.running.store(true, Ordering::SeqCst);
		for id in self.inner.roster.active_channel_ids() {
			self.create_agent(id.as_str());
		}
		info!(agents = self.agent_count(), "pubsub manager started");
	}

	pub async fn stop(&self) {
		self.inner.running.store(false, Ordering::SeqCst);
		let agents: Vec<Arc<PubSubAgent>> = self.inner.agents.write().drain().map(|(_, a)| a).collect();
		for agent in agents {
			agent.dispose().await;
		}
		info!("pubsub manager stopped");
	}

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

		let agent = Arc::new(PubSubAgent::new(
			channel_id,
			inner.settings.clone(),
			inner.auth.clone(),
			inner.connector.clone(),
			inner.callbacks.clone(),
		));
		inner
			.topics
			.send_all_current_topics_to_agent(channel_id, agent.as_ref(), self_channel.as_deref());
		agents.insert(channel_id.to_string(), agent);
		debug!(%channel_id, "created pubsub agent");
	}

	async fn destroy_agent(&self, channel_id: &str) {
		let removed = self.inner.agents.write().remove(channel_id);
		if let Some(agent) = removed {
			agent.dispose().await;
			debug!(%channel_id, "destroyed pubsub agent");
		}
	}

	fn agents_snapshot(&self) -> Vec<Arc<PubSubAgent>> {
		self.inner.agents.read().values().cloned().collect()
	}

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
				agent.start().await;
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
						warn!(skipped, "pubsub roster watcher lagged");
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
