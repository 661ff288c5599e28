#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use super::events::{SUBSCRIBED_TYPES, subscription_condition, subscription_version};
use super::helix::{ConduitApi, SubscriptionInfo, SubscriptionRequest};
use super::manager::EventSubCallbacks;
use super::{EventSubFrame, EventSubNotificationPayload, EventSubRevocationPayload, EventSubSettings};
use crate::CancelToken;
use crate::auth::CredentialStore;
use crate::topics::TopicListener;
use crate::ws::{WsConnector, WsEvent, WsWriter};

const SHARD_ID: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
	Idle,
	ConnectingSocket,
	AwaitingSessionId,
	RegisteringTopicTransport,
	SubscriptionsActive,
}

struct Session {
	writer: WsWriter,
	cancel: CancelToken,
	generation: u64,
	session_id: Option<String>,
}

struct AgentInner {
	channel_id: String,
	settings: EventSubSettings,
	auth: Arc<CredentialStore>,
	api: Arc<dyn ConduitApi>,
	connector: WsConnector,
	callbacks: Arc<EventSubCallbacks>,
	gate: tokio::sync::Mutex<()>,
	state: Mutex<AgentState>,
	session: Mutex<Option<Session>>,
	conduit_id: Mutex<Option<String>>,
	/// Subscription type to subscription id, for subscriptions created for this channel.
	registered: Mutex<BTreeMap<String, String>>,
	generation: AtomicU64,
	disposed: CancelToken,
}

/// EventSub session for one channel, routed through a conduit.
///
/// The conduit outlives the socket: on reconnect the agent finds it again via the
/// subscription list and only creates the subscriptions it is missing.
#[derive(Clone)]
pub struct EventSubAgent {
	inner: Arc<AgentInner>,
}

impl EventSubAgent {
	pub fn new(
		channel_id: impl Into<String>,
		settings: EventSubSettings,
		auth: Arc<CredentialStore>,
		api: Arc<dyn ConduitApi>,
		connector: WsConnector,
		callbacks: Arc<EventSubCallbacks>,
	) -> Self {
		Self {
			inner: Arc::new(AgentInner {
				channel_id: channel_id.into(),
				settings,
				auth,
				api,
				connector,
				callbacks,
				gate: tokio::sync::Mutex::new(()),
				state: Mutex::new(AgentState::Idle),
				session: Mutex::new(None),
				conduit_id: Mutex::new(None),
				registered: Mutex::new(BTreeMap::new()),
				generation: AtomicU64::new(0),
				disposed: CancelToken::new(),
			}),
		}
	}

	pub fn channel_id(&self) -> &str {
		&self.inner.channel_id
	}

	pub fn state(&self) -> AgentState {
		*self.inner.state.lock()
	}

	pub fn conduit_id(&self) -> Option<String> {
		self.inner.conduit_id.lock().clone()
	}

	pub fn registered_types(&self) -> Vec<String> {
		self.inner.registered.lock().keys().cloned().collect()
	}

	pub fn is_connected(&self) -> bool {
		self.inner
			.session
			.lock()
			.as_ref()
			.is_some_and(|s| !s.writer.is_closed() && !s.cancel.is_cancelled())
	}

	fn set_state(&self, state: AgentState) {
		*self.inner.state.lock() = state;
	}

	fn set_state_for(&self, generation: u64, state: AgentState) {
		if self.is_current(generation) {
			self.set_state(state);
		}
	}

	fn is_current(&self, generation: u64) -> bool {
		self.inner.session.lock().as_ref().map(|s| s.generation) == Some(generation)
	}

	/// Finds or creates the conduit, then opens the socket.
	///
	/// Without `force`, a start that finds another one in flight or an open socket does
	/// nothing. With `force` it waits its turn and replaces an open socket.
	pub async fn start(&self, force: bool) -> bool {
		let inner = &self.inner;
		if inner.disposed.is_cancelled() {
			return false;
		}

		let _guard = if force {
			inner.gate.lock().await
		} else {
			match inner.gate.try_lock() {
				Ok(guard) => guard,
				Err(_) => {
					debug!(channel_id = %inner.channel_id, "eventsub start already in progress");
					return false;
				}
			}
		};

		if self.is_connected() {
			if !force {
				return true;
			}
			self.close_session(None).await;
		}

		if !inner.auth.has_tokens() {
			debug!(channel_id = %inner.channel_id, "no twitch tokens; eventsub stays disconnected");
			return false;
		}
		let Some(user) = inner.auth.fetch_user_info_with_refresh().await else {
			warn!(channel_id = %inner.channel_id, "no validated twitch identity; eventsub stays disconnected");
			return false;
		};

		info!(channel_id = %inner.channel_id, "starting twitch eventsub conduit session");
		*inner.conduit_id.lock() = None;

		let conduit_id = match self.discover_conduit(&user.user_id).await {
			Ok(id) => id,
			Err(e) => {
				warn!(channel_id = %inner.channel_id, error = ?e, "failed to prepare eventsub conduit");
				self.set_state(AgentState::Idle);
				return false;
			}
		};
		*inner.conduit_id.lock() = Some(conduit_id);

		self.set_state(AgentState::ConnectingSocket);
		let url = match Url::parse(&inner.settings.ws_url) {
			Ok(url) => url,
			Err(e) => {
				warn!(url = %inner.settings.ws_url, error = %e, "invalid eventsub websocket url");
				self.reset_ids();
				return false;
			}
		};
		let session = match (inner.connector)(url.clone()).await {
			Ok(s) => s,
			Err(e) => {
				warn!(%url, channel_id = %inner.channel_id, error = %e, "failed to connect to twitch eventsub");
				self.reset_ids();
				return false;
			}
		};

		let (writer, rx) = session.split();
		let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let cancel = CancelToken::new();
		*inner.session.lock() = Some(Session {
			writer,
			cancel: cancel.clone(),
			generation,
			session_id: None,
		});
		self.set_state(AgentState::AwaitingSessionId);
		tokio::spawn(self.clone().read_loop(rx, cancel, generation));

		info!(%url, channel_id = %inner.channel_id, "connected to twitch eventsub");
		true
	}

	/// Reuses a conduit that only carries this channel's subscriptions, or creates a
	/// single-shard one. Shard 0 is rebound to our socket, so a conduit shared with
	/// another channel would steal its traffic.
	///
	/// `registered` is rebuilt from the chosen conduit's enabled subscriptions; a fresh
	/// conduit starts with none.
	async fn discover_conduit(&self, user_id: &str) -> anyhow::Result<String> {
		let inner = &self.inner;
		let existing = inner.api.list_subscriptions().await.context("list eventsub subscriptions")?;

		let mut by_conduit: BTreeMap<&str, Vec<&SubscriptionInfo>> = BTreeMap::new();
		for sub in &existing {
			if let Some(conduit_id) = sub.conduit_id() {
				by_conduit.entry(conduit_id).or_default().push(sub);
			}
		}
		let owned = by_conduit
			.into_iter()
			.find(|(_, subs)| subs.iter().all(|s| self.is_own_subscription(s, user_id)));

		inner.registered.lock().clear();
		if let Some((conduit_id, subs)) = owned {
			let mut registered = inner.registered.lock();
			for sub in subs {
				if sub.status == "enabled" && !sub.id.is_empty() {
					registered.entry(sub.kind.clone()).or_insert_with(|| sub.id.clone());
				}
			}
			info!(
				channel_id = %inner.channel_id,
				%conduit_id,
				registered = registered.len(),
				"reusing existing eventsub conduit"
			);
			return Ok(conduit_id.to_string());
		}

		let conduit_id = inner.api.create_conduit(1).await.context("create eventsub conduit")?;
		info!(channel_id = %inner.channel_id, %conduit_id, "created eventsub conduit");
		Ok(conduit_id)
	}

	fn is_own_subscription(&self, sub: &SubscriptionInfo, user_id: &str) -> bool {
		SUBSCRIBED_TYPES.contains(&sub.kind.as_str())
			&& sub.condition == subscription_condition(&sub.kind, &self.inner.channel_id, user_id)
	}

	async fn read_loop(self, mut rx: mpsc::Receiver<WsEvent>, cancel: CancelToken, generation: u64) {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				event = rx.recv() => match event {
					Some(WsEvent::Text(frame)) => self.handle_frame(&frame, generation),
					Some(WsEvent::Closed(reason)) => {
						warn!(
							channel_id = %self.inner.channel_id,
							reason = reason.as_deref().unwrap_or("none"),
							"twitch eventsub socket closed"
						);
						self.take_session(Some(generation));
						break;
					}
					None => {
						self.take_session(Some(generation));
						break;
					}
				}
			}
		}
		debug!(channel_id = %self.inner.channel_id, generation, "eventsub reader stopped");
	}

	pub(crate) fn handle_frame(&self, raw: &str, generation: u64) {
		let frame: EventSubFrame = match serde_json::from_str(raw) {
			Ok(f) => f,
			Err(e) => {
				warn!(channel_id = %self.inner.channel_id, error = %e, "skipping malformed eventsub frame");
				return;
			}
		};

		if let Some(session_id) = frame.session_id()
			&& self.claim_session_id(generation, session_id)
		{
			info!(channel_id = %self.inner.channel_id, %session_id, "twitch eventsub session started");
			tokio::spawn(self.clone().register_subscriptions(generation, session_id.to_string()));
			return;
		}

		match frame.metadata.message_type.as_str() {
			"notification" => self.on_notification(frame),
			"session_keepalive" => debug!(channel_id = %self.inner.channel_id, "eventsub keepalive"),
			"session_welcome" => debug!(channel_id = %self.inner.channel_id, "eventsub welcome for a known session"),
			"revocation" => self.on_revocation(frame),
			"reconnect" => {
				info!(channel_id = %self.inner.channel_id, "twitch eventsub requested a reconnect");
				tokio::spawn(self.clone().reconnect(generation));
			}
			other => warn!(channel_id = %self.inner.channel_id, message_type = other, "unknown eventsub message type"),
		}
	}

	/// Records the first session id seen on this socket. False if one is already known.
	fn claim_session_id(&self, generation: u64, session_id: &str) -> bool {
		let mut guard = self.inner.session.lock();
		match guard.as_mut() {
			Some(session) if session.generation == generation && session.session_id.is_none() => {
				session.session_id = Some(session_id.to_string());
				true
			}
			_ => false,
		}
	}

	fn on_notification(&self, frame: EventSubFrame) {
		let payload: EventSubNotificationPayload = match serde_json::from_value(frame.payload) {
			Ok(p) => p,
			Err(e) => {
				warn!(
					channel_id = %self.inner.channel_id,
					message_id = %frame.metadata.message_id,
					error = %e,
					"skipping malformed eventsub notification"
				);
				return;
			}
		};
		let kind = payload.subscription.kind;
		if let Some(broadcaster) = payload.event.get("broadcaster_user_id").and_then(serde_json::Value::as_str)
			&& broadcaster != self.inner.channel_id
		{
			warn!(
				channel_id = %self.inner.channel_id,
				%broadcaster,
				event_type = %kind,
				"dropping eventsub event for another channel"
			);
			return;
		}
		debug!(
			channel_id = %self.inner.channel_id,
			event_type = %kind,
			sent_at = %frame.metadata.message_timestamp,
			"eventsub notification"
		);
		metrics::counter!("catcore_eventsub_notifications_total", "type" => kind.clone()).increment(1);

		match self.inner.callbacks.dispatch(&self.inner.channel_id, &kind, payload.event) {
			Ok(true) => {}
			Ok(false) => warn!(channel_id = %self.inner.channel_id, event_type = %kind, "unhandled eventsub event type"),
			Err(e) => warn!(
				channel_id = %self.inner.channel_id,
				event_type = %kind,
				error = %e,
				"failed to decode eventsub event"
			),
		}
	}

	/// Drops the revoked type; the next start or reconnect creates it again.
	fn on_revocation(&self, frame: EventSubFrame) {
		let subscription = match serde_json::from_value::<EventSubRevocationPayload>(frame.payload) {
			Ok(p) => p.subscription,
			Err(e) => {
				warn!(channel_id = %self.inner.channel_id, error = %e, "malformed eventsub revocation");
				return;
			}
		};
		self.inner.registered.lock().remove(&subscription.kind);
		warn!(
			channel_id = %self.inner.channel_id,
			event_type = %subscription.kind,
			subscription_id = %subscription.id,
			status = %subscription.status,
			"eventsub subscription revoked"
		);
	}

	async fn register_subscriptions(self, generation: u64, session_id: String) {
		let inner = &self.inner;
		self.set_state_for(generation, AgentState::RegisteringTopicTransport);

		let Some(conduit_id) = self.conduit_id() else {
			warn!(channel_id = %inner.channel_id, "eventsub session without a conduit");
			return;
		};
		let Some(user) = inner.auth.logged_in_user() else {
			warn!(channel_id = %inner.channel_id, "no validated twitch identity; skipping eventsub subscriptions");
			return;
		};

		if let Err(e) = inner.api.assign_shard(&conduit_id, SHARD_ID, &session_id).await {
			warn!(channel_id = %inner.channel_id, %conduit_id, error = ?e, "failed to bind eventsub conduit shard");
			self.abandon(generation).await;
			return;
		}
		info!(channel_id = %inner.channel_id, %conduit_id, %session_id, "bound eventsub conduit shard");

		let Some(cancel) = self.session_cancel(generation) else {
			return;
		};
		tokio::select! {
			_ = cancel.cancelled() => return,
			_ = tokio::time::sleep(inner.settings.settle_delay) => {}
		}

		for kind in SUBSCRIBED_TYPES {
			if cancel.is_cancelled() {
				return;
			}
			if inner.registered.lock().contains_key(kind) {
				continue;
			}

			let request = SubscriptionRequest::on_conduit(
				kind,
				subscription_version(kind),
				subscription_condition(kind, &inner.channel_id, &user.user_id),
				&conduit_id,
			);
			match inner.api.create_subscription(&request).await {
				Ok(created) => {
					inner.registered.lock().insert(kind.to_string(), created.id);
					metrics::counter!("catcore_eventsub_subscriptions_created_total", "type" => kind).increment(1);
					info!(channel_id = %inner.channel_id, event_type = kind, "subscribed to eventsub");
				}
				Err(e) => {
					warn!(channel_id = %inner.channel_id, event_type = kind, error = ?e, "failed to create eventsub subscription");
				}
			}
		}

		self.set_state_for(generation, AgentState::SubscriptionsActive);
	}

	fn session_cancel(&self, generation: u64) -> Option<CancelToken> {
		self.inner
			.session
			.lock()
			.as_ref()
			.filter(|s| s.generation == generation)
			.map(|s| s.cancel.clone())
	}

	async fn reconnect(self, generation: u64) {
		if !self.close_session(Some(generation)).await {
			return;
		}
		tokio::time::sleep(self.inner.settings.reconnect_delay).await;
		self.start(false).await;
	}

	/// Leaves the socket after a failed setup step so the next start begins from scratch.
	async fn abandon(&self, generation: u64) {
		if self.close_session(Some(generation)).await {
			self.reset_ids();
		}
	}

	fn reset_ids(&self) {
		*self.inner.conduit_id.lock() = None;
		self.set_state(AgentState::Idle);
	}

	/// Detaches the session (only the one with `generation`, if given) and cancels its reader.
	fn take_session(&self, generation: Option<u64>) -> Option<Session> {
		let session = {
			let mut guard = self.inner.session.lock();
			if generation.is_some_and(|g| guard.as_ref().map(|s| s.generation) != Some(g)) {
				return None;
			}
			guard.take()?
		};
		session.cancel.cancel();
		self.set_state(AgentState::Idle);
		Some(session)
	}

	async fn close_session(&self, generation: Option<u64>) -> bool {
		match self.take_session(generation) {
			Some(session) => {
				session.writer.close().await;
				true
			}
			None => false,
		}
	}

	/// Closes the socket; subscriptions stay registered on the conduit.
	pub async fn stop(&self) {
		if self.close_session(None).await {
			info!(channel_id = %self.inner.channel_id, "disconnected from twitch eventsub");
		}
		self.reset_ids();
	}

	/// Deletes every subscription this agent created and, once none are left, its conduit.
	/// Then closes the socket for good.
	pub async fn dispose(&self) {
		let inner = &self.inner;
		inner.disposed.cancel();
		let conduit_id = self.conduit_id();

		let registered: Vec<(String, String)> = inner
			.registered
			.lock()
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		for (kind, id) in registered {
			match inner.api.delete_subscription(&id).await {
				Ok(()) => {
					inner.registered.lock().remove(&kind);
					info!(channel_id = %inner.channel_id, event_type = %kind, "unsubscribed from eventsub");
				}
				Err(e) => warn!(channel_id = %inner.channel_id, event_type = %kind, error = ?e, "failed to delete eventsub subscription"),
			}
		}

		self.stop().await;

		let all_deleted = inner.registered.lock().is_empty();
		if let Some(conduit_id) = conduit_id
			&& all_deleted
		{
			match inner.api.delete_conduit(&conduit_id).await {
				Ok(()) => info!(channel_id = %inner.channel_id, %conduit_id, "deleted eventsub conduit"),
				Err(e) => warn!(channel_id = %inner.channel_id, %conduit_id, error = ?e, "failed to delete eventsub conduit"),
			}
		}
	}
}

impl TopicListener for EventSubAgent {
	fn request_topic_listening(&self, topic: &str) {
		debug!(channel_id = %self.inner.channel_id, %topic, "eventsub topic requested");
		let agent = self.clone();
		tokio::spawn(async move {
			agent.start(false).await;
		});
	}

	/// Subscriptions are per conduit, not per topic; nothing to undo.
	fn request_topic_unlistening(&self, topic: &str) {
		debug!(channel_id = %self.inner.channel_id, %topic, "eventsub topic released");
	}
}
