#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use super::manager::PubSubCallbacks;
use super::{ListenRequest, PubSubFrame, PubSubSettings, topics};
use crate::CancelToken;
use crate::auth::CredentialStore;
use crate::topics::TopicListener;
use crate::ws::{WsConnector, WsEvent, WsWriter};

const PING: &str = r#"{"type":"PING"}"#;

struct Session {
	writer: WsWriter,
	cancel: CancelToken,
	generation: u64,
}

struct AgentInner {
	channel_id: String,
	settings: PubSubSettings,
	auth: Arc<CredentialStore>,
	connector: WsConnector,
	callbacks: Arc<PubSubCallbacks>,
	gate: tokio::sync::Mutex<()>,
	/// Base topic names requested for this channel.
	wanted: Mutex<BTreeSet<String>>,
	session: Mutex<Option<Session>>,
	generation: AtomicU64,
	disposed: CancelToken,
}

/// PubSub socket for one channel. Connects on the first topic request and
/// drops the socket once no topics remain.
#[derive(Clone)]
pub struct PubSubAgent {
	inner: Arc<AgentInner>,
}

impl PubSubAgent {
	pub fn new(
		channel_id: impl Into<String>,
		settings: PubSubSettings,
		auth: Arc<CredentialStore>,
		connector: WsConnector,
		callbacks: Arc<PubSubCallbacks>,
	) -> Self {
		Self {
			inner: Arc::new(AgentInner {
				channel_id: channel_id.into(),
				settings,
				auth,
				connector,
				callbacks,
				gate: tokio::sync::Mutex::new(()),
				wanted: Mutex::new(BTreeSet::new()),
				session: Mutex::new(None),
				generation: AtomicU64::new(0),
				disposed: CancelToken::new(),
			}),
		}
	}

	pub fn channel_id(&self) -> &str {
		&self.inner.channel_id
	}

	pub fn topics(&self) -> Vec<String> {
		self.inner.wanted.lock().iter().cloned().collect()
	}

	pub fn is_connected(&self) -> bool {
		self.inner
			.session
			.lock()
			.as_ref()
			.is_some_and(|s| !s.writer.is_closed() && !s.cancel.is_cancelled())
	}

	fn writer(&self) -> Option<WsWriter> {
		self.inner.session.lock().as_ref().map(|s| s.writer.clone())
	}

	fn qualified(&self, names: impl IntoIterator<Item = String>) -> Vec<String> {
		names
			.into_iter()
			.map(|t| topics::qualified(&t, &self.inner.channel_id))
			.collect()
	}

	/// Connects and listens to every wanted topic. No-op when already connected,
	/// when nothing is wanted, or without a token.
	pub async fn start(&self) -> bool {
		let inner = &self.inner;
		if inner.disposed.is_cancelled() {
			return false;
		}
		let Ok(_guard) = inner.gate.try_lock() else {
			debug!(channel_id = %inner.channel_id, "pubsub start already in progress");
			return false;
		};
		if self.is_connected() {
			return true;
		}

		if self.inner.wanted.lock().is_empty() {
			return false;
		}
		let Some(token) = inner.auth.access_token() else {
			debug!(channel_id = %inner.channel_id, "no twitch token; pubsub stays disconnected");
			return false;
		};

		let url = match Url::parse(&inner.settings.ws_url) {
			Ok(url) => url,
			Err(e) => {
				warn!(url = %inner.settings.ws_url, error = %e, "invalid pubsub websocket url");
				return false;
			}
		};
		let session = match (inner.connector)(url.clone()).await {
			Ok(s) => s,
			Err(e) => {
				warn!(%url, channel_id = %inner.channel_id, error = %e, "failed to connect to twitch pubsub");
				return false;
			}
		};

		let (writer, rx) = session.split();
		let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let cancel = CancelToken::new();
		*inner.session.lock() = Some(Session {
			writer: writer.clone(),
			cancel: cancel.clone(),
			generation,
		});
		info!(%url, channel_id = %inner.channel_id, "connected to twitch pubsub");

		tokio::spawn(self.clone().read_loop(rx, cancel.clone(), generation));
		tokio::spawn(ping_loop(writer.clone(), cancel, inner.settings.ping_interval));

		// Topics added from here on send their own LISTEN.
		let request = ListenRequest::listen(self.qualified(self.topics()), &token);
		send_request(&writer, &request).await;
		true
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
							"twitch pubsub socket closed"
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
		debug!(channel_id = %self.inner.channel_id, generation, "pubsub reader stopped");
	}

	pub(crate) fn handle_frame(&self, raw: &str, generation: u64) {
		let frame: PubSubFrame = match serde_json::from_str(raw) {
			Ok(f) => f,
			Err(e) => {
				warn!(channel_id = %self.inner.channel_id, error = %e, "skipping malformed pubsub frame");
				return;
			}
		};

		match frame.kind.as_str() {
			"PONG" => debug!(channel_id = %self.inner.channel_id, "pubsub pong"),
			"RECONNECT" => {
				info!(channel_id = %self.inner.channel_id, "twitch pubsub requested a reconnect");
				tokio::spawn(self.clone().reconnect(generation));
			}
			"RESPONSE" => match frame.error.as_deref().filter(|e| !e.is_empty()) {
				Some(error) => warn!(
					channel_id = %self.inner.channel_id,
					nonce = frame.nonce.as_deref().unwrap_or_default(),
					%error,
					"pubsub request rejected"
				),
				None => debug!(
					channel_id = %self.inner.channel_id,
					nonce = frame.nonce.as_deref().unwrap_or_default(),
					"pubsub request accepted"
				),
			},
			"MESSAGE" => {
				let Some(data) = frame.data else {
					warn!(channel_id = %self.inner.channel_id, "pubsub message without data");
					return;
				};
				let topic = topics::base(&data.topic);
				metrics::counter!("catcore_pubsub_messages_total", "topic" => topic.to_string()).increment(1);
				match self.inner.callbacks.dispatch(&self.inner.channel_id, topic, &data.message) {
					Ok(true) => {}
					Ok(false) => debug!(channel_id = %self.inner.channel_id, %topic, "unhandled pubsub message"),
					Err(e) => warn!(
						channel_id = %self.inner.channel_id,
						%topic,
						error = %e,
						"failed to decode pubsub message"
					),
				}
			}
			other => debug!(channel_id = %self.inner.channel_id, kind = other, "unknown pubsub frame type"),
		}
	}

	/// Drops the socket, waits, then dials again; `start` re-listens every wanted topic.
	async fn reconnect(self, generation: u64) {
		if !self.close_session(Some(generation)).await {
			return;
		}
		tokio::time::sleep(self.inner.settings.reconnect_delay).await;
		self.start().await;
	}

	fn take_session(&self, generation: Option<u64>) -> Option<Session> {
		let session = {
			let mut guard = self.inner.session.lock();
			if generation.is_some_and(|g| guard.as_ref().map(|s| s.generation) != Some(g)) {
				return None;
			}
			guard.take()?
		};
		session.cancel.cancel();
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

	/// Closes the socket; wanted topics are kept for the next start.
	pub async fn stop(&self) {
		if self.close_session(None).await {
			info!(channel_id = %self.inner.channel_id, "disconnected from twitch pubsub");
		}
	}

	/// Closes the socket for good.
	pub async fn dispose(&self) {
		self.inner.disposed.cancel();
		self.inner.wanted.lock().clear();
		self.stop().await;
	}

	async fn unlisten(&self, topic: String) {
		let Some(writer) = self.writer() else {
			return;
		};
		if self.inner.wanted.lock().is_empty() {
			self.stop().await;
			return;
		}
		if let Some(token) = self.inner.auth.access_token() {
			send_request(&writer, &ListenRequest::unlisten(self.qualified([topic]), &token)).await;
		}
	}
}

impl TopicListener for PubSubAgent {
	fn request_topic_listening(&self, topic: &str) {
		if !self.inner.wanted.lock().insert(topic.to_string()) {
			return;
		}
		debug!(channel_id = %self.inner.channel_id, %topic, "pubsub topic requested");

		let agent = self.clone();
		let topic = topic.to_string();
		tokio::spawn(async move {
			match (agent.writer(), agent.inner.auth.access_token()) {
				(Some(writer), Some(token)) if !writer.is_closed() => {
					send_request(&writer, &ListenRequest::listen(agent.qualified([topic]), &token)).await;
				}
				_ => {
					agent.start().await;
				}
			}
		});
	}

	fn request_topic_unlistening(&self, topic: &str) {
		if !self.inner.wanted.lock().remove(topic) {
			return;
		}
		debug!(channel_id = %self.inner.channel_id, %topic, "pubsub topic released");

		let agent = self.clone();
		let topic = topic.to_string();
		tokio::spawn(async move { agent.unlisten(topic).await });
	}
}

async fn send_request(writer: &WsWriter, request: &ListenRequest<'_>) {
	let body = match serde_json::to_string(request) {
		Ok(b) => b,
		Err(e) => {
			warn!(error = %e, "failed to encode pubsub request");
			return;
		}
	};
	if let Err(e) = writer.send_text(body).await {
		warn!(kind = request.kind, error = %e, "failed to send pubsub request");
	}
}

async fn ping_loop(writer: WsWriter, cancel: CancelToken, every: std::time::Duration) {
	let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = ticker.tick() => {
				if writer.send_text(PING).await.is_err() {
					break;
				}
			}
		}
	}
}
