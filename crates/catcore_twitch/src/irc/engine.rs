#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use catcore_domain::{ChatBadge, ChatUser, RosterDiff, TwitchChannel, TwitchMessage};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::emotes::{EmoteSettings, extract_emotes};
use super::media::MediaDataProvider;
use super::parser::{IrcMessage, IrcPrefix, escape_tag_value, parse_line, parse_prefix, split_lines};
use super::queue::{OutboundMessage, OutboundSink, SendQueue, run_worker};
use super::rate_limit::RateLimitTier;
use crate::auth::{CredentialStore, TwitchCredentials};
use crate::roster::ChannelRoster;
use crate::state::{BadgeRoles, RoomStateTracker, Tags, UserStateTracker};
use crate::CancelToken;
use crate::ws::{WsConnector, WsEvent, WsWriter};

pub const DEFAULT_IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

const CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership";
const LOGIN_FAILED_NOTICE: &str = "Login authentication failed";
const DEFAULT_COLOR: &str = "#ffffff";
const ACTION_PREFIX: &str = "\u{1}ACTION ";
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ChatSettings {
	pub irc_ws_url: String,
	pub emotes: EmoteSettings,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			irc_ws_url: DEFAULT_IRC_WS_URL.to_string(),
			emotes: EmoteSettings::default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
	Connected,
	JoinedChannel(TwitchChannel),
	LeftChannel(TwitchChannel),
	RoomStateChanged(TwitchChannel),
	MessageReceived(Box<TwitchMessage>),
}

struct Session {
	writer: WsWriter,
	cancel: CancelToken,
	worker_cancel: Option<CancelToken>,
	generation: u64,
	access_token: String,
}

struct Inner {
	settings: ChatSettings,
	auth: Arc<CredentialStore>,
	roster: Arc<ChannelRoster>,
	rooms: Arc<RoomStateTracker>,
	users: Arc<UserStateTracker>,
	media: Arc<dyn MediaDataProvider>,
	connector: WsConnector,
	events: broadcast::Sender<ChatEvent>,
	session: Mutex<Option<Session>>,
	channel_ids: RwLock<HashMap<String, String>>,
	queue: Arc<SendQueue>,
	start_lock: tokio::sync::Mutex<()>,
	generation: AtomicU64,
	shutdown: CancelToken,
}

/// The chat (IRC over websocket) session.
///
/// One socket at a time. Connection follows credential and roster changes; a lost
/// socket is not redialled on its own.
#[derive(Clone)]
pub struct ChatEngine {
	inner: Arc<Inner>,
}

impl ChatEngine {
	pub fn new(
		settings: ChatSettings,
		auth: Arc<CredentialStore>,
		roster: Arc<ChannelRoster>,
		rooms: Arc<RoomStateTracker>,
		users: Arc<UserStateTracker>,
		media: Arc<dyn MediaDataProvider>,
		connector: WsConnector,
	) -> Self {
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		Self {
			inner: Arc::new(Inner {
				settings,
				auth,
				roster,
				rooms,
				users,
				media,
				connector,
				events,
				session: Mutex::new(None),
				channel_ids: RwLock::new(HashMap::new()),
				queue: Arc::new(SendQueue::new()),
				start_lock: tokio::sync::Mutex::new(()),
				generation: AtomicU64::new(0),
				shutdown: CancelToken::new(),
			}),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
		self.inner.events.subscribe()
	}

	pub fn is_connected(&self) -> bool {
		self.inner
			.session
			.lock()
			.as_ref()
			.is_some_and(|s| !s.writer.is_closed() && !s.cancel.is_cancelled())
	}

	pub fn pending_messages(&self) -> usize {
		self.inner.queue.len()
	}

	fn writer(&self) -> Option<WsWriter> {
		self.inner.session.lock().as_ref().map(|s| s.writer.clone())
	}

	fn emit(&self, event: ChatEvent) {
		let _ = self.inner.events.send(event);
	}

	/// Opens the socket and sends the login handshake. Returns whether a session is active.
	pub async fn start(&self) -> bool {
		let _guard = self.inner.start_lock.lock().await;
		if self.is_connected() {
			return true;
		}

		let auth = &self.inner.auth;
		if !auth.has_tokens() {
			debug!("no twitch tokens; chat stays disconnected");
			return false;
		}
		let Some(user) = auth.logged_in_user() else {
			debug!("no validated twitch identity; chat stays disconnected");
			return false;
		};
		if !auth.token_is_valid() && !auth.refresh_tokens().await {
			warn!("twitch token invalid and refresh failed; not connecting to chat");
			return false;
		}
		let Some(access_token) = auth.access_token() else {
			return false;
		};

		let url = match Url::parse(&self.inner.settings.irc_ws_url) {
			Ok(url) => url,
			Err(e) => {
				warn!(url = %self.inner.settings.irc_ws_url, error = %e, "invalid chat websocket url");
				return false;
			}
		};
		let session = match (self.inner.connector)(url.clone()).await {
			Ok(s) => s,
			Err(e) => {
				warn!(%url, error = %e, "failed to connect to twitch chat");
				return false;
			}
		};
		let (writer, rx) = session.split();
		let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let cancel = CancelToken::new();

		*self.inner.session.lock() = Some(Session {
			writer: writer.clone(),
			cancel: cancel.clone(),
			worker_cancel: None,
			generation,
			access_token: access_token.clone(),
		});
		tokio::spawn(self.clone().read_loop(rx, cancel, generation));

		let nick = if user.login.is_empty() { "." } else { user.login.as_str() };
		for line in [CAPABILITIES.to_string(), format!("PASS oauth:{access_token}"), format!("NICK {nick}")] {
			if let Err(e) = writer.send_text(line).await {
				warn!(error = %e, "chat handshake failed");
				break;
			}
		}

		info!(%url, login = %user.login, "connected to twitch chat");
		true
	}

	pub async fn stop(&self) {
		let _guard = self.inner.start_lock.lock().await;
		if let Some(session) = self.take_session(None) {
			session.writer.close().await;
			info!("disconnected from twitch chat");
		}
	}

	pub async fn restart(&self) -> bool {
		self.stop().await;
		self.start().await
	}

	/// Stops the session and the watcher tasks. Messages still queued are dropped.
	pub async fn shutdown(&self) {
		self.inner.shutdown.cancel();
		self.stop().await;
		let dropped = self.inner.queue.len();
		self.inner.queue.clear();
		if dropped > 0 {
			info!(dropped, "discarded unsent chat messages");
		}
	}

	/// Detaches the session (only the one with `generation`, if given), cancelling its tasks
	/// and forgetting everything learned on it.
	fn take_session(&self, generation: Option<u64>) -> Option<Session> {
		let session = {
			let mut guard = self.inner.session.lock();
			if generation.is_some_and(|g| guard.as_ref().map(|s| s.generation) != Some(g)) {
				return None;
			}
			guard.take()?
		};
		session.cancel.cancel();
		if let Some(worker) = &session.worker_cancel {
			worker.cancel();
		}
		self.inner.channel_ids.write().clear();
		self.inner.rooms.clear();
		self.inner.users.clear();
		Some(session)
	}

	async fn read_loop(self, mut rx: mpsc::Receiver<WsEvent>, cancel: CancelToken, generation: u64) {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				event = rx.recv() => match event {
					Some(WsEvent::Text(frame)) => self.handle_raw(&frame, false),
					Some(WsEvent::Closed(reason)) => {
						info!(reason = reason.as_deref().unwrap_or("none"), "twitch chat socket closed");
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
		debug!(generation, "chat reader stopped");
	}

	/// Queues `text` for `channel`; sent in order once the rate limit allows.
	///
	/// Line breaks in `text` become spaces so one call is always one chat line.
	pub fn send_message(&self, channel: &TwitchChannel, text: &str) {
		let text = text.replace(['\r', '\n'], " ");
		let line = format!(
			"@id={};room-id={} PRIVMSG #{} :{}",
			Uuid::new_v4(),
			escape_tag_value(&channel.id),
			channel.name,
			text
		);
		self.inner.queue.enqueue(OutboundMessage {
			channel_id: channel.id.clone(),
			line,
		});
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
					let credentials = rx.borrow_and_update().clone();
					if !credentials.has_tokens() {
						self.stop().await;
						continue;
					}
					let session_token = self.inner.session.lock().as_ref().map(|s| s.access_token.clone());
					match session_token {
						Some(token) if Some(token.as_str()) != credentials.access_token() => {
							info!("twitch credentials changed; restarting chat");
							self.restart().await;
						}
						_ => {
							self.start().await;
						}
					}
				}
			}
		}
	}

	async fn watch_roster(self, mut rx: broadcast::Receiver<RosterDiff>) {
		loop {
			tokio::select! {
				_ = self.inner.shutdown.cancelled() => break,
				diff = rx.recv() => match diff {
					Ok(diff) => self.apply_roster_diff(&diff),
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!(skipped, "chat roster watcher lagged");
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		}
	}

	fn apply_roster_diff(&self, diff: &RosterDiff) {
		let Some(writer) = self.writer() else {
			return;
		};
		for entry in &diff.disabled {
			send_line(&writer, format!("PART #{}", entry.login));
		}
		for entry in &diff.enabled {
			self.inner
				.channel_ids
				.write()
				.insert(entry.login.clone(), entry.id.to_string());
			send_line(&writer, format!("JOIN #{}", entry.login));
		}
	}

	/// Handles one inbound frame. `sent_by_self` marks the local echo of a queued message.
	pub(crate) fn handle_raw(&self, raw: &str, sent_by_self: bool) {
		for line in split_lines(raw) {
			match parse_line(line) {
				Ok(message) => self.handle_message(message, sent_by_self),
				Err(e) => debug!(error = %e, line, "skipping unparsable chat line"),
			}
		}
	}

	fn self_login(&self) -> Option<String> {
		self.inner.auth.logged_in_user().map(|u| u.login)
	}

	fn is_self(&self, prefix: Option<&str>) -> bool {
		let prefix = prefix.map(parse_prefix).unwrap_or_default();
		prefix.username.is_some() && prefix.username == self.self_login()
	}

	fn channel_id_for(&self, name: &str) -> Option<String> {
		self.inner.channel_ids.read().get(name).cloned()
	}

	fn handle_message(&self, message: IrcMessage, sent_by_self: bool) {
		match message.command.as_str() {
			"PING" => {
				if let Some(writer) = self.writer() {
					send_line(&writer, format!("PONG :{}", message.message.as_deref().unwrap_or_default()));
				}
			}
			"376" => self.on_end_of_motd(),
			"NOTICE" => {
				if message.message.as_deref() == Some(LOGIN_FAILED_NOTICE) {
					warn!(notice = LOGIN_FAILED_NOTICE, "twitch chat login failed");
					let engine = self.clone();
					tokio::spawn(async move { engine.stop().await });
				}
				self.on_chat_message(message, sent_by_self);
			}
			"USERNOTICE" | "PRIVMSG" => self.on_chat_message(message, sent_by_self),
			"JOIN" => {
				let Some(name) = message.channel.as_deref() else {
					return;
				};
				if self.is_self(message.prefix.as_deref()) {
					match self.channel_id_for(name) {
						Some(id) => {
							info!(channel = name, channel_id = %id, "joined twitch channel");
							self.emit(ChatEvent::JoinedChannel(TwitchChannel::new(id, name)));
						}
						None => debug!(channel = name, "joined unknown channel"),
					}
				}
			}
			"PART" => {
				let Some(name) = message.channel.as_deref() else {
					return;
				};
				if self.is_self(message.prefix.as_deref()) {
					let Some(id) = self.inner.channel_ids.write().remove(name) else {
						debug!(channel = name, "left unknown channel");
						return;
					};
					self.inner.rooms.update(name, None);
					self.inner.users.update_user_state(&id, None);
					info!(channel = name, channel_id = %id, "left twitch channel");
					self.emit(ChatEvent::LeftChannel(TwitchChannel::new(id, name)));
				}
			}
			"ROOMSTATE" => {
				let Some(name) = message.channel.as_deref() else {
					return;
				};
				let empty = Tags::new();
				let room = self.inner.rooms.update(name, Some(message.tags.as_ref().unwrap_or(&empty)));
				let id = self
					.channel_id_for(name)
					.or_else(|| room.map(|r| r.room_id).filter(|id| !id.is_empty()))
					.unwrap_or_default();
				self.emit(ChatEvent::RoomStateChanged(TwitchChannel::new(id, name)));
			}
			"USERSTATE" => {
				let Some(id) = message.channel.as_deref().and_then(|name| self.channel_id_for(name)) else {
					return;
				};
				self.inner.users.update_user_state(&id, message.tags.as_ref());
			}
			"GLOBALUSERSTATE" => self.inner.users.update_global_user_state(message.tags.as_ref()),
			"RECONNECT" => {
				info!("twitch chat requested a reconnect");
				let engine = self.clone();
				tokio::spawn(async move {
					engine.restart().await;
				});
			}
			_ => {}
		}
	}

	fn on_end_of_motd(&self) {
		let Some(writer) = self.writer() else {
			return;
		};
		self.emit(ChatEvent::Connected);

		for entry in self.inner.roster.active_channels() {
			self.inner
				.channel_ids
				.write()
				.insert(entry.login.clone(), entry.id.to_string());
			send_line(&writer, format!("JOIN #{}", entry.login));
		}

		let worker_cancel = CancelToken::new();
		{
			let mut guard = self.inner.session.lock();
			let Some(session) = guard.as_mut() else {
				return;
			};
			if let Some(previous) = session.worker_cancel.replace(worker_cancel.clone()) {
				previous.cancel();
			}
		}

		let sink: Arc<dyn OutboundSink> = Arc::new(SessionSink {
			engine: self.clone(),
			writer,
		});
		tokio::spawn(run_worker(self.inner.queue.clone(), sink, worker_cancel));
	}

	fn resolve_badges(&self, badges: Option<&str>, channel_id: &str, into: &mut Vec<ChatBadge>) {
		for identifier in badges.into_iter().flat_map(|b| b.split(',')).filter(|b| !b.is_empty()) {
			if let Some(badge) = self.inner.media.badge(identifier, channel_id) {
				into.push(badge);
			}
		}
	}

	fn on_chat_message(&self, message: IrcMessage, sent_by_self: bool) {
		if let Some(msg) = self.build_message(message, sent_by_self) {
			self.emit(ChatEvent::MessageReceived(Box::new(msg)));
		}
	}

	pub(crate) fn build_message(&self, message: IrcMessage, sent_by_self: bool) -> Option<TwitchMessage> {
		let channel_name = message.channel.clone()?;
		let channel_id = message
			.tag("room-id")
			.map(str::to_string)
			.or_else(|| self.channel_id_for(&channel_name))
			.unwrap_or_default();

		let global = self.inner.users.global_user_state();
		let user_state = self.inner.users.user_state(&channel_id);
		let logged_in = self.inner.auth.logged_in_user();

		let self_display_name = global
			.as_ref()
			.map(|g| g.display_name.clone())
			.filter(|n| !n.is_empty())
			.or_else(|| logged_in.as_ref().map(|u| u.login.clone()));

		let prefix: IrcPrefix = message.prefix.as_deref().map(parse_prefix).unwrap_or_default();

		let (id, bits, sender) = if sent_by_self {
			let mut badges = Vec::new();
			self.resolve_badges(global.as_ref().and_then(|g| g.badges.as_deref()), &channel_id, &mut badges);
			self.resolve_badges(user_state.as_ref().and_then(|s| s.badges.as_deref()), &channel_id, &mut badges);
			let state = user_state.clone().unwrap_or_default();

			let sender = ChatUser {
				id: global
					.as_ref()
					.map(|g| g.user_id.clone())
					.filter(|id| !id.is_empty())
					.or_else(|| logged_in.as_ref().map(|u| u.user_id.clone()))
					.unwrap_or_default(),
				login: logged_in.as_ref().map(|u| u.login.clone()).unwrap_or_default(),
				display_name: self_display_name.clone().unwrap_or_default(),
				color: global
					.as_ref()
					.and_then(|g| g.color.clone())
					.unwrap_or_else(|| DEFAULT_COLOR.to_string()),
				is_moderator: state.is_moderator,
				is_broadcaster: state.is_broadcaster,
				is_subscriber: state.is_subscriber,
				is_turbo: state.is_turbo,
				is_vip: state.is_vip,
				badges,
			};
			let id = message.tag("id").map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string());
			(id, 0, sender)
		} else {
			let login = prefix.login().unwrap_or_default().to_string();
			let badges_tag = message.tag("badges").filter(|b| !b.is_empty());
			let roles = badges_tag.map(BadgeRoles::from_badges).unwrap_or_default();
			let mut badges = Vec::new();
			self.resolve_badges(badges_tag, &channel_id, &mut badges);

			let sender = ChatUser {
				id: message.tag("user-id").unwrap_or_default().to_string(),
				display_name: message
					.tag("display-name")
					.filter(|n| !n.is_empty())
					.map(str::to_string)
					.unwrap_or_else(|| login.clone()),
				login,
				color: message
					.tag("color")
					.filter(|c| !c.is_empty())
					.unwrap_or(DEFAULT_COLOR)
					.to_string(),
				is_moderator: roles.is_moderator,
				is_broadcaster: roles.is_broadcaster,
				is_subscriber: roles.is_subscriber,
				is_turbo: roles.is_turbo,
				is_vip: roles.is_vip,
				badges,
			};
			let id = message.tag("id").map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string());
			let bits = message.tag("bits").and_then(|b| b.parse().ok()).unwrap_or(0);
			(id, bits, sender)
		};

		let mut text = message.message.clone().unwrap_or_default();
		let mut is_action_message = false;
		if let Some(action) = text.strip_prefix(ACTION_PREFIX) {
			text = action.strip_suffix('\u{1}').unwrap_or(action).to_string();
			is_action_message = true;
		}
		let is_mentioned = self_display_name
			.as_deref()
			.is_some_and(|name| text.contains(&format!("@{name}")));

		let emotes = if text.is_empty() {
			Vec::new()
		} else {
			extract_emotes(
				&text,
				message.tags.as_ref(),
				&channel_id,
				bits,
				&self.inner.settings.emotes,
				self.inner.media.as_ref(),
			)
		};

		Some(TwitchMessage {
			id,
			is_system_message: matches!(message.command.as_str(), "NOTICE" | "USERNOTICE"),
			is_action_message,
			is_mentioned,
			message: text,
			sender,
			channel: TwitchChannel::new(channel_id, channel_name),
			emotes,
			metadata: message.tags.unwrap_or_default(),
			command_type: message.command,
			bits,
		})
	}
}

fn send_line(writer: &WsWriter, line: String) {
	if let Err(e) = writer.try_send_text(line) {
		warn!(error = %e, "failed to write chat line");
	}
}

/// Worker sink bound to one socket: writes the line, then replays it as a local echo.
struct SessionSink {
	engine: ChatEngine,
	writer: WsWriter,
}

#[async_trait]
impl OutboundSink for SessionSink {
	fn tier(&self, channel_id: &str) -> RateLimitTier {
		let inner = &self.engine.inner;
		let is_self_channel = inner.auth.logged_in_user().is_some_and(|u| u.user_id == channel_id);
		if is_self_channel || inner.users.has_elevated_role(channel_id) {
			RateLimitTier::Relaxed
		} else {
			RateLimitTier::Normal
		}
	}

	async fn deliver(&self, message: &OutboundMessage) -> anyhow::Result<()> {
		self.writer.send_text(message.line.clone()).await?;
		self.engine.handle_raw(&message.line, true);
		Ok(())
	}
}
