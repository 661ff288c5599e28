use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use catcore_domain::{ChannelId, ChannelRosterEntry};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::events::types;
use super::helix::{ConduitApi, SubscriptionInfo, SubscriptionRequest, SubscriptionTransport};
use super::manager::{EventSubCallbacks, EventSubEvent};
use super::{
	AgentState, ChannelChatMessageEvent, EventSubAgent, EventSubManager, EventSubSettings, StreamOnlineEvent,
	SUBSCRIBED_TYPES,
};
use crate::auth::{CredentialStore, TwitchCredentials};
use crate::callbacks::Callback;
use crate::roster::ChannelRoster;
use crate::testing::authenticated_store;
use crate::ws::testing::{ServerSide, memory_connector};

const WAIT: Duration = Duration::from_secs(2);

/// In-memory Helix: created subscriptions show up in later listings.
#[derive(Default)]
struct FakeConduitApi {
	subscriptions: Mutex<Vec<SubscriptionInfo>>,
	created: Mutex<Vec<SubscriptionRequest>>,
	shards: Mutex<Vec<(String, String)>>,
	deleted: Mutex<Vec<String>>,
	deleted_conduits: Mutex<Vec<String>>,
	conduits: AtomicUsize,
	lists: AtomicUsize,
	fail_assign: AtomicBool,
}

impl FakeConduitApi {
	fn created_types(&self) -> Vec<String> {
		self.created.lock().iter().map(|r| r.kind.clone()).collect()
	}

	fn shard_count(&self) -> usize {
		self.shards.lock().len()
	}
}

#[async_trait]
impl ConduitApi for FakeConduitApi {
	async fn list_subscriptions(&self) -> anyhow::Result<Vec<SubscriptionInfo>> {
		self.lists.fetch_add(1, Ordering::SeqCst);
		Ok(self.subscriptions.lock().clone())
	}

	async fn create_conduit(&self, shard_count: u32) -> anyhow::Result<String> {
		assert_eq!(shard_count, 1);
		let n = self.conduits.fetch_add(1, Ordering::SeqCst) + 1;
		Ok(format!("c{n}"))
	}

	async fn assign_shard(&self, conduit_id: &str, shard_id: &str, session_id: &str) -> anyhow::Result<()> {
		assert_eq!(shard_id, "0");
		self.shards.lock().push((conduit_id.to_string(), session_id.to_string()));
		if self.fail_assign.load(Ordering::SeqCst) {
			anyhow::bail!("shard rejected");
		}
		Ok(())
	}

	async fn create_subscription(&self, request: &SubscriptionRequest) -> anyhow::Result<SubscriptionInfo> {
		let mut created = self.created.lock();
		created.push(request.clone());
		let info = SubscriptionInfo {
			id: format!("sub-{}", created.len()),
			status: "enabled".into(),
			kind: request.kind.clone(),
			version: request.version.clone(),
			condition: request.condition.clone(),
			transport: Some(request.transport.clone()),
		};
		self.subscriptions.lock().push(info.clone());
		Ok(info)
	}

	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<()> {
		self.deleted.lock().push(subscription_id.to_string());
		self.subscriptions.lock().retain(|s| s.id != subscription_id);
		Ok(())
	}

	async fn delete_conduit(&self, conduit_id: &str) -> anyhow::Result<()> {
		self.deleted_conduits.lock().push(conduit_id.to_string());
		Ok(())
	}
}

fn settings() -> EventSubSettings {
	EventSubSettings {
		settle_delay: Duration::ZERO,
		reconnect_delay: Duration::from_millis(10),
		..EventSubSettings::default()
	}
}

fn welcome(session_id: &str) -> String {
	json!({
		"metadata": {"message_id": "m0", "message_type": "session_welcome", "message_timestamp": "2024-01-01T00:00:00Z"},
		"payload": {"session": {"id": session_id, "status": "connected", "connected_at": "2024-01-01T00:00:00Z",
			"keepalive_timeout_seconds": 10, "reconnect_url": null}}
	})
	.to_string()
}

fn frame(message_type: &str, payload: serde_json::Value) -> String {
	json!({
		"metadata": {"message_id": "m1", "message_type": message_type, "message_timestamp": "2024-01-01T00:00:00Z"},
		"payload": payload
	})
	.to_string()
}

fn notification(kind: &str, event: serde_json::Value) -> String {
	frame(
		"notification",
		json!({
			"subscription": {"id": "sub-x", "status": "enabled", "type": kind, "version": "1",
				"condition": {}, "transport": {"method": "conduit", "conduit_id": "c1"}, "created_at": ""},
			"event": event
		}),
	)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
	timeout(WAIT, async {
		while !cond() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("condition not reached in time");
}

struct Fixture {
	agent: EventSubAgent,
	api: Arc<FakeConduitApi>,
	callbacks: Arc<EventSubCallbacks>,
	accept: mpsc::UnboundedReceiver<ServerSide>,
}

async fn fixture() -> Fixture {
	let store = authenticated_store("tok").await;
	let api = Arc::new(FakeConduitApi::default());
	let (connector, accept) = memory_connector();
	let callbacks = Arc::new(EventSubCallbacks::new());
	let agent = EventSubAgent::new("42", settings(), store, api.clone(), connector, callbacks.clone());
	Fixture {
		agent,
		api,
		callbacks,
		accept,
	}
}

async fn accept(accept: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
	timeout(WAIT, accept.recv()).await.unwrap().unwrap()
}

/// Starts, binds the shard and waits until all subscriptions exist.
async fn active(f: &mut Fixture) -> ServerSide {
	assert!(f.agent.start(false).await);
	let server = accept(&mut f.accept).await;
	server.push(welcome("s1")).await;
	let agent = f.agent.clone();
	wait_until(move || agent.state() == AgentState::SubscriptionsActive).await;
	server
}

#[tokio::test]
async fn concurrent_starts_open_one_socket() {
	let mut f = fixture().await;
	let (a, b) = tokio::join!(f.agent.start(false), f.agent.start(false));
	assert!(a || b);

	let server = accept(&mut f.accept).await;
	assert_eq!(server.url.as_str(), "wss://eventsub.wss.twitch.tv/ws");
	assert!(f.accept.try_recv().is_err());
	assert_eq!(f.api.conduits.load(Ordering::SeqCst), 1);
	assert_eq!(f.agent.state(), AgentState::AwaitingSessionId);
}

#[tokio::test]
async fn first_session_id_binds_the_shard_and_subscribes() {
	let mut f = fixture().await;
	let _server = active(&mut f).await;

	assert_eq!(f.api.shards.lock().clone(), vec![("c1".to_string(), "s1".to_string())]);
	assert_eq!(f.api.created_types(), SUBSCRIBED_TYPES.map(String::from).to_vec());

	let created = f.api.created.lock().clone();
	let chat = created.iter().find(|r| r.kind == types::CHANNEL_CHAT_MESSAGE).unwrap();
	assert_eq!(chat.condition, json!({"broadcaster_user_id": "42", "user_id": "1000"}));
	assert_eq!(
		chat.transport,
		SubscriptionTransport {
			method: "conduit".into(),
			conduit_id: Some("c1".into()),
			session_id: None,
		}
	);
	let follow = created.iter().find(|r| r.kind == types::CHANNEL_FOLLOW).unwrap();
	assert_eq!(follow.version, "2");
	assert_eq!(f.agent.registered_types().len(), 10);
}

#[tokio::test]
async fn reconnect_redials_once_without_duplicate_subscriptions() {
	let mut f = fixture().await;
	let mut old = active(&mut f).await;

	old.push(frame("reconnect", json!({"session": {"id": "s1", "status": "reconnecting",
		"reconnect_url": "wss://eventsub.wss.twitch.tv/ws?id=s1"}})))
		.await;
	assert_eq!(timeout(WAIT, old.next_text()).await.unwrap(), None);

	let fresh = accept(&mut f.accept).await;
	fresh.push(welcome("s2")).await;
	let api = f.api.clone();
	let agent = f.agent.clone();
	wait_until(move || api.shard_count() == 2 && agent.state() == AgentState::SubscriptionsActive).await;

	assert!(f.accept.try_recv().is_err(), "exactly one new connection");
	assert_eq!(f.api.created.lock().len(), 10);
	assert_eq!(f.api.conduits.load(Ordering::SeqCst), 1, "conduit is reused");
	assert_eq!(f.api.shards.lock()[1], ("c1".to_string(), "s2".to_string()));
}

/// Stops an active agent, lets `edit` change the server side, then starts it on session "s2".
async fn restart_after(f: &mut Fixture, edit: impl FnOnce(&mut Vec<SubscriptionInfo>)) {
	f.agent.stop().await;
	edit(&mut f.api.subscriptions.lock());
	assert!(f.agent.start(false).await);
	let server = accept(&mut f.accept).await;
	server.push(welcome("s2")).await;
	let agent = f.agent.clone();
	wait_until(move || agent.state() == AgentState::SubscriptionsActive).await;
}

fn live_on(api: &FakeConduitApi, conduit_id: &str) -> usize {
	api.subscriptions
		.lock()
		.iter()
		.filter(|s| s.conduit_id() == Some(conduit_id))
		.count()
}

#[tokio::test]
async fn restart_after_the_server_lost_its_subscriptions_recreates_them() {
	let mut f = fixture().await;
	let _old = active(&mut f).await;

	restart_after(&mut f, |subs| subs.clear()).await;

	assert_eq!(f.agent.conduit_id().as_deref(), Some("c2"));
	assert_eq!(f.api.created.lock().len(), 20);
	assert_eq!(live_on(&f.api, "c2"), 10);
	assert_eq!(f.agent.registered_types().len(), 10);
}

#[tokio::test]
async fn restart_for_a_different_user_moves_to_a_new_conduit() {
	let mut f = fixture().await;
	let _old = active(&mut f).await;

	// the old conduit now carries a chat subscription the current identity does not own
	restart_after(&mut f, |subs| {
		for sub in subs.iter_mut().filter(|s| s.kind == types::CHANNEL_CHAT_MESSAGE) {
			sub.condition = json!({"broadcaster_user_id": "42", "user_id": "999"});
		}
	})
	.await;

	assert_eq!(f.api.conduits.load(Ordering::SeqCst), 2);
	assert_eq!(f.agent.conduit_id().as_deref(), Some("c2"));
	assert_eq!(live_on(&f.api, "c2"), 10);
}

#[tokio::test]
async fn disabled_subscriptions_on_a_reused_conduit_are_recreated() {
	let mut f = fixture().await;
	let _old = active(&mut f).await;

	restart_after(&mut f, |subs| {
		for sub in subs.iter_mut().filter(|s| s.kind == types::STREAM_ONLINE) {
			sub.status = "websocket_disconnected".into();
		}
	})
	.await;

	assert_eq!(f.agent.conduit_id().as_deref(), Some("c1"));
	assert_eq!(f.api.conduits.load(Ordering::SeqCst), 1);
	let created = f.api.created_types();
	assert_eq!(created.len(), 11);
	assert_eq!(created[10], types::STREAM_ONLINE);
}

#[tokio::test]
async fn existing_subscriptions_on_the_conduit_are_not_recreated() {
	let mut f = fixture().await;
	f.api.subscriptions.lock().push(SubscriptionInfo {
		id: "old-1".into(),
		status: "enabled".into(),
		kind: types::STREAM_ONLINE.into(),
		version: "1".into(),
		condition: json!({"broadcaster_user_id": "42"}),
		transport: Some(SubscriptionTransport {
			method: "conduit".into(),
			conduit_id: Some("existing".into()),
			session_id: None,
		}),
	});
	let _server = active(&mut f).await;

	assert_eq!(f.agent.conduit_id().as_deref(), Some("existing"));
	assert_eq!(f.api.conduits.load(Ordering::SeqCst), 0);
	assert_eq!(f.api.created.lock().len(), 9);
	assert!(!f.api.created_types().contains(&types::STREAM_ONLINE.to_string()));
}

#[tokio::test]
async fn each_channel_gets_its_own_conduit_and_events_keep_their_channel() {
	let mut f = fixture().await;
	let first = active(&mut f).await;

	let store = authenticated_store("tok").await;
	let (connector, mut accept_rx) = memory_connector();
	let other = EventSubAgent::new("7", settings(), store, f.api.clone(), connector, f.callbacks.clone());
	assert!(other.start(false).await);
	let second = accept(&mut accept_rx).await;
	second.push(welcome("s2")).await;
	let agent = other.clone();
	wait_until(move || agent.state() == AgentState::SubscriptionsActive).await;

	assert_eq!(other.conduit_id().as_deref(), Some("c2"));
	assert_eq!(
		f.api.shards.lock().clone(),
		vec![("c1".to_string(), "s1".to_string()), ("c2".to_string(), "s2".to_string())]
	);
	assert_eq!(f.api.created.lock().len(), 20);

	let (tx, mut rx) = mpsc::unbounded_channel();
	let cb: Callback<StreamOnlineEvent> = Arc::new(move |channel, event| {
		let _ = tx.send((channel.to_string(), event.broadcaster_user_id.clone()));
	});
	StreamOnlineEvent::callbacks(&f.callbacks).add(cb);

	let online = |id: &str| {
		notification(
			types::STREAM_ONLINE,
			json!({"id": "9", "broadcaster_user_id": id, "type": "live"}),
		)
	};
	second.push(online("42")).await;
	second.push(online("7")).await;
	first.push(online("42")).await;

	let mut got = vec![
		timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
		timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
	];
	got.sort();
	assert_eq!(
		got,
		vec![("42".to_string(), "42".to_string()), ("7".to_string(), "7".to_string())]
	);
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(rx.try_recv().is_err(), "a foreign broadcaster is never relabelled");
}

#[tokio::test]
async fn a_conduit_shared_with_another_channel_is_not_reused() {
	let mut f = fixture().await;
	let transport = Some(SubscriptionTransport {
		method: "conduit".into(),
		conduit_id: Some("shared".into()),
		session_id: None,
	});
	for (id, broadcaster) in [("a", "42"), ("b", "7")] {
		f.api.subscriptions.lock().push(SubscriptionInfo {
			id: id.into(),
			status: "enabled".into(),
			kind: types::STREAM_ONLINE.into(),
			version: "1".into(),
			condition: json!({"broadcaster_user_id": broadcaster}),
			transport: transport.clone(),
		});
	}
	let _server = active(&mut f).await;

	assert_eq!(f.agent.conduit_id().as_deref(), Some("c1"));
	assert_eq!(f.api.created.lock().len(), 10);
}

#[tokio::test]
async fn notifications_reach_typed_callbacks_and_bad_frames_are_skipped() {
	let mut f = fixture().await;
	let server = active(&mut f).await;

	let (tx, mut rx) = mpsc::unbounded_channel();
	let cb: Callback<ChannelChatMessageEvent> = Arc::new(move |channel, event| {
		let _ = tx.send((channel.to_string(), event.message.text.clone()));
	});
	ChannelChatMessageEvent::callbacks(&f.callbacks).add(cb);

	server.push("{not json").await;
	server.push(notification("channel.unknown", json!({}))).await;
	server
		.push(notification(
			types::CHANNEL_CHAT_MESSAGE,
			json!({"broadcaster_user_id": "42", "chatter_user_login": "foo", "message": {"text": "hello"}}),
		))
		.await;

	let (channel, text) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
	assert_eq!(channel, "42");
	assert_eq!(text, "hello");
	assert!(f.agent.is_connected());
}

#[tokio::test]
async fn revocation_drops_the_type_until_the_next_cycle() {
	let mut f = fixture().await;
	let server = active(&mut f).await;

	server
		.push(frame(
			"revocation",
			json!({"subscription": {"id": "sub-1", "status": "authorization_revoked", "type": types::STREAM_ONLINE}}),
		))
		.await;
	let agent = f.agent.clone();
	wait_until(move || !agent.registered_types().contains(&types::STREAM_ONLINE.to_string())).await;
	assert_eq!(f.api.created.lock().len(), 10);
	assert!(f.agent.is_connected());
}

#[tokio::test]
async fn failed_shard_binding_abandons_the_session() {
	let mut f = fixture().await;
	f.api.fail_assign.store(true, Ordering::SeqCst);
	assert!(f.agent.start(false).await);
	let mut server = accept(&mut f.accept).await;
	server.push(welcome("s1")).await;

	assert_eq!(timeout(WAIT, server.next_text()).await.unwrap(), None);
	let agent = f.agent.clone();
	wait_until(move || agent.conduit_id().is_none()).await;
	assert_eq!(f.agent.state(), AgentState::Idle);
	assert!(f.api.created.lock().is_empty());
}

#[tokio::test]
async fn dispose_deletes_every_subscription_then_closes() {
	let mut f = fixture().await;
	let mut server = active(&mut f).await;

	f.agent.dispose().await;
	assert_eq!(f.api.deleted.lock().len(), 10);
	assert!(f.agent.registered_types().is_empty());
	assert_eq!(f.api.deleted_conduits.lock().clone(), vec!["c1".to_string()]);
	assert_eq!(timeout(WAIT, server.next_text()).await.unwrap(), None);
	assert!(!f.agent.start(false).await, "disposed agents stay down");
}

#[tokio::test]
async fn start_without_tokens_is_a_no_op() {
	let mut f = fixture().await;
	let store: Arc<CredentialStore> = authenticated_store("tok").await;
	store.update_credentials(TwitchCredentials::empty());
	let (connector, mut accept_rx) = memory_connector();
	let agent = EventSubAgent::new("42", settings(), store, f.api.clone(), connector, f.callbacks.clone());

	assert!(!agent.start(false).await);
	assert!(accept_rx.try_recv().is_err());
	assert!(f.accept.try_recv().is_err());
	assert_eq!(f.api.lists.load(Ordering::SeqCst), 0);
}

fn roster() -> Arc<ChannelRoster> {
	Arc::new(ChannelRoster::new(vec![ChannelRosterEntry::new(
		ChannelId::new("42").unwrap(),
		"bar",
	)]))
}

#[tokio::test]
async fn first_callback_connects_agents_and_receives_events() {
	let store = authenticated_store("tok").await;
	let api = Arc::new(FakeConduitApi::default());
	let (connector, mut accept_rx) = memory_connector();
	let manager = EventSubManager::new(settings(), store, roster(), api.clone(), connector);
	manager.start();
	assert_eq!(manager.agent_count(), 1);
	assert!(accept_rx.try_recv().is_err(), "no socket before any callback");

	let (tx, mut rx) = mpsc::unbounded_channel();
	let cb: Callback<StreamOnlineEvent> = Arc::new(move |channel, event| {
		let _ = tx.send((channel.to_string(), event.broadcaster_user_login.clone()));
	});
	manager.add_callback(cb.clone());

	let server = accept(&mut accept_rx).await;
	server.push(welcome("s1")).await;
	server
		.push(notification(
			types::STREAM_ONLINE,
			json!({"id": "9", "broadcaster_user_id": "42", "broadcaster_user_login": "bar", "type": "live"}),
		))
		.await;
	assert_eq!(
		timeout(WAIT, rx.recv()).await.unwrap(),
		Some(("42".to_string(), "bar".to_string()))
	);

	let agent = manager.agent("42").unwrap();
	wait_until(move || agent.state() == AgentState::SubscriptionsActive).await;
	manager.remove_callback(&cb);
	manager.stop().await;
	assert_eq!(manager.agent_count(), 0);
	assert_eq!(api.deleted.lock().len(), api.created.lock().len());
}

#[tokio::test]
async fn roster_changes_replace_agents() {
	let store = authenticated_store("tok").await;
	let roster = roster();
	let (connector, _accept) = memory_connector();
	let manager = EventSubManager::new(
		settings(),
		store,
		roster.clone(),
		Arc::new(FakeConduitApi::default()),
		connector,
	);
	let _watchers = manager.spawn_watchers();
	manager.start();

	roster.set_channels(vec![ChannelRosterEntry::new(ChannelId::new("7").unwrap(), "baz")]);
	let m = manager.clone();
	wait_until(move || m.agent("7").is_some() && m.agent("42").is_none()).await;
	assert_eq!(manager.agent_count(), 1);
	manager.shutdown().await;
}

#[tokio::test]
async fn losing_credentials_stops_agents() {
	let store = authenticated_store("tok").await;
	let (connector, mut accept_rx) = memory_connector();
	let manager = EventSubManager::new(
		settings(),
		store.clone(),
		roster(),
		Arc::new(FakeConduitApi::default()),
		connector,
	);
	let _watchers = manager.spawn_watchers();
	manager.start();
	let agent = manager.agent("42").unwrap();
	assert!(agent.start(false).await);
	let mut server = accept(&mut accept_rx).await;

	store.update_credentials(TwitchCredentials::empty());
	assert_eq!(timeout(WAIT, server.next_text()).await.unwrap(), None);
	assert!(!agent.is_connected());
	assert_eq!(manager.agent_count(), 1, "agents survive credential loss");
	manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_add_and_remove_keep_topics_in_step_with_callbacks() {
	let store = authenticated_store("tok").await;
	let (connector, _accept) = memory_connector();
	let manager = EventSubManager::new(
		settings(),
		store,
		Arc::new(ChannelRoster::new(Vec::new())),
		Arc::new(FakeConduitApi::default()),
		connector,
	);

	let workers: Vec<_> = (0..4)
		.map(|_| {
			let manager = manager.clone();
			tokio::spawn(async move {
				let cb: Callback<StreamOnlineEvent> = Arc::new(|_, _| {});
				for _ in 0..500 {
					manager.add_callback(cb.clone());
					manager.remove_callback(&cb);
				}
			})
		})
		.collect();
	for worker in workers {
		timeout(WAIT * 5, worker).await.unwrap().unwrap();
	}

	assert!(manager.registered_topics().is_empty());
	let cb: Callback<StreamOnlineEvent> = Arc::new(|_, _| {});
	manager.add_callback(cb);
	assert_eq!(manager.registered_topics(), vec![types::STREAM_ONLINE.to_string()]);
}
