use std::sync::Arc;
use std::time::Duration;

use catcore_domain::{ChannelId, ChannelRosterEntry};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{Follow, PollData, PubSubManager, PubSubSettings, RewardRedeemedData, topics};
use crate::auth::TwitchCredentials;
use crate::callbacks::Callback;
use crate::roster::ChannelRoster;
use crate::testing::{SELF_USER_ID, authenticated_store};
use crate::ws::testing::{ServerSide, memory_connector};

const WAIT: Duration = Duration::from_secs(2);

fn settings() -> PubSubSettings {
	PubSubSettings {
		reconnect_delay: Duration::from_millis(10),
		..PubSubSettings::default()
	}
}

fn roster(ids: &[(&str, &str)]) -> Arc<ChannelRoster> {
	Arc::new(ChannelRoster::new(
		ids.iter()
			.map(|(id, login)| ChannelRosterEntry::new(ChannelId::new(*id).unwrap(), *login))
			.collect(),
	))
}

async fn accept(rx: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
	timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

async fn next_request(server: &mut ServerSide) -> Value {
	let text = timeout(WAIT, server.next_text()).await.unwrap().expect("socket closed");
	serde_json::from_str(&text).unwrap()
}

fn message(topic: &str, inner: Value) -> String {
	json!({"type": "MESSAGE", "data": {"topic": topic, "message": inner.to_string()}}).to_string()
}

#[test]
fn topic_names_round_trip_through_the_channel_suffix() {
	assert_eq!(topics::qualified(topics::POLLS, "42"), "polls.42");
	assert_eq!(topics::base("channel-points-channel-v1.42"), "channel-points-channel-v1");
	assert_eq!(topics::base("following"), "following");
}

#[tokio::test]
async fn first_callback_connects_and_listens_with_the_token() {
	let store = authenticated_store("tok").await;
	let (connector, mut accept_rx) = memory_connector();
	let manager = PubSubManager::new(settings(), store, roster(&[("42", "bar")]), connector);
	manager.start();
	assert!(accept_rx.try_recv().is_err(), "no socket before any callback");

	let (tx, mut rx) = mpsc::unbounded_channel();
	let cb: Callback<Follow> = Arc::new(move |channel, follow| {
		let _ = tx.send((channel.to_string(), follow.username.clone()));
	});
	manager.add_callback(cb);

	let mut server = accept(&mut accept_rx).await;
	assert_eq!(server.url.as_str(), "wss://pubsub-edge.twitch.tv/");
	let listen = next_request(&mut server).await;
	assert_eq!(listen["type"], "LISTEN");
	assert_eq!(listen["data"]["topics"], json!(["following.42"]));
	assert_eq!(listen["data"]["auth_token"], "tok");
	assert!(!listen["nonce"].as_str().unwrap().is_empty());

	server.push(r#"{"type":"RESPONSE","nonce":"n","error":""}"#).await;
	server.push("garbage").await;
	server
		.push(message(
			"following.42",
			json!({"user_id": "5", "username": "foo", "display_name": "Foo"}),
		))
		.await;
	assert_eq!(
		timeout(WAIT, rx.recv()).await.unwrap(),
		Some(("42".to_string(), "foo".to_string()))
	);
	manager.shutdown().await;
}

#[tokio::test]
async fn channel_points_only_reach_the_self_channel() {
	let store = authenticated_store("tok").await;
	let (connector, mut accept_rx) = memory_connector();
	let manager = PubSubManager::new(
		settings(),
		store,
		roster(&[("42", "bar"), (SELF_USER_ID, "catbot")]),
		connector,
	);
	manager.start();

	let (tx, mut rx) = mpsc::unbounded_channel();
	let cb: Callback<RewardRedeemedData> = Arc::new(move |channel, data| {
		let _ = tx.send((channel.to_string(), data.redemption.reward.title.clone()));
	});
	manager.add_callback(cb);

	let mut server = accept(&mut accept_rx).await;
	let listen = next_request(&mut server).await;
	assert_eq!(
		listen["data"]["topics"],
		json!([format!("channel-points-channel-v1.{SELF_USER_ID}")])
	);
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(accept_rx.try_recv().is_err(), "other channels stay disconnected");
	assert!(!manager.agent("42").unwrap().is_connected());

	let topic = format!("channel-points-channel-v1.{SELF_USER_ID}");
	server
		.push(message(&topic, json!({"type": "custom-reward-updated", "data": {}})))
		.await;
	server
		.push(message(
			&topic,
			json!({"type": "reward-redeemed", "data": {"timestamp": "t", "redemption": {"id": "r1",
				"reward": {"title": "Hydrate", "cost": 100}}}}),
		))
		.await;
	assert_eq!(
		timeout(WAIT, rx.recv()).await.unwrap(),
		Some((SELF_USER_ID.to_string(), "Hydrate".to_string()))
	);
	manager.shutdown().await;
}

#[tokio::test]
async fn second_topic_on_a_live_socket_sends_its_own_listen() {
	let store = authenticated_store("tok").await;
	let (connector, mut accept_rx) = memory_connector();
	let manager = PubSubManager::new(settings(), store, roster(&[("42", "bar")]), connector);
	manager.start();

	let follow: Callback<Follow> = Arc::new(|_, _| {});
	manager.add_callback(follow.clone());
	let mut server = accept(&mut accept_rx).await;
	next_request(&mut server).await;

	let (tx, mut rx) = mpsc::unbounded_channel();
	let poll: Callback<PollData> = Arc::new(move |_, data| {
		let _ = tx.send(data.title.clone());
	});
	manager.add_callback(poll.clone());
	let listen = next_request(&mut server).await;
	assert_eq!(listen["type"], "LISTEN");
	assert_eq!(listen["data"]["topics"], json!(["polls.42"]));

	server
		.push(message(
			"polls.42",
			json!({"type": "POLL_CREATE", "data": {"poll": {"poll_id": "p", "title": "Best cat?"}}}),
		))
		.await;
	assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().as_deref(), Some("Best cat?"));

	manager.remove_callback(&poll);
	let unlisten = next_request(&mut server).await;
	assert_eq!(unlisten["type"], "UNLISTEN");
	assert_eq!(unlisten["data"]["topics"], json!(["polls.42"]));

	manager.remove_callback(&follow);
	assert_eq!(timeout(WAIT, server.next_text()).await.unwrap(), None, "last topic closes the socket");
	manager.shutdown().await;
}

#[tokio::test]
async fn reconnect_frame_redials_and_relistens() {
	let store = authenticated_store("tok").await;
	let (connector, mut accept_rx) = memory_connector();
	let manager = PubSubManager::new(settings(), store, roster(&[("42", "bar")]), connector);
	manager.start();
	manager.add_callback::<Follow>(Arc::new(|_, _| {}));

	let mut old = accept(&mut accept_rx).await;
	next_request(&mut old).await;
	old.push(r#"{"type":"RECONNECT"}"#).await;
	assert_eq!(timeout(WAIT, old.next_text()).await.unwrap(), None);

	let mut fresh = accept(&mut accept_rx).await;
	let listen = next_request(&mut fresh).await;
	assert_eq!(listen["data"]["topics"], json!(["following.42"]));
	manager.shutdown().await;
}

#[tokio::test]
async fn credential_loss_disconnects_and_restore_reconnects() {
	let store = authenticated_store("tok").await;
	let (connector, mut accept_rx) = memory_connector();
	let manager = PubSubManager::new(settings(), store.clone(), roster(&[("42", "bar")]), connector);
	let _watchers = manager.spawn_watchers();
	manager.start();
	manager.add_callback::<Follow>(Arc::new(|_, _| {}));

	let mut server = accept(&mut accept_rx).await;
	next_request(&mut server).await;

	let saved = store.credentials();
	store.update_credentials(TwitchCredentials::empty());
	assert_eq!(timeout(WAIT, server.next_text()).await.unwrap(), None);

	store.update_credentials(saved);
	let mut fresh = accept(&mut accept_rx).await;
	let listen = next_request(&mut fresh).await;
	assert_eq!(listen["data"]["topics"], json!(["following.42"]));
	manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_callback_churn_leaves_the_topic_set_consistent() {
	let store = authenticated_store("tok").await;
	let (connector, _accept) = memory_connector();
	let manager = PubSubManager::new(settings(), store, roster(&[]), connector);

	let workers: Vec<_> = (0..4)
		.map(|n| {
			let manager = manager.clone();
			tokio::spawn(async move {
				let cb: Callback<Follow> = Arc::new(|_, _| {});
				for _ in 0..500 {
					manager.add_callback(cb.clone());
					manager.remove_callback(&cb);
				}
				// Odd workers leave their callback registered.
				if n % 2 == 1 {
					manager.add_callback(cb.clone());
				}
				cb
			})
		})
		.collect();
	let mut callbacks = Vec::new();
	for worker in workers {
		callbacks.push(timeout(WAIT * 5, worker).await.unwrap().unwrap());
	}

	assert_eq!(manager.registered_topics(), vec![topics::FOLLOWING.to_string()]);
	for cb in &callbacks {
		manager.remove_callback(cb);
	}
	assert!(manager.registered_topics().is_empty());
}
