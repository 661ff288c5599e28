#![forbid(unsafe_code)]

//! Log lines for every typed event the services publish.

use std::sync::Arc;

use catcore_twitch::eventsub::{
	ChannelChatMessageDeleteEvent, ChannelChatMessageEvent, ChannelFollowEvent, ChannelPointsRedeemEvent,
	ChannelPredictionBeginEvent, ChannelShoutoutCreateEvent, ChannelShoutoutReceiveEvent, ChannelSubscribeEvent,
	StreamOfflineEvent, StreamOnlineEvent,
};
use catcore_twitch::pubsub::{Follow, PollData, RewardRedeemedData};
use catcore_twitch::{ChatEngine, ChatEvent, EventSubManager, PubSubManager};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub fn register_eventsub(manager: &EventSubManager) {
	manager.add_callback::<StreamOnlineEvent>(Arc::new(|channel_id, e| {
		info!(%channel_id, kind = %e.kind, started_at = %e.started_at, "stream online");
	}));
	manager.add_callback::<StreamOfflineEvent>(Arc::new(|channel_id, _| {
		info!(%channel_id, "stream offline");
	}));
	manager.add_callback::<ChannelFollowEvent>(Arc::new(|channel_id, e| {
		info!(%channel_id, user = %e.user_login, "new follower");
	}));
	manager.add_callback::<ChannelSubscribeEvent>(Arc::new(|channel_id, e| {
		info!(%channel_id, user = %e.user_login, tier = %e.tier, is_gift = e.is_gift, "new subscriber");
	}));
	manager.add_callback::<ChannelPointsRedeemEvent>(Arc::new(|channel_id, e| {
		info!(
			%channel_id,
			user = %e.user_login,
			reward = %e.reward.title,
			cost = e.reward.cost,
			"channel points redeemed"
		);
	}));
	manager.add_callback::<ChannelPredictionBeginEvent>(Arc::new(|channel_id, e| {
		info!(%channel_id, title = %e.title, outcomes = e.outcomes.len(), "prediction started");
	}));
	manager.add_callback::<ChannelChatMessageEvent>(Arc::new(|channel_id, e| {
		info!(%channel_id, chatter = %e.chatter_user_login, text = %e.message.text, "eventsub chat message");
	}));
	manager.add_callback::<ChannelChatMessageDeleteEvent>(Arc::new(|channel_id, e| {
		info!(%channel_id, target = %e.target_user_login, message_id = %e.message_id, "chat message deleted");
	}));
	manager.add_callback::<ChannelShoutoutCreateEvent>(Arc::new(|channel_id, e| {
		info!(%channel_id, to = %e.to_broadcaster_user_login, "shoutout given");
	}));
	manager.add_callback::<ChannelShoutoutReceiveEvent>(Arc::new(|channel_id, e| {
		info!(%channel_id, from = %e.from_broadcaster_user_login, viewers = e.viewer_count, "shoutout received");
	}));
}

pub fn register_pubsub(manager: &PubSubManager) {
	manager.add_callback::<Follow>(Arc::new(|channel_id, e| {
		info!(%channel_id, user = %e.username, "pubsub follow");
	}));
	manager.add_callback::<PollData>(Arc::new(|channel_id, e| {
		info!(%channel_id, title = %e.title, status = %e.status, "poll update");
	}));
	manager.add_callback::<RewardRedeemedData>(Arc::new(|channel_id, e| {
		info!(
			%channel_id,
			user = %e.redemption.user.login,
			reward = %e.redemption.reward.title,
			"pubsub reward redeemed"
		);
	}));
}

/// Logs chat events until the engine's channel closes.
pub fn spawn_chat_logger(chat: &ChatEngine) -> JoinHandle<()> {
	let mut rx = chat.subscribe();
	tokio::spawn(async move {
		loop {
			match rx.recv().await {
				Ok(event) => log_chat_event(&event),
				Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "chat logger lagged"),
				Err(broadcast::error::RecvError::Closed) => break,
			}
		}
	})
}

fn log_chat_event(event: &ChatEvent) {
	match event {
		ChatEvent::Connected => info!("chat connected"),
		ChatEvent::JoinedChannel(ch) => info!(channel = %ch.name, "joined channel"),
		ChatEvent::LeftChannel(ch) => info!(channel = %ch.name, "left channel"),
		ChatEvent::RoomStateChanged(ch) => info!(channel = %ch.name, "room state changed"),
		ChatEvent::MessageReceived(msg) => info!(
			channel = %msg.channel.name,
			sender = %msg.sender.display_name,
			emotes = msg.emotes.len(),
			bits = msg.bits,
			"{}",
			msg.message
		),
	}
}
