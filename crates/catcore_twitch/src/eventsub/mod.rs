#![forbid(unsafe_code)]

//! EventSub over a conduit-backed websocket, one agent per tracked channel.

mod agent;
pub mod events;
mod helix;
mod manager;

#[cfg(test)]
mod tests;

use std::time::Duration;

use serde::Deserialize;

pub use agent::{AgentState, EventSubAgent};
pub use events::{
	ChannelChatMessageDeleteEvent, ChannelChatMessageEvent, ChannelFollowEvent, ChannelPointsRedeemEvent,
	ChannelPredictionBeginEvent, ChannelShoutoutCreateEvent, ChannelShoutoutReceiveEvent, ChannelSubscribeEvent,
	StreamOfflineEvent, StreamOnlineEvent, SUBSCRIBED_TYPES,
};
pub use helix::{
	ConduitApi, DEFAULT_HELIX_BASE_URL, HelixConduitClient, SubscriptionInfo, SubscriptionRequest, SubscriptionTransport,
};
pub use manager::{EventSubCallbacks, EventSubEvent, EventSubManager};

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

#[derive(Debug, Clone)]
pub struct EventSubSettings {
	pub ws_url: String,
	/// Pause between binding the shard and creating subscriptions.
	pub settle_delay: Duration,
	/// Pause between dropping the socket and redialling on a `reconnect` frame.
	pub reconnect_delay: Duration,
}

impl Default for EventSubSettings {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			settle_delay: Duration::from_secs(1),
			reconnect_delay: Duration::from_secs(1),
		}
	}
}

/// Metadata present on every websocket frame.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	#[serde(default)]
	pub(crate) message_id: String,
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) message_timestamp: String,
}

/// A frame with its payload left untyped until the message type is known.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubFrame {
	pub(crate) metadata: EventSubMetadata,
	#[serde(default)]
	pub(crate) payload: serde_json::Value,
}

impl EventSubFrame {
	pub(crate) fn session_id(&self) -> Option<&str> {
		self.payload
			.pointer("/session/id")
			.and_then(serde_json::Value::as_str)
			.filter(|id| !id.is_empty())
	}
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotificationPayload {
	pub(crate) subscription: EventSubSubscription,
	#[serde(default)]
	pub(crate) event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubRevocationPayload {
	pub(crate) subscription: EventSubSubscription,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSubscription {
	#[serde(default)]
	pub(crate) id: String,
	#[serde(default)]
	pub(crate) status: String,
	#[serde(rename = "type")]
	pub(crate) kind: String,
}
