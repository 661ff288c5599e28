#![forbid(unsafe_code)]

//! Legacy PubSub: one socket per tracked channel, topics requested lazily.

mod agent;
mod events;
mod manager;

#[cfg(test)]
mod tests;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use agent::PubSubAgent;
pub use events::{
	Follow, PollChoice, PollData, PollVotes, Redemption, RedemptionReward, RedemptionUser, RewardRedeemedData,
};
pub use manager::{PubSubCallbacks, PubSubEvent, PubSubManager};

pub const DEFAULT_PUBSUB_WS_URL: &str = "wss://pubsub-edge.twitch.tv";

pub mod topics {
	pub const FOLLOWING: &str = "following";
	pub const POLLS: &str = "polls";
	/// Only available on the channel the token belongs to.
	pub const CHANNEL_POINTS_CHANNEL_V1: &str = "channel-points-channel-v1";

	/// `<topic>.<channel_id>`, the form the server expects.
	pub fn qualified(topic: &str, channel_id: &str) -> String {
		format!("{topic}.{channel_id}")
	}

	/// Strips the trailing `.<channel_id>` from a qualified topic.
	pub fn base(qualified: &str) -> &str {
		qualified.rsplit_once('.').map_or(qualified, |(base, _)| base)
	}
}

#[derive(Debug, Clone)]
pub struct PubSubSettings {
	pub ws_url: String,
	pub ping_interval: Duration,
	/// Pause before redialling after a `RECONNECT` frame.
	pub reconnect_delay: Duration,
}

impl Default for PubSubSettings {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_PUBSUB_WS_URL.to_string(),
			ping_interval: Duration::from_secs(4 * 60),
			reconnect_delay: Duration::from_secs(1),
		}
	}
}

#[derive(Debug, Serialize)]
pub(crate) struct ListenRequest<'a> {
	#[serde(rename = "type")]
	pub(crate) kind: &'static str,
	pub(crate) nonce: String,
	pub(crate) data: ListenData<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ListenData<'a> {
	pub(crate) topics: Vec<String>,
	pub(crate) auth_token: &'a str,
}

impl<'a> ListenRequest<'a> {
	pub(crate) fn listen(topics: Vec<String>, auth_token: &'a str) -> Self {
		Self::new("LISTEN", topics, auth_token)
	}

	pub(crate) fn unlisten(topics: Vec<String>, auth_token: &'a str) -> Self {
		Self::new("UNLISTEN", topics, auth_token)
	}

	fn new(kind: &'static str, topics: Vec<String>, auth_token: &'a str) -> Self {
		Self {
			kind,
			nonce: uuid::Uuid::new_v4().simple().to_string(),
			data: ListenData { topics, auth_token },
		}
	}
}

/// Any frame the server sends. Fields not used by a given type stay empty.
#[derive(Debug, Deserialize)]
pub(crate) struct PubSubFrame {
	#[serde(rename = "type")]
	pub(crate) kind: String,
	#[serde(default)]
	pub(crate) nonce: Option<String>,
	#[serde(default)]
	pub(crate) error: Option<String>,
	#[serde(default)]
	pub(crate) data: Option<PubSubMessageData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PubSubMessageData {
	pub(crate) topic: String,
	/// JSON encoded as a string.
	pub(crate) message: String,
}
