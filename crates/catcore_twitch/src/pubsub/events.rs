#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Payload of a `following.<id>` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Follow {
	pub user_id: String,
	pub username: String,
	pub display_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollVotes {
	pub total: u32,
	pub bits: u32,
	pub channel_points: u32,
	pub base: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollChoice {
	pub choice_id: String,
	pub title: String,
	pub votes: PollVotes,
	pub total_voters: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollData {
	pub poll_id: String,
	pub owned_by: String,
	pub created_by: String,
	pub title: String,
	pub started_at: String,
	pub ended_at: Option<String>,
	pub ended_by: Option<String>,
	pub duration_seconds: u32,
	/// ACTIVE, COMPLETED, TERMINATED, ARCHIVED, ...
	pub status: String,
	pub choices: Vec<PollChoice>,
	pub votes: PollVotes,
	pub total_voters: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedemptionUser {
	pub id: String,
	pub login: String,
	pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedemptionReward {
	pub id: String,
	pub channel_id: String,
	pub title: String,
	pub prompt: String,
	pub cost: u32,
	pub is_user_input_required: bool,
	pub background_color: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Redemption {
	pub id: String,
	pub user: RedemptionUser,
	pub channel_id: String,
	pub redeemed_at: String,
	pub reward: RedemptionReward,
	pub user_input: Option<String>,
	pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardRedeemedData {
	pub timestamp: String,
	pub redemption: Redemption,
}

/// `{"type": "...", "data": {...}}` wrapper used by the polls and channel-points topics.
#[derive(Debug, Deserialize)]
pub(crate) struct TypedMessage {
	#[serde(rename = "type")]
	pub(crate) kind: String,
	#[serde(default)]
	pub(crate) data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PollEnvelope {
	pub(crate) poll: PollData,
}
