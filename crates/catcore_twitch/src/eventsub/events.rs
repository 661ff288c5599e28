#![forbid(unsafe_code)]

//! Typed EventSub notification payloads and the subscription catalogue.
//!
//! Every field defaults when Twitch leaves it out, so a trimmed payload still
//! reaches its callbacks.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub mod types {
	pub const STREAM_ONLINE: &str = "stream.online";
	pub const STREAM_OFFLINE: &str = "stream.offline";
	pub const CHANNEL_FOLLOW: &str = "channel.follow";
	pub const CHANNEL_SUBSCRIBE: &str = "channel.subscribe";
	pub const CHANNEL_POINTS_REDEEM: &str = "channel.channel_points_custom_reward_redemption.add";
	pub const CHANNEL_PREDICTION_BEGIN: &str = "channel.prediction.begin";
	pub const CHANNEL_CHAT_MESSAGE: &str = "channel.chat.message";
	pub const CHANNEL_CHAT_MESSAGE_DELETE: &str = "channel.chat.message_delete";
	pub const CHANNEL_SHOUTOUT_CREATE: &str = "channel.shoutout.create";
	pub const CHANNEL_SHOUTOUT_RECEIVE: &str = "channel.shoutout.receive";

	pub const CHANNEL_UPDATE: &str = "channel.update";
	pub const CHANNEL_RAID: &str = "channel.raid";
	pub const CHANNEL_BAN: &str = "channel.ban";
	pub const CHANNEL_UNBAN: &str = "channel.unban";
	pub const CHANNEL_MODERATOR_ADD: &str = "channel.moderator.add";
	pub const CHANNEL_MODERATOR_REMOVE: &str = "channel.moderator.remove";
	pub const CHANNEL_CHEER: &str = "channel.cheer";
	pub const CHANNEL_SUBSCRIPTION_GIFT: &str = "channel.subscription.gift";
	pub const CHANNEL_SUBSCRIPTION_MESSAGE: &str = "channel.subscription.message";
	pub const CHANNEL_POLL_BEGIN: &str = "channel.poll.begin";
	pub const CHANNEL_POLL_PROGRESS: &str = "channel.poll.progress";
	pub const CHANNEL_POLL_END: &str = "channel.poll.end";
	pub const CHANNEL_PREDICTION_PROGRESS: &str = "channel.prediction.progress";
	pub const CHANNEL_PREDICTION_LOCK: &str = "channel.prediction.lock";
	pub const CHANNEL_PREDICTION_END: &str = "channel.prediction.end";
	pub const CHANNEL_GOAL_BEGIN: &str = "channel.goal.begin";
	pub const CHANNEL_GOAL_PROGRESS: &str = "channel.goal.progress";
	pub const CHANNEL_GOAL_END: &str = "channel.goal.end";
	pub const CHANNEL_HYPE_TRAIN_BEGIN: &str = "channel.hype_train.begin";
	pub const CHANNEL_HYPE_TRAIN_PROGRESS: &str = "channel.hype_train.progress";
	pub const CHANNEL_HYPE_TRAIN_END: &str = "channel.hype_train.end";
	pub const USER_AUTHORIZATION_GRANT: &str = "user.authorization.grant";
	pub const USER_AUTHORIZATION_REVOKE: &str = "user.authorization.revoke";
	pub const USER_UPDATE: &str = "user.update";
}

/// Types every agent subscribes to on its conduit, in registration order.
pub const SUBSCRIBED_TYPES: [&str; 10] = [
	types::STREAM_ONLINE,
	types::STREAM_OFFLINE,
	types::CHANNEL_FOLLOW,
	types::CHANNEL_SUBSCRIBE,
	types::CHANNEL_POINTS_REDEEM,
	types::CHANNEL_PREDICTION_BEGIN,
	types::CHANNEL_CHAT_MESSAGE,
	types::CHANNEL_CHAT_MESSAGE_DELETE,
	types::CHANNEL_SHOUTOUT_CREATE,
	types::CHANNEL_SHOUTOUT_RECEIVE,
];

pub fn subscription_version(kind: &str) -> &'static str {
	match kind {
		types::CHANNEL_FOLLOW => "2",
		_ => "1",
	}
}

/// Condition object for `kind`, scoped to `broadcaster_id` and acting as `user_id`.
pub fn subscription_condition(kind: &str, broadcaster_id: &str, user_id: &str) -> Value {
	use types::*;

	match kind {
		CHANNEL_CHAT_MESSAGE | CHANNEL_CHAT_MESSAGE_DELETE => json!({
			"broadcaster_user_id": broadcaster_id,
			"user_id": user_id,
		}),
		CHANNEL_FOLLOW | CHANNEL_MODERATOR_ADD | CHANNEL_MODERATOR_REMOVE | CHANNEL_SHOUTOUT_CREATE
		| CHANNEL_SHOUTOUT_RECEIVE => json!({
			"broadcaster_user_id": broadcaster_id,
			"moderator_user_id": user_id,
		}),
		USER_AUTHORIZATION_GRANT | USER_AUTHORIZATION_REVOKE | USER_UPDATE => json!({ "user_id": user_id }),
		CHANNEL_RAID => json!({ "to_broadcaster_user_id": broadcaster_id }),
		_ => json!({ "broadcaster_user_id": broadcaster_id }),
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOnlineEvent {
	pub id: String,
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub started_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOfflineEvent {
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelFollowEvent {
	pub user_id: String,
	pub user_login: String,
	pub user_name: String,
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
	pub followed_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSubscribeEvent {
	pub user_id: String,
	pub user_login: String,
	pub user_name: String,
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
	pub tier: String,
	pub is_gift: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPointsReward {
	pub id: String,
	pub title: String,
	pub cost: i64,
	pub prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPointsRedeemEvent {
	pub id: String,
	pub user_id: String,
	pub user_login: String,
	pub user_name: String,
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
	pub user_input: String,
	pub reward: ChannelPointsReward,
	pub redeemed_at: String,
	pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionOutcome {
	pub id: String,
	pub title: String,
	/// `blue` or `pink`.
	pub color: String,
	pub channel_points: i64,
	pub users: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPredictionBeginEvent {
	pub id: String,
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
	pub title: String,
	pub outcomes: Vec<PredictionOutcome>,
	pub started_at: String,
	pub locks_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessageFragment {
	#[serde(rename = "type")]
	pub kind: String,
	pub text: String,
	pub cheermote: Option<Value>,
	pub emote: Option<Value>,
	pub mention: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessageContent {
	pub text: String,
	pub fragments: Vec<ChatMessageFragment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessageBadge {
	pub set_id: String,
	pub id: String,
	pub info: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessageCheer {
	pub bits: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessageReply {
	pub parent_message_id: String,
	pub parent_message_body: String,
	pub parent_user_id: String,
	pub parent_user_login: String,
	pub parent_user_name: String,
	pub thread_message_id: String,
	pub thread_user_id: String,
	pub thread_user_login: String,
	pub thread_user_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelChatMessageEvent {
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
	pub chatter_user_id: String,
	pub chatter_user_login: String,
	pub chatter_user_name: String,
	pub message_id: String,
	pub message: ChatMessageContent,
	pub color: String,
	pub badges: Vec<ChatMessageBadge>,
	pub cheer: Option<ChatMessageCheer>,
	pub reply: Option<ChatMessageReply>,
	pub message_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelChatMessageDeleteEvent {
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
	pub target_user_id: String,
	pub target_user_login: String,
	pub target_user_name: String,
	pub message_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelShoutoutCreateEvent {
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
	pub to_broadcaster_user_id: String,
	pub to_broadcaster_user_login: String,
	pub to_broadcaster_user_name: String,
	pub moderator_user_id: String,
	pub moderator_user_login: String,
	pub moderator_user_name: String,
	pub viewer_count: i64,
	pub started_at: String,
	pub cooldown_ends_at: String,
	pub target_cooldown_ends_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelShoutoutReceiveEvent {
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub broadcaster_user_name: String,
	pub from_broadcaster_user_id: String,
	pub from_broadcaster_user_login: String,
	pub from_broadcaster_user_name: String,
	pub viewer_count: i64,
	pub started_at: String,
}
