#![forbid(unsafe_code)]

//! Room and self-user state reported by ROOMSTATE / USERSTATE / GLOBALUSERSTATE.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub type Tags = BTreeMap<String, String>;

fn tag_flag(tags: &Tags, key: &str) -> Option<bool> {
	tags.get(key).map(|v| v == "1")
}

fn tag_string(tags: &Tags, key: &str) -> Option<String> {
	tags.get(key).cloned()
}

/// Role flags derived from a `badges` tag such as `moderator/1,subscriber/12`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeRoles {
	pub is_moderator: bool,
	pub is_broadcaster: bool,
	pub is_subscriber: bool,
	pub is_turbo: bool,
	pub is_vip: bool,
}

impl BadgeRoles {
	pub fn from_badges(badges: &str) -> Self {
		let has = |name: &str| badges.split(',').any(|b| b.split('/').next() == Some(name));
		Self {
			is_moderator: has("moderator"),
			is_broadcaster: has("broadcaster"),
			is_subscriber: has("subscriber") || has("founder"),
			is_turbo: has("turbo"),
			is_vip: has("vip"),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
	pub room_id: String,
	pub emote_only: bool,
	/// Minutes; -1 when followers-only mode is off.
	pub followers_only: i32,
	pub r9k: bool,
	pub slow_mode_secs: u32,
	pub subs_only: bool,
}

impl RoomState {
	fn new() -> Self {
		Self {
			followers_only: -1,
			..Self::default()
		}
	}

	/// ROOMSTATE deltas only carry changed tags, so absent keys keep their value.
	fn merge(&mut self, tags: &Tags) {
		if let Some(v) = tag_string(tags, "room-id") {
			self.room_id = v;
		}
		if let Some(v) = tag_flag(tags, "emote-only") {
			self.emote_only = v;
		}
		if let Some(v) = tags.get("followers-only").and_then(|v| v.parse().ok()) {
			self.followers_only = v;
		}
		if let Some(v) = tag_flag(tags, "r9k") {
			self.r9k = v;
		}
		if let Some(v) = tags.get("slow").and_then(|v| v.parse().ok()) {
			self.slow_mode_secs = v;
		}
		if let Some(v) = tag_flag(tags, "subs-only") {
			self.subs_only = v;
		}
	}
}

/// Per channel-name room state.
#[derive(Debug, Default)]
pub struct RoomStateTracker {
	rooms: RwLock<HashMap<String, RoomState>>,
}

impl RoomStateTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, channel_name: &str) -> Option<RoomState> {
		self.rooms.read().get(channel_name).cloned()
	}

	/// Merges `tags` into the channel's state, or forgets the channel on `None`.
	pub fn update(&self, channel_name: &str, tags: Option<&Tags>) -> Option<RoomState> {
		let mut rooms = self.rooms.write();
		match tags {
			Some(tags) => {
				let state = rooms.entry(channel_name.to_string()).or_insert_with(RoomState::new);
				state.merge(tags);
				Some(state.clone())
			}
			None => rooms.remove(channel_name),
		}
	}

	pub fn clear(&self) {
		self.rooms.write().clear();
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalUserState {
	pub user_id: String,
	pub display_name: String,
	pub color: Option<String>,
	pub badges: Option<String>,
	pub badge_info: Option<String>,
	pub emote_sets: Option<String>,
}

impl GlobalUserState {
	fn from_tags(tags: &Tags) -> Self {
		Self {
			user_id: tag_string(tags, "user-id").unwrap_or_default(),
			display_name: tag_string(tags, "display-name").unwrap_or_default(),
			color: tag_string(tags, "color").filter(|c| !c.is_empty()),
			badges: tag_string(tags, "badges").filter(|b| !b.is_empty()),
			badge_info: tag_string(tags, "badge-info").filter(|b| !b.is_empty()),
			emote_sets: tag_string(tags, "emote-sets"),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
	pub badges: Option<String>,
	pub badge_info: Option<String>,
	pub color: Option<String>,
	pub display_name: String,
	pub emote_sets: Option<String>,
	pub is_moderator: bool,
	pub is_broadcaster: bool,
	pub is_subscriber: bool,
	pub is_turbo: bool,
	pub is_vip: bool,
}

impl UserState {
	fn from_tags(tags: &Tags) -> Self {
		let badges = tag_string(tags, "badges").filter(|b| !b.is_empty());
		let roles = badges.as_deref().map(BadgeRoles::from_badges).unwrap_or_default();
		Self {
			badge_info: tag_string(tags, "badge-info").filter(|b| !b.is_empty()),
			color: tag_string(tags, "color").filter(|c| !c.is_empty()),
			display_name: tag_string(tags, "display-name").unwrap_or_default(),
			emote_sets: tag_string(tags, "emote-sets"),
			is_moderator: roles.is_moderator || tag_flag(tags, "mod").unwrap_or(false),
			is_broadcaster: roles.is_broadcaster,
			is_subscriber: roles.is_subscriber || tag_flag(tags, "subscriber").unwrap_or(false),
			is_turbo: roles.is_turbo,
			is_vip: roles.is_vip,
			badges,
		}
	}
}

/// Self-user state: one global record plus one per channel id.
#[derive(Debug, Default)]
pub struct UserStateTracker {
	global: RwLock<Option<GlobalUserState>>,
	channels: RwLock<HashMap<String, UserState>>,
}

impl UserStateTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn global_user_state(&self) -> Option<GlobalUserState> {
		self.global.read().clone()
	}

	pub fn update_global_user_state(&self, tags: Option<&Tags>) {
		*self.global.write() = tags.map(GlobalUserState::from_tags);
	}

	pub fn user_state(&self, channel_id: &str) -> Option<UserState> {
		self.channels.read().get(channel_id).cloned()
	}

	pub fn update_user_state(&self, channel_id: &str, tags: Option<&Tags>) {
		let mut channels = self.channels.write();
		match tags {
			Some(tags) => {
				channels.insert(channel_id.to_string(), UserState::from_tags(tags));
			}
			None => {
				channels.remove(channel_id);
			}
		}
	}

	/// Broadcaster or moderator in `channel_id`.
	pub fn has_elevated_role(&self, channel_id: &str) -> bool {
		self.channels
			.read()
			.get(channel_id)
			.is_some_and(|s| s.is_broadcaster || s.is_moderator)
	}

	pub fn clear(&self) {
		*self.global.write() = None;
		self.channels.write().clear();
	}
}
