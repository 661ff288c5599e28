#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Twitch channel (broadcaster) user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
	/// Create a non-empty `ChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.trim().to_string())
	}
}

/// One tracked channel: `(channel id, login name)`, keyed by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRosterEntry {
	pub id: ChannelId,
	pub login: String,
}

impl ChannelRosterEntry {
	pub fn new(id: ChannelId, login: impl Into<String>) -> Self {
		Self {
			id,
			login: login.into().to_ascii_lowercase(),
		}
	}

	/// Parse an `id:login` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (id_s, login_s) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected id:login".into()))?;

		let login_s = login_s.trim();
		if login_s.is_empty() {
			return Err(ParseIdError::InvalidFormat("expected id:login".into()));
		}

		Ok(Self::new(ChannelId::from_str(id_s)?, login_s))
	}
}

impl fmt::Display for ChannelRosterEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.id, self.login)
	}
}

/// Added/removed roster entries produced by a roster update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
	pub enabled: Vec<ChannelRosterEntry>,
	pub disabled: Vec<ChannelRosterEntry>,
}

impl RosterDiff {
	pub fn is_empty(&self) -> bool {
		self.enabled.is_empty() && self.disabled.is_empty()
	}
}

/// Authentication status of the credential store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
	#[default]
	Uninitialized,
	Initializing,
	Authenticated,
	Unauthorized,
}

impl AuthStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			AuthStatus::Uninitialized => "uninitialized",
			AuthStatus::Initializing => "initializing",
			AuthStatus::Authenticated => "authenticated",
			AuthStatus::Unauthorized => "unauthorized",
		}
	}
}

impl fmt::Display for AuthStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A joined chat channel as seen by the chat session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TwitchChannel {
	pub id: String,
	pub name: String,
}

impl TwitchChannel {
	pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBadge {
	pub id: String,
	pub name: String,
	pub url: String,
}

/// Message author as resolved from tags or cached self state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
	pub id: String,
	pub login: String,
	pub display_name: String,
	pub color: String,
	pub is_moderator: bool,
	pub is_broadcaster: bool,
	pub is_subscriber: bool,
	pub is_turbo: bool,
	pub is_vip: bool,
	#[serde(default)]
	pub badges: Vec<ChatBadge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmoteKind {
	Twitch,
	Emoji,
	ThirdParty,
	Cheermote,
}

/// Overlay over a span of message text. Indices are char offsets, `end_index` inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEmote {
	pub kind: EmoteKind,
	pub id: String,
	pub name: String,
	pub start_index: usize,
	pub end_index: usize,
	pub url: String,
	#[serde(default)]
	pub is_animated: bool,
	#[serde(default)]
	pub bits: u32,
	#[serde(default)]
	pub color: Option<String>,
}

/// A chat line delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwitchMessage {
	pub id: String,
	pub is_system_message: bool,
	pub is_action_message: bool,
	pub is_mentioned: bool,
	pub message: String,
	pub sender: ChatUser,
	pub channel: TwitchChannel,
	pub emotes: Vec<ChatEmote>,
	pub metadata: BTreeMap<String, String>,
	pub command_type: String,
	pub bits: u32,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roster_entry_parse_and_display() {
		let e = ChannelRosterEntry::parse(" 12345:SomeStreamer ").unwrap();
		assert_eq!(e.id.as_str(), "12345");
		assert_eq!(e.login, "somestreamer");
		assert_eq!(e.to_string(), "12345:somestreamer");
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(ChannelId::new("").is_err());
		assert!(ChannelId::new("   ").is_err());
		assert!(ChannelRosterEntry::parse("").is_err());
		assert!(ChannelRosterEntry::parse("123").is_err());
		assert!(ChannelRosterEntry::parse("123:").is_err());
		assert!(ChannelRosterEntry::parse(":login").is_err());
	}

	#[test]
	fn auth_status_defaults_to_uninitialized() {
		assert_eq!(AuthStatus::default(), AuthStatus::Uninitialized);
		assert_eq!(AuthStatus::Unauthorized.to_string(), "unauthorized");
	}

	#[test]
	fn roster_diff_empty() {
		assert!(RosterDiff::default().is_empty());
	}
}
