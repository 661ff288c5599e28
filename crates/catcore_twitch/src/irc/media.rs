#![forbid(unsafe_code)]

//! Lookup seam for badge, emote, cheermote and emoji media.

use std::collections::HashMap;

use catcore_domain::ChatBadge;

/// A third-party (BTTV/FFZ/7TV style) emote resolved for one word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThirdPartyEmote {
	pub id: String,
	pub name: String,
	pub url: String,
	pub is_animated: bool,
}

/// One bits tier of a cheermote prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheermoteTier {
	pub min_bits: u32,
	pub url: String,
	pub color: String,
	pub is_animated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cheermote {
	pub prefix: String,
	pub tier: CheermoteTier,
}

/// Emoji matched at a char position; `len` counts chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmojiMatch {
	pub key: String,
	pub len: usize,
	pub url: String,
}

/// Media data the chat engine consults while building messages. Every lookup defaults to a miss.
pub trait MediaDataProvider: Send + Sync + 'static {
	/// `identifier` is a `name/version` pair from the badges tag.
	fn badge(&self, _identifier: &str, _channel_id: &str) -> Option<ChatBadge> {
		None
	}

	fn third_party_emote(&self, _word: &str, _channel_id: &str) -> Option<ThirdPartyEmote> {
		None
	}

	/// Resolves a cheer token such as `Cheer100` into its amount and tier.
	fn cheermote(&self, _word: &str, _channel_id: &str) -> Option<(u32, Cheermote)> {
		None
	}

	fn emoji_at(&self, _chars: &[char], _index: usize) -> Option<EmojiMatch> {
		None
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoMediaData;

impl MediaDataProvider for NoMediaData {}

/// Map-backed media; channel-scoped entries shadow global ones.
#[derive(Debug, Default, Clone)]
pub struct StaticMediaData {
	global_badges: HashMap<String, ChatBadge>,
	channel_badges: HashMap<(String, String), ChatBadge>,
	global_emotes: HashMap<String, ThirdPartyEmote>,
	channel_emotes: HashMap<(String, String), ThirdPartyEmote>,
	cheermotes: HashMap<String, Vec<CheermoteTier>>,
	emoji: HashMap<String, String>,
	longest_emoji: usize,
}

impl StaticMediaData {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_badge(mut self, identifier: &str, channel_id: Option<&str>, badge: ChatBadge) -> Self {
		match channel_id {
			Some(id) => {
				self.channel_badges.insert((id.to_string(), identifier.to_string()), badge);
			}
			None => {
				self.global_badges.insert(identifier.to_string(), badge);
			}
		}
		self
	}

	pub fn with_emote(mut self, channel_id: Option<&str>, emote: ThirdPartyEmote) -> Self {
		match channel_id {
			Some(id) => {
				self.channel_emotes.insert((id.to_string(), emote.name.clone()), emote);
			}
			None => {
				self.global_emotes.insert(emote.name.clone(), emote);
			}
		}
		self
	}

	/// Prefix matching is case-insensitive.
	pub fn with_cheermote(mut self, prefix: &str, mut tiers: Vec<CheermoteTier>) -> Self {
		tiers.sort_by_key(|t| t.min_bits);
		self.cheermotes.insert(prefix.to_ascii_lowercase(), tiers);
		self
	}

	pub fn with_emoji(mut self, glyph: &str, url: impl Into<String>) -> Self {
		self.longest_emoji = self.longest_emoji.max(glyph.chars().count());
		self.emoji.insert(glyph.to_string(), url.into());
		self
	}
}

impl MediaDataProvider for StaticMediaData {
	fn badge(&self, identifier: &str, channel_id: &str) -> Option<ChatBadge> {
		self.channel_badges
			.get(&(channel_id.to_string(), identifier.to_string()))
			.or_else(|| self.global_badges.get(identifier))
			.cloned()
	}

	fn third_party_emote(&self, word: &str, channel_id: &str) -> Option<ThirdPartyEmote> {
		self.channel_emotes
			.get(&(channel_id.to_string(), word.to_string()))
			.or_else(|| self.global_emotes.get(word))
			.cloned()
	}

	fn cheermote(&self, word: &str, _channel_id: &str) -> Option<(u32, Cheermote)> {
		let digits_at = word.find(|c: char| c.is_ascii_digit())?;
		let (prefix, amount) = word.split_at(digits_at);
		if prefix.is_empty() || !amount.chars().all(|c| c.is_ascii_digit()) {
			return None;
		}
		let amount: u32 = amount.parse().ok()?;
		let tiers = self.cheermotes.get(&prefix.to_ascii_lowercase())?;
		let tier = tiers.iter().rev().find(|t| t.min_bits <= amount)?;
		Some((
			amount,
			Cheermote {
				prefix: prefix.to_string(),
				tier: tier.clone(),
			},
		))
	}

	fn emoji_at(&self, chars: &[char], index: usize) -> Option<EmojiMatch> {
		let remaining = chars.len().checked_sub(index)?;
		let max = self.longest_emoji.min(remaining);
		(1..=max).rev().find_map(|len| {
			let key: String = chars[index..index + len].iter().collect();
			self.emoji.get(&key).map(|url| EmojiMatch {
				key,
				len,
				url: url.clone(),
			})
		})
	}
}
