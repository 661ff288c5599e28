#![forbid(unsafe_code)]

//! Emote overlays over message text. All indices are char offsets with an inclusive end.

use catcore_domain::{ChatEmote, EmoteKind};
use serde::{Deserialize, Serialize};

use super::media::MediaDataProvider;
use super::parser::IrcTags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteSettings {
	pub parse_twitch_emotes: bool,
	pub handle_emojis: bool,
	pub parse_cheermotes: bool,
	pub parse_third_party_emotes: bool,
}

impl Default for EmoteSettings {
	fn default() -> Self {
		Self {
			parse_twitch_emotes: true,
			handle_emojis: true,
			parse_cheermotes: true,
			parse_third_party_emotes: true,
		}
	}
}

pub fn twitch_emote_url(emote_id: &str) -> String {
	format!("https://static-cdn.jtvnw.net/emoticons/v2/{emote_id}/static/dark/3.0")
}

/// Runs the enabled extractors in order: native, emoji, then third-party and cheers in the gaps.
pub fn extract_emotes(
	message: &str,
	tags: Option<&IrcTags>,
	channel_id: &str,
	bits: u32,
	settings: &EmoteSettings,
	media: &dyn MediaDataProvider,
) -> Vec<ChatEmote> {
	let chars: Vec<char> = message.chars().collect();
	let mut emotes = Vec::new();
	if chars.is_empty() {
		return emotes;
	}

	if settings.parse_twitch_emotes
		&& let Some(tag) = tags.and_then(|t| t.get("emotes"))
	{
		extract_twitch_emotes(&mut emotes, &chars, tag);
	}
	if settings.handle_emojis {
		extract_emojis(&mut emotes, &chars, media);
	}
	extract_other_emotes(
		&mut emotes,
		&chars,
		channel_id,
		settings.parse_cheermotes && bits > 0,
		settings.parse_third_party_emotes,
		media,
	);
	emotes
}

/// Parses `id:s-e,s-e/id:s-e`. Ranges that do not fit the message are skipped.
fn extract_twitch_emotes(emotes: &mut Vec<ChatEmote>, chars: &[char], tag: &str) {
	for group in tag.split('/').filter(|g| !g.is_empty()) {
		let Some((emote_id, ranges)) = group.split_once(':') else {
			continue;
		};
		for range in ranges.split(',') {
			let Some((start, end)) = range.split_once('-') else {
				continue;
			};
			let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) else {
				continue;
			};
			if start > end || end >= chars.len() {
				continue;
			}
			emotes.push(ChatEmote {
				kind: EmoteKind::Twitch,
				id: format!("TwitchEmote_{emote_id}"),
				name: chars[start..=end].iter().collect(),
				start_index: start,
				end_index: end,
				url: twitch_emote_url(emote_id),
				is_animated: false,
				bits: 0,
				color: None,
			});
		}
	}
}

fn extract_emojis(emotes: &mut Vec<ChatEmote>, chars: &[char], media: &dyn MediaDataProvider) {
	let mut i = 0;
	while i < chars.len() {
		match media.emoji_at(chars, i).filter(|m| m.len > 0) {
			Some(m) => {
				emotes.push(ChatEmote {
					kind: EmoteKind::Emoji,
					id: m.key.clone(),
					name: m.key,
					start_index: i,
					end_index: i + m.len - 1,
					url: m.url,
					is_animated: false,
					bits: 0,
					color: None,
				});
				i += m.len;
			}
			None => i += 1,
		}
	}
}

fn extract_other_emotes(
	emotes: &mut Vec<ChatEmote>,
	chars: &[char],
	channel_id: &str,
	parse_cheermotes: bool,
	parse_custom: bool,
	media: &dyn MediaDataProvider,
) {
	if !parse_cheermotes && !parse_custom {
		return;
	}

	let mut found = Vec::new();
	let mut scan = |start: usize, end: usize| {
		let mut word = String::new();
		let mut word_len = 0usize;
		let mut i = start;
		while i <= end {
			if i == end || i >= chars.len() || chars[i].is_whitespace() {
				if word_len > 0 {
					let (start_index, end_index) = (i - word_len, i - 1);
					if let Some(e) = parse_custom.then(|| media.third_party_emote(&word, channel_id)).flatten() {
						found.push(ChatEmote {
							kind: EmoteKind::ThirdParty,
							id: e.id,
							name: e.name,
							start_index,
							end_index,
							url: e.url,
							is_animated: e.is_animated,
							bits: 0,
							color: None,
						});
					} else if let Some((amount, cheer)) = parse_cheermotes.then(|| media.cheermote(&word, channel_id)).flatten()
					{
						found.push(ChatEmote {
							kind: EmoteKind::Cheermote,
							id: format!("{}{}", cheer.prefix, cheer.tier.min_bits),
							name: word.clone(),
							start_index,
							end_index,
							url: cheer.tier.url,
							is_animated: cheer.tier.is_animated,
							bits: amount,
							color: Some(cheer.tier.color),
						});
					}
					word.clear();
					word_len = 0;
				}
				if i >= chars.len() {
					break;
				}
			} else {
				word.push(chars[i]);
				word_len += 1;
			}
			i += 1;
		}
	};

	let mut ordered: Vec<(usize, usize)> = emotes.iter().map(|e| (e.start_index, e.end_index)).collect();
	ordered.sort_by_key(|(start, _)| *start);

	let mut loop_start = 0;
	for (start, end) in ordered {
		if start > 0 {
			scan(loop_start, start - 1);
		}
		loop_start = end + 2;
	}
	scan(loop_start, chars.len());

	emotes.extend(found);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::irc::media::{CheermoteTier, NoMediaData, StaticMediaData, ThirdPartyEmote};

	fn tags(emotes: &str) -> IrcTags {
		[("emotes".to_string(), emotes.to_string())].into_iter().collect()
	}

	fn media() -> StaticMediaData {
		StaticMediaData::new()
			.with_emote(
				None,
				ThirdPartyEmote {
					id: "bttv_1".into(),
					name: "catJAM".into(),
					url: "https://cdn.betterttv.net/emote/1/3x".into(),
					is_animated: true,
				},
			)
			.with_cheermote(
				"Cheer",
				vec![CheermoteTier {
					min_bits: 100,
					url: "https://cdn/cheer/100".into(),
					color: "#9c3ee8".into(),
					is_animated: false,
				}],
			)
			.with_emoji("\u{2764}", "https://cdn/heart")
	}

	#[test]
	fn native_emotes_follow_tag_ranges() {
		let emotes = extract_emotes(
			"Kappa hi Kappa",
			Some(&tags("25:0-4,9-13")),
			"1",
			0,
			&EmoteSettings::default(),
			&NoMediaData,
		);
		assert_eq!(emotes.len(), 2);
		assert_eq!(emotes[0].id, "TwitchEmote_25");
		assert_eq!(emotes[0].name, "Kappa");
		assert_eq!((emotes[1].start_index, emotes[1].end_index), (9, 13));
		assert_eq!(emotes[0].url, "https://static-cdn.jtvnw.net/emoticons/v2/25/static/dark/3.0");
	}

	#[test]
	fn malformed_ranges_are_skipped() {
		let emotes = extract_emotes("hey", Some(&tags("25:0-9,x-1/7")), "1", 0, &EmoteSettings::default(), &NoMediaData);
		assert!(emotes.is_empty());
	}

	#[test]
	fn third_party_words_fill_the_gaps_between_native_emotes() {
		let emotes = extract_emotes(
			"catJAM Kappa catJAM",
			Some(&tags("25:7-11")),
			"1",
			0,
			&EmoteSettings::default(),
			&media(),
		);
		let spans: Vec<_> = emotes.iter().map(|e| (e.kind, e.start_index, e.end_index)).collect();
		assert_eq!(
			spans,
			vec![
				(EmoteKind::Twitch, 7, 11),
				(EmoteKind::ThirdParty, 0, 5),
				(EmoteKind::ThirdParty, 13, 18),
			]
		);
	}

	#[test]
	fn cheermotes_need_bits_and_the_flag() {
		let settings = EmoteSettings::default();
		let with_bits = extract_emotes("Cheer250 nice", None, "1", 250, &settings, &media());
		assert_eq!(with_bits.len(), 1);
		assert_eq!(with_bits[0].kind, EmoteKind::Cheermote);
		assert_eq!(with_bits[0].bits, 250);
		assert_eq!((with_bits[0].start_index, with_bits[0].end_index), (0, 7));
		assert_eq!(with_bits[0].color.as_deref(), Some("#9c3ee8"));

		assert!(extract_emotes("Cheer250 nice", None, "1", 0, &settings, &media()).is_empty());

		let off = EmoteSettings {
			parse_cheermotes: false,
			..settings
		};
		assert!(extract_emotes("Cheer250 nice", None, "1", 250, &off, &media()).is_empty());
	}

	#[test]
	fn emoji_indices_are_char_based() {
		let emotes = extract_emotes("\u{e9}\u{2764}x", None, "1", 0, &EmoteSettings::default(), &media());
		assert_eq!(emotes.len(), 1);
		assert_eq!(emotes[0].kind, EmoteKind::Emoji);
		assert_eq!((emotes[0].start_index, emotes[0].end_index), (1, 1));
	}

	#[test]
	fn disabled_extractors_produce_nothing() {
		let settings = EmoteSettings {
			parse_twitch_emotes: false,
			handle_emojis: false,
			parse_cheermotes: false,
			parse_third_party_emotes: false,
		};
		let emotes = extract_emotes("catJAM \u{2764} Kappa", Some(&tags("25:9-13")), "1", 0, &settings, &media());
		assert!(emotes.is_empty());
	}
}
