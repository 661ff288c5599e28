#![forbid(unsafe_code)]

//! IRCv3 line parser for the Twitch chat dialect.

use std::collections::BTreeMap;

use thiserror::Error;

pub type IrcTags = BTreeMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IrcParseError {
	#[error("empty line")]
	Empty,
	#[error("tag section is not followed by a command")]
	UnterminatedTags,
	#[error("missing command")]
	MissingCommand,
}

/// One parsed line: `[@tags] [:prefix] COMMAND [#channel] [:message]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
	pub tags: Option<IrcTags>,
	pub prefix: Option<String>,
	pub command: String,
	pub channel: Option<String>,
	pub message: Option<String>,
}

impl IrcMessage {
	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.as_ref()?.get(key).map(String::as_str)
	}
}

/// Parsed `nick!user@host` or bare server prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrcPrefix {
	pub is_server: bool,
	pub nick: Option<String>,
	pub username: Option<String>,
	pub hostname: Option<String>,
}

impl IrcPrefix {
	/// Login of the author: the username for users, the host for server lines.
	pub fn login(&self) -> Option<&str> {
		if self.is_server {
			self.hostname.as_deref()
		} else {
			self.username.as_deref()
		}
	}
}

pub fn parse_prefix(prefix: &str) -> IrcPrefix {
	let Some((nick, rest)) = prefix.split_once('!') else {
		if let Some((user, host)) = prefix.split_once('@') {
			return IrcPrefix {
				is_server: false,
				nick: Some(user.to_string()),
				username: Some(user.to_string()),
				hostname: Some(host.to_string()),
			};
		}
		return IrcPrefix {
			is_server: true,
			hostname: Some(prefix.to_string()),
			..IrcPrefix::default()
		};
	};

	let (username, hostname) = match rest.split_once('@') {
		Some((u, h)) => (u.to_string(), Some(h.to_string())),
		None => (rest.to_string(), None),
	};

	IrcPrefix {
		is_server: false,
		nick: Some(nick.to_string()),
		username: Some(username),
		hostname,
	}
}

fn unescape_tag_value(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

/// Inverse of tag unescaping; used when rendering outbound tags.
pub fn escape_tag_value(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	for c in value.chars() {
		match c {
			';' => out.push_str("\\:"),
			' ' => out.push_str("\\s"),
			'\\' => out.push_str("\\\\"),
			'\r' => out.push_str("\\r"),
			'\n' => out.push_str("\\n"),
			c => out.push(c),
		}
	}
	out
}

fn parse_tags(raw: &str) -> IrcTags {
	raw.split(';')
		.filter(|kv| !kv.is_empty())
		.map(|kv| match kv.split_once('=') {
			Some((k, v)) => (k.to_string(), unescape_tag_value(v)),
			None => (kv.to_string(), String::new()),
		})
		.collect()
}

fn split_word(s: &str) -> (&str, &str) {
	match s.split_once(' ') {
		Some((word, rest)) => (word, rest.trim_start_matches(' ')),
		None => (s, ""),
	}
}

pub fn parse_line(line: &str) -> Result<IrcMessage, IrcParseError> {
	let mut rest = line.trim_end_matches(['\r', '\n']).trim_start_matches(' ');
	if rest.is_empty() {
		return Err(IrcParseError::Empty);
	}

	let mut tags = None;
	if let Some(after_at) = rest.strip_prefix('@') {
		let (raw_tags, after) = after_at.split_once(' ').ok_or(IrcParseError::UnterminatedTags)?;
		tags = Some(parse_tags(raw_tags));
		rest = after.trim_start_matches(' ');
	}

	let mut prefix = None;
	if let Some(after_colon) = rest.strip_prefix(':') {
		let (p, after) = split_word(after_colon);
		prefix = Some(p.to_string());
		rest = after;
	}

	let (command, mut params) = split_word(rest);
	if command.is_empty() {
		return Err(IrcParseError::MissingCommand);
	}

	let mut channel = None;
	let mut message = None;
	while !params.is_empty() {
		if let Some(trailing) = params.strip_prefix(':') {
			message = Some(trailing.to_string());
			break;
		}
		let (param, after) = split_word(params);
		if channel.is_none()
			&& let Some(name) = param.strip_prefix('#')
		{
			channel = Some(name.to_string());
		}
		params = after;
	}

	Ok(IrcMessage {
		tags,
		prefix,
		command: command.to_string(),
		channel,
		message,
	})
}

/// Splits a frame into its non-empty lines.
pub fn split_lines(frame: &str) -> impl Iterator<Item = &str> {
	frame.split(['\r', '\n']).filter(|l| !l.is_empty())
}
