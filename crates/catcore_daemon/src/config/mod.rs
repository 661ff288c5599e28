#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use catcore_domain::ChannelRosterEntry;
use catcore_twitch::auth::{DEFAULT_AUTH_SERVER_URL, DEFAULT_OAUTH_BASE_URL};
use catcore_twitch::eventsub::{DEFAULT_EVENTSUB_WS_URL, DEFAULT_HELIX_BASE_URL};
use catcore_twitch::irc::{DEFAULT_IRC_WS_URL, EmoteSettings};
use catcore_twitch::pubsub::DEFAULT_PUBSUB_WS_URL;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.catcore/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(catcore_home()?.join("config.toml"))
}

fn catcore_home() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".catcore"))
}

/// Load the daemon config from TOML, then apply env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<DaemonConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = DaemonConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
	pub twitch: TwitchSettings,
	pub daemon: DaemonSettings,
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: String,
	pub auth_server_url: String,
	pub oauth_base_url: String,
	pub irc_ws_url: String,
	pub eventsub_ws_url: String,
	pub eventsub_api_base_url: String,
	pub pubsub_ws_url: String,
	pub channels: Vec<ChannelRosterEntry>,
	pub emotes: EmoteSettings,
	pub use_legacy_pubsub: bool,
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
	pub credentials_path: PathBuf,
	/// Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Messages queued once the chat session is up.
	pub send_on_connect: Vec<OutgoingMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutgoingMessage {
	pub channel_id: String,
	pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	daemon: FileDaemonSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	auth_server_url: Option<String>,
	oauth_base_url: Option<String>,
	irc_ws_url: Option<String>,
	eventsub_ws_url: Option<String>,
	eventsub_api_base_url: Option<String>,
	pubsub_ws_url: Option<String>,

	#[serde(default)]
	channels: Vec<FileChannel>,

	parse_twitch_emotes: Option<bool>,
	handle_emojis: Option<bool>,
	parse_cheermotes: Option<bool>,
	parse_third_party_emotes: Option<bool>,
	use_legacy_pubsub: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileChannel {
	id: String,
	login: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDaemonSettings {
	credentials_path: Option<String>,
	metrics_bind: Option<String>,

	#[serde(default)]
	send_on_connect: Vec<OutgoingMessage>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl DaemonConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = EmoteSettings::default();
		let t = file.twitch;

		let mut channels = Vec::with_capacity(t.channels.len());
		for ch in t.channels {
			match ChannelRosterEntry::parse(&format!("{}:{}", ch.id, ch.login)) {
				Ok(entry) => channels.push(entry),
				Err(e) => warn!(id = %ch.id, login = %ch.login, error = %e, "skipping invalid channel in config"),
			}
		}

		let credentials_path = match non_blank(file.daemon.credentials_path) {
			Some(p) => PathBuf::from(p),
			None => catcore_home()?.join("twitch_credentials.json"),
		};

		Ok(Self {
			twitch: TwitchSettings {
				client_id: non_blank(t.client_id).unwrap_or_default(),
				auth_server_url: non_blank(t.auth_server_url).unwrap_or_else(|| DEFAULT_AUTH_SERVER_URL.to_string()),
				oauth_base_url: non_blank(t.oauth_base_url).unwrap_or_else(|| DEFAULT_OAUTH_BASE_URL.to_string()),
				irc_ws_url: non_blank(t.irc_ws_url).unwrap_or_else(|| DEFAULT_IRC_WS_URL.to_string()),
				eventsub_ws_url: non_blank(t.eventsub_ws_url).unwrap_or_else(|| DEFAULT_EVENTSUB_WS_URL.to_string()),
				eventsub_api_base_url: non_blank(t.eventsub_api_base_url)
					.unwrap_or_else(|| DEFAULT_HELIX_BASE_URL.to_string()),
				pubsub_ws_url: non_blank(t.pubsub_ws_url).unwrap_or_else(|| DEFAULT_PUBSUB_WS_URL.to_string()),
				channels,
				emotes: EmoteSettings {
					parse_twitch_emotes: t.parse_twitch_emotes.unwrap_or(defaults.parse_twitch_emotes),
					handle_emojis: t.handle_emojis.unwrap_or(defaults.handle_emojis),
					parse_cheermotes: t.parse_cheermotes.unwrap_or(defaults.parse_cheermotes),
					parse_third_party_emotes: t.parse_third_party_emotes.unwrap_or(defaults.parse_third_party_emotes),
				},
				use_legacy_pubsub: t.use_legacy_pubsub.unwrap_or(true),
			},
			daemon: DaemonSettings {
				credentials_path,
				metrics_bind: non_blank(file.daemon.metrics_bind),
				send_on_connect: file
					.daemon
					.send_on_connect
					.into_iter()
					.filter(|m| !m.channel_id.trim().is_empty() && !m.text.trim().is_empty())
					.collect(),
			},
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

/// `id:login,id:login`; invalid entries are skipped.
fn parse_env_channels(v: &str) -> Vec<ChannelRosterEntry> {
	v.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.filter_map(|s| match ChannelRosterEntry::parse(s) {
			Ok(entry) => Some(entry),
			Err(e) => {
				warn!(entry = %s, error = %e, "skipping invalid channel in CATCORE_TWITCH_CHANNELS");
				None
			}
		})
		.collect()
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut DaemonConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_blank(env(key));

	if let Some(v) = var("CATCORE_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = v;
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("CATCORE_AUTH_SERVER_URL") {
		cfg.twitch.auth_server_url = v;
		info!("twitch config: auth_server_url overridden by env");
	}

	if let Some(v) = var("CATCORE_TWITCH_IRC_WS_URL") {
		cfg.twitch.irc_ws_url = v;
		info!("twitch config: irc_ws_url overridden by env");
	}

	if let Some(v) = var("CATCORE_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = v;
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = var("CATCORE_TWITCH_PUBSUB_WS_URL") {
		cfg.twitch.pubsub_ws_url = v;
		info!("twitch config: pubsub_ws_url overridden by env");
	}

	if let Some(v) = var("CATCORE_TWITCH_CHANNELS") {
		cfg.twitch.channels = parse_env_channels(&v);
		info!(channels = cfg.twitch.channels.len(), "twitch config: channels overridden by env");
	}

	if let Some(enabled) = var("CATCORE_PARSE_TWITCH_EMOTES").as_deref().and_then(parse_env_bool) {
		cfg.twitch.emotes.parse_twitch_emotes = enabled;
		info!(enabled, "twitch config: parse_twitch_emotes overridden by env");
	}

	if let Some(enabled) = var("CATCORE_HANDLE_EMOJIS").as_deref().and_then(parse_env_bool) {
		cfg.twitch.emotes.handle_emojis = enabled;
		info!(enabled, "twitch config: handle_emojis overridden by env");
	}

	if let Some(enabled) = var("CATCORE_PARSE_CHEERMOTES").as_deref().and_then(parse_env_bool) {
		cfg.twitch.emotes.parse_cheermotes = enabled;
		info!(enabled, "twitch config: parse_cheermotes overridden by env");
	}

	if let Some(enabled) = var("CATCORE_PARSE_THIRD_PARTY_EMOTES").as_deref().and_then(parse_env_bool) {
		cfg.twitch.emotes.parse_third_party_emotes = enabled;
		info!(enabled, "twitch config: parse_third_party_emotes overridden by env");
	}

	if let Some(enabled) = var("CATCORE_USE_LEGACY_PUBSUB").as_deref().and_then(parse_env_bool) {
		cfg.twitch.use_legacy_pubsub = enabled;
		info!(enabled, "twitch config: use_legacy_pubsub overridden by env");
	}

	if let Some(v) = var("CATCORE_CREDENTIALS_PATH") {
		cfg.daemon.credentials_path = PathBuf::from(v);
		info!("daemon config: credentials_path overridden by env");
	}

	if let Some(v) = var("CATCORE_METRICS_BIND") {
		cfg.daemon.metrics_bind = Some(v);
		info!("daemon config: metrics_bind overridden by env");
	}

	if cfg.twitch.client_id.is_empty() {
		warn!("twitch config: no client_id configured; token validation will fail");
	}

	if cfg.twitch.channels.is_empty() {
		warn!("twitch config: no channels configured; chat will only connect");
	}
}
