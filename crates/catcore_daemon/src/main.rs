#![forbid(unsafe_code)]

mod config;
mod logging;

use std::sync::Arc;

use anyhow::Context as _;
use catcore_domain::TwitchChannel;
use catcore_twitch::auth::{AuthSettings, CredentialFile, HttpTokenApi};
use catcore_twitch::eventsub::HelixConduitClient;
use catcore_twitch::irc::NoMediaData;
use catcore_twitch::ws::default_connector;
use catcore_twitch::{
	ChannelRoster, ChatEngine, ChatEvent, ChatSettings, CredentialStore, EventSubManager, EventSubSettings,
	PubSubManager, PubSubSettings, RoomStateTracker, UserStateTracker,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::config::{DaemonConfig, OutgoingMessage};

enum Command {
	Run,
	Login { redirect: String },
	Exchange { code: String, redirect: String },
	Revoke,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: catcore [--login <redirect_url> | --code <code> --redirect <redirect_url> | --revoke]\n\
\n\
Without options the daemon connects to every configured channel.\n\
\n\
Options:\n\
\t--login <url>      Print the Twitch authorization URL for <url>\n\
\t--code <code>      Exchange an authorization code for tokens (needs --redirect)\n\
\t--redirect <url>   Redirect URL used when the code was issued\n\
\t--revoke           Revoke and forget the stored tokens\n\
\t--help             Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Command {
	let mut login = None;
	let mut code = None;
	let mut redirect = None;
	let mut revoke = false;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--login" => login = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--code" => code = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--redirect" => redirect = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--revoke" => revoke = true,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	match (login, code, redirect, revoke) {
		(None, None, None, false) => Command::Run,
		(Some(redirect), None, None, false) => Command::Login { redirect },
		(None, Some(code), Some(redirect), false) => Command::Exchange { code, redirect },
		(None, None, None, true) => Command::Revoke,
		_ => usage_and_exit(),
	}
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter =
		std::env::var("RUST_LOG").unwrap_or_else(|_| "info,catcore_twitch=debug,catcore_daemon=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("catcore");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_credential_store(cfg: &DaemonConfig) -> anyhow::Result<Arc<CredentialStore>> {
	let oauth_base_url = Url::parse(&cfg.twitch.oauth_base_url).context("parse oauth_base_url")?;
	let auth_server_url = Url::parse(&cfg.twitch.auth_server_url).context("parse auth_server_url")?;
	let api = HttpTokenApi::new(cfg.twitch.client_id.clone(), oauth_base_url.clone(), auth_server_url)?;

	let settings = AuthSettings {
		client_id: cfg.twitch.client_id.clone(),
		oauth_base_url,
	};
	let file = CredentialFile::new(cfg.daemon.credentials_path.clone());
	info!(path = %file.path().display(), "using twitch credential file");
	Ok(Arc::new(CredentialStore::new(Arc::new(api), settings, Some(file))))
}

/// Queues the configured messages every time chat connects.
fn spawn_send_on_connect(chat: &ChatEngine, roster: Arc<ChannelRoster>, messages: Vec<OutgoingMessage>) {
	if messages.is_empty() {
		return;
	}
	let mut rx = chat.subscribe();
	let chat = chat.clone();
	tokio::spawn(async move {
		while let Ok(event) = rx.recv().await {
			if event != ChatEvent::Connected {
				continue;
			}
			for m in &messages {
				match roster.login_for(&m.channel_id) {
					Some(login) => chat.send_message(&TwitchChannel::new(m.channel_id.clone(), login), &m.text),
					None => warn!(channel_id = %m.channel_id, "send_on_connect channel is not in the roster"),
				}
			}
		}
	});
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let command = parse_args();

	let config_path = crate::config::default_config_path()?;
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	let auth = build_credential_store(&cfg)?;

	match command {
		Command::Run => {}
		Command::Login { redirect } => {
			println!("{}", auth.authorization_url(&redirect));
			return Ok(());
		}
		Command::Exchange { code, redirect } => {
			if !auth.get_tokens_by_authorization_code(&code, &redirect).await {
				anyhow::bail!("authorization code exchange failed");
			}
			match auth.logged_in_user() {
				Some(user) => info!(login = %user.login, "logged in"),
				None => warn!("tokens stored but the account could not be validated"),
			}
			return Ok(());
		}
		Command::Revoke => {
			if !auth.revoke_tokens().await {
				anyhow::bail!("token revocation failed");
			}
			info!("twitch tokens revoked");
			return Ok(());
		}
	}

	init_metrics(cfg.daemon.metrics_bind.as_deref());

	let roster = Arc::new(ChannelRoster::new(cfg.twitch.channels.clone()));
	let rooms = Arc::new(RoomStateTracker::new());
	let users = Arc::new(UserStateTracker::new());
	let connector = default_connector();

	let chat = ChatEngine::new(
		ChatSettings {
			irc_ws_url: cfg.twitch.irc_ws_url.clone(),
			emotes: cfg.twitch.emotes,
		},
		auth.clone(),
		roster.clone(),
		rooms,
		users,
		Arc::new(NoMediaData),
		connector.clone(),
	);

	let helix_base = Url::parse(&cfg.twitch.eventsub_api_base_url).context("parse eventsub_api_base_url")?;
	let conduits = Arc::new(HelixConduitClient::new(helix_base, auth.clone())?);
	let eventsub = EventSubManager::new(
		EventSubSettings {
			ws_url: cfg.twitch.eventsub_ws_url.clone(),
			..EventSubSettings::default()
		},
		auth.clone(),
		roster.clone(),
		conduits,
		connector.clone(),
	);

	let pubsub = cfg.twitch.use_legacy_pubsub.then(|| {
		PubSubManager::new(
			PubSubSettings {
				ws_url: cfg.twitch.pubsub_ws_url.clone(),
				..PubSubSettings::default()
			},
			auth.clone(),
			roster.clone(),
			connector.clone(),
		)
	});

	let _chat_logger = logging::spawn_chat_logger(&chat);
	spawn_send_on_connect(&chat, roster.clone(), cfg.daemon.send_on_connect.clone());

	match auth.fetch_user_info_with_refresh().await {
		Some(user) => info!(login = %user.login, user_id = %user.user_id, "twitch account ready"),
		None => warn!("not logged in to twitch; run `catcore --login <redirect_url>` to authorize"),
	}

	let mut watchers = chat.spawn_watchers();
	watchers.extend(eventsub.spawn_watchers());
	if let Some(pubsub) = &pubsub {
		watchers.extend(pubsub.spawn_watchers());
	}

	eventsub.start();
	logging::register_eventsub(&eventsub);
	if let Some(pubsub) = &pubsub {
		pubsub.start();
		logging::register_pubsub(pubsub);
	}
	chat.start().await;

	info!(channels = roster.active_channels().len(), "catcore running; ctrl-c to stop");
	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutting down");

	chat.shutdown().await;
	eventsub.shutdown().await;
	if let Some(pubsub) = &pubsub {
		pubsub.shutdown().await;
	}
	for w in watchers {
		w.abort();
	}
	Ok(())
}
