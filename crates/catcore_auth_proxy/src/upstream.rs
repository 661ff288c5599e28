#![forbid(unsafe_code)]

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

pub const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// The three token grants the proxy performs on behalf of clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
	AuthorizationCode { code: String, redirect_uri: String },
	ClientCredentials,
	RefreshToken { refresh_token: String },
}

impl Grant {
	fn grant_type(&self) -> &'static str {
		match self {
			Grant::AuthorizationCode { .. } => "authorization_code",
			Grant::ClientCredentials => "client_credentials",
			Grant::RefreshToken { .. } => "refresh_token",
		}
	}

	/// Form fields besides the client credentials.
	fn fields(&self) -> Vec<(&'static str, &str)> {
		let mut fields = vec![("grant_type", self.grant_type())];
		match self {
			Grant::AuthorizationCode { code, redirect_uri } => {
				fields.push(("code", code));
				fields.push(("redirect_uri", redirect_uri));
			}
			Grant::ClientCredentials => {}
			Grant::RefreshToken { refresh_token } => fields.push(("refresh_token", refresh_token)),
		}
		fields
	}
}

/// Talks to the Twitch token endpoint. `Ok(None)` when Twitch rejects the grant.
#[async_trait]
pub trait TokenEndpoint: Send + Sync + 'static {
	async fn exchange(&self, grant: &Grant) -> anyhow::Result<Option<Bytes>>;
}

/// Application credentials; the secret never leaves this process except toward Twitch.
#[derive(Clone)]
pub struct ClientCredentials {
	pub client_id: String,
	pub client_secret: String,
}

impl std::fmt::Debug for ClientCredentials {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClientCredentials")
			.field("client_id", &self.client_id)
			.field("client_secret", &"<redacted>")
			.finish()
	}
}

pub struct TwitchTokenEndpoint {
	http: reqwest::Client,
	token_url: String,
	credentials: ClientCredentials,
}

impl TwitchTokenEndpoint {
	pub fn new(token_url: impl Into<String>, credentials: ClientCredentials) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(concat!("catcore_auth_proxy/", env!("CARGO_PKG_VERSION")))
			.build()
			.context("build reqwest client")?;
		Ok(Self {
			http,
			token_url: token_url.into(),
			credentials,
		})
	}
}

#[async_trait]
impl TokenEndpoint for TwitchTokenEndpoint {
	async fn exchange(&self, grant: &Grant) -> anyhow::Result<Option<Bytes>> {
		let mut form = vec![
			("client_id", self.credentials.client_id.as_str()),
			("client_secret", self.credentials.client_secret.as_str()),
		];
		form.extend(grant.fields());

		let resp = self
			.http
			.post(&self.token_url)
			.form(&form)
			.send()
			.await
			.context("twitch token request")?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			warn!(grant_type = grant.grant_type(), %status, body = %body, "twitch rejected token grant");
			return Ok(None);
		}

		let body = resp.bytes().await.context("read twitch token response")?;
		debug!(grant_type = grant.grant_type(), bytes = body.len(), "twitch token grant succeeded");
		Ok(Some(body))
	}
}
