#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use catcore_util::backoff::exponential_delay;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

const TRANSPORT_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(2);

/// Identity returned by the token validation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResponse {
	pub client_id: String,
	#[serde(default)]
	pub login: String,
	#[serde(default)]
	pub user_id: String,
	#[serde(default)]
	pub scopes: Vec<String>,
	pub expires_in: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorizationResponse {
	pub access_token: String,
	pub refresh_token: String,
	pub expires_in: i64,
	#[serde(default)]
	pub scope: Vec<String>,
	#[serde(default)]
	pub token_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppTokenResponse {
	pub access_token: String,
	pub expires_in: i64,
	#[serde(default)]
	pub token_type: String,
}

/// A completed HTTP exchange. Transport failures are the `Err` side of the call instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenReply<T> {
	Success(T),
	Rejected(u16),
	Malformed(String),
}

/// Token endpoints used by the credential store.
#[async_trait]
pub trait TokenApi: Send + Sync + 'static {
	async fn validate(&self, token: &str) -> anyhow::Result<TokenReply<ValidationResponse>>;
	async fn exchange_code(&self, code: &str, redirect_url: &str) -> anyhow::Result<TokenReply<AuthorizationResponse>>;
	async fn app_token(&self) -> anyhow::Result<TokenReply<AppTokenResponse>>;
	async fn refresh(&self, refresh_token: &str) -> anyhow::Result<TokenReply<AuthorizationResponse>>;
	/// `Ok(true)` when the platform accepted the revocation.
	async fn revoke(&self, token: &str) -> anyhow::Result<bool>;
}

/// Transient transport failures worth another attempt.
fn is_transient(e: &reqwest::Error) -> bool {
	e.is_connect() || e.is_timeout() || e.is_request()
}

/// Sends, retrying only transport failures. HTTP statuses are returned as-is.
pub(crate) async fn send_with_transport_retry<F>(build: F, label: &'static str) -> anyhow::Result<reqwest::Response>
where
	F: Fn() -> reqwest::RequestBuilder,
{
	let mut attempt = 0;
	loop {
		match build().send().await {
			Ok(resp) => return Ok(resp),
			Err(e) if is_transient(&e) && attempt < TRANSPORT_RETRIES => {
				attempt += 1;
				let delay = exponential_delay(RETRY_BASE, attempt, RETRY_MAX);
				warn!(label, attempt, delay_ms = delay.as_millis() as u64, error = %e, "request failed; retrying");
				tokio::time::sleep(delay).await;
			}
			Err(e) => return Err(e).with_context(|| format!("{label} send")),
		}
	}
}

async fn decode_reply<T: DeserializeOwned>(resp: reqwest::Response, label: &'static str) -> anyhow::Result<TokenReply<T>> {
	let status = resp.status();
	let body = resp.text().await.with_context(|| format!("{label} read body"))?;

	if !status.is_success() {
		warn!(label, %status, "token endpoint returned non-success status");
		return Ok(TokenReply::Rejected(status.as_u16()));
	}

	Ok(match serde_json::from_str(&body) {
		Ok(v) => TokenReply::Success(v),
		Err(e) => TokenReply::Malformed(e.to_string()),
	})
}

/// reqwest-backed token endpoints: validation/revoke on the platform, exchanges via the auth proxy.
#[derive(Clone, Debug)]
pub struct HttpTokenApi {
	http: reqwest::Client,
	client_id: String,
	oauth_base_url: Url,
	auth_server_url: Url,
}

impl HttpTokenApi {
	pub fn new(client_id: String, oauth_base_url: Url, auth_server_url: Url) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(concat!("catcore/", env!("CARGO_PKG_VERSION")))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			client_id,
			oauth_base_url,
			auth_server_url,
		})
	}

	fn oauth_url(&self, path: &str) -> anyhow::Result<Url> {
		self.oauth_base_url.join(path).context("join oauth url")
	}

	fn auth_server(&self, path: &str) -> anyhow::Result<Url> {
		self.auth_server_url.join(path).context("join auth server url")
	}
}

#[async_trait]
impl TokenApi for HttpTokenApi {
	async fn validate(&self, token: &str) -> anyhow::Result<TokenReply<ValidationResponse>> {
		let url = self.oauth_url("validate")?;
		let resp = send_with_transport_retry(
			|| self.http.get(url.clone()).header("Authorization", format!("OAuth {token}")),
			"GET oauth2/validate",
		)
		.await?;
		decode_reply(resp, "GET oauth2/validate").await
	}

	async fn exchange_code(&self, code: &str, redirect_url: &str) -> anyhow::Result<TokenReply<AuthorizationResponse>> {
		let mut url = self.auth_server("api/twitch/authorize")?;
		url.query_pairs_mut()
			.append_pair("code", code)
			.append_pair("redirect_uri", redirect_url);
		let resp = send_with_transport_retry(|| self.http.post(url.clone()), "POST api/twitch/authorize").await?;
		decode_reply(resp, "POST api/twitch/authorize").await
	}

	async fn app_token(&self) -> anyhow::Result<TokenReply<AppTokenResponse>> {
		let url = self.auth_server("api/twitch/appauthorize")?;
		let resp = send_with_transport_retry(|| self.http.post(url.clone()), "POST api/twitch/appauthorize").await?;
		decode_reply(resp, "POST api/twitch/appauthorize").await
	}

	async fn refresh(&self, refresh_token: &str) -> anyhow::Result<TokenReply<AuthorizationResponse>> {
		let mut url = self.auth_server("api/twitch/refresh")?;
		url.query_pairs_mut().append_pair("refresh_token", refresh_token);
		let resp = send_with_transport_retry(|| self.http.post(url.clone()), "POST api/twitch/refresh").await?;
		decode_reply(resp, "POST api/twitch/refresh").await
	}

	async fn revoke(&self, token: &str) -> anyhow::Result<bool> {
		let mut url = self.oauth_url("revoke")?;
		url.query_pairs_mut()
			.append_pair("client_id", &self.client_id)
			.append_pair("token", token);
		let resp = send_with_transport_retry(|| self.http.post(url.clone()), "POST oauth2/revoke").await?;
		Ok(resp.status().is_success())
	}
}
