#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::{CredentialStore, send_with_transport_retry};

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";

const CONDUITS_PATH: &str = "/helix/eventsub/conduits";
const CONDUIT_SHARDS_PATH: &str = "/helix/eventsub/conduits/shards";
const SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTransport {
	pub method: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conduit_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

/// One EventSub subscription as Helix reports it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionInfo {
	pub id: String,
	#[serde(default)]
	pub status: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub version: String,
	#[serde(default)]
	pub condition: serde_json::Value,
	#[serde(default)]
	pub transport: Option<SubscriptionTransport>,
}

impl SubscriptionInfo {
	pub fn conduit_id(&self) -> Option<&str> {
		self.transport
			.as_ref()
			.and_then(|t| t.conduit_id.as_deref())
			.filter(|id| !id.is_empty())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
	#[serde(rename = "type")]
	pub kind: String,
	pub version: String,
	pub condition: serde_json::Value,
	pub transport: SubscriptionTransport,
}

impl SubscriptionRequest {
	pub fn on_conduit(kind: &str, version: &str, condition: serde_json::Value, conduit_id: &str) -> Self {
		Self {
			kind: kind.to_string(),
			version: version.to_string(),
			condition,
			transport: SubscriptionTransport {
				method: "conduit".into(),
				conduit_id: Some(conduit_id.to_string()),
				session_id: None,
			},
		}
	}
}

/// Conduit and subscription management on the Helix API.
#[async_trait]
pub trait ConduitApi: Send + Sync + 'static {
	/// Every subscription visible to the app token, all pages.
	async fn list_subscriptions(&self) -> anyhow::Result<Vec<SubscriptionInfo>>;
	/// Creates a conduit and returns its id.
	async fn create_conduit(&self, shard_count: u32) -> anyhow::Result<String>;
	/// Points shard `shard_id` of `conduit_id` at a websocket session.
	async fn assign_shard(&self, conduit_id: &str, shard_id: &str, session_id: &str) -> anyhow::Result<()>;
	async fn create_subscription(&self, request: &SubscriptionRequest) -> anyhow::Result<SubscriptionInfo>;
	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<()>;
	async fn delete_conduit(&self, conduit_id: &str) -> anyhow::Result<()>;
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// Sends once more after a rate limit or a server error; auth failures bail.
async fn send_with_retry<F>(build: F, label: &'static str) -> anyhow::Result<reqwest::Response>
where
	F: Fn() -> reqwest::RequestBuilder,
{
	let resp = send_with_transport_retry(&build, label).await?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
	{
		tokio::time::sleep(delay).await;
		return send_with_transport_retry(&build, label).await;
	}

	if status.is_server_error() {
		tokio::time::sleep(Duration::from_millis(250)).await;
		return send_with_transport_retry(&build, label).await;
	}

	Ok(resp)
}

#[derive(Debug, Deserialize)]
struct HelixDataResponse<T> {
	data: Vec<T>,
	#[serde(default)]
	pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
struct HelixPagination {
	#[serde(default)]
	cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixConduit {
	id: String,
}

#[derive(Debug, Serialize)]
struct CreateConduitRequest {
	shard_count: u32,
}

#[derive(Debug, Serialize)]
struct UpdateShardsRequest<'a> {
	conduit_id: &'a str,
	shards: [ShardUpdate<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ShardUpdate<'a> {
	id: &'a str,
	transport: SessionTransport<'a>,
}

#[derive(Debug, Serialize)]
struct SessionTransport<'a> {
	method: &'static str,
	session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct UpdateShardsResponse {
	#[serde(default)]
	errors: Vec<ShardError>,
}

#[derive(Debug, Deserialize)]
struct ShardError {
	#[serde(default)]
	id: String,
	#[serde(default)]
	message: String,
}

struct AppAuth {
	client_id: String,
	bearer: String,
}

/// reqwest-backed [`ConduitApi`] authenticated with the app access token.
#[derive(Clone)]
pub struct HelixConduitClient {
	http: reqwest::Client,
	base_url: Url,
	auth: Arc<CredentialStore>,
}

impl HelixConduitClient {
	pub fn new(base_url: Url, auth: Arc<CredentialStore>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("catcore/0.x (eventsub-conduit)")
			.build()
			.context("build reqwest client")?;

		Ok(Self { http, base_url, auth })
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	/// Client id of the validated identity, falling back to the configured one.
	fn client_id(&self) -> String {
		self.auth
			.logged_in_user()
			.map(|u| u.client_id)
			.filter(|id| !id.is_empty())
			.unwrap_or_else(|| self.auth.client_id().to_string())
	}

	fn app_auth(&self) -> anyhow::Result<AppAuth> {
		let token = self.auth.app_access_token().context("no app access token")?;
		Ok(AppAuth {
			client_id: self.client_id(),
			bearer: format!("Bearer {token}"),
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder, auth: &AppAuth) -> reqwest::RequestBuilder {
		req.header("Client-Id", &auth.client_id).header("Authorization", &auth.bearer)
	}

	async fn read_body(resp: reqwest::Response, label: &'static str) -> anyhow::Result<String> {
		let status = resp.status();
		let body = resp.text().await.with_context(|| format!("helix {label} read body"))?;
		if !status.is_success() {
			anyhow::bail!("helix {label} failed: status={status} body={body}");
		}
		Ok(body)
	}
}

#[async_trait]
impl ConduitApi for HelixConduitClient {
	async fn list_subscriptions(&self) -> anyhow::Result<Vec<SubscriptionInfo>> {
		let auth = self.app_auth()?;
		let mut out = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let mut path = SUBSCRIPTIONS_PATH.to_string();
			if let Some(after) = &after {
				path.push_str("?after=");
				path.push_str(&urlencoding::encode(after));
			}
			let url = self.url(&path)?;
			let resp = send_with_retry(|| self.authed(self.http.get(url.clone()), &auth), "GET subscriptions").await?;
			let body = Self::read_body(resp, "GET subscriptions").await?;
			let page: HelixDataResponse<SubscriptionInfo> =
				serde_json::from_str(&body).context("helix list subscriptions parse json")?;

			out.extend(page.data);
			match page.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty()) {
				Some(cursor) => after = Some(cursor),
				None => break,
			}
		}

		Ok(out)
	}

	async fn create_conduit(&self, shard_count: u32) -> anyhow::Result<String> {
		let url = self.url(CONDUITS_PATH)?;
		let auth = self.app_auth()?;
		let payload = CreateConduitRequest { shard_count };

		let resp = send_with_retry(
			|| self.authed(self.http.post(url.clone()), &auth).json(&payload),
			"POST conduits",
		)
		.await?;
		let body = Self::read_body(resp, "POST conduits").await?;
		let parsed: HelixDataResponse<HelixConduit> =
			serde_json::from_str(&body).context("helix create conduit parse json")?;

		parsed
			.data
			.into_iter()
			.next()
			.map(|c| c.id)
			.context("helix create conduit returned no conduit")
	}

	async fn assign_shard(&self, conduit_id: &str, shard_id: &str, session_id: &str) -> anyhow::Result<()> {
		let url = self.url(CONDUIT_SHARDS_PATH)?;
		let payload = UpdateShardsRequest {
			conduit_id,
			shards: [ShardUpdate {
				id: shard_id,
				transport: SessionTransport {
					method: "websocket",
					session_id,
				},
			}],
		};
		let auth = self.app_auth()?;

		let resp = send_with_retry(
			|| self.authed(self.http.patch(url.clone()), &auth).json(&payload),
			"PATCH conduit shards",
		)
		.await?;
		let body = Self::read_body(resp, "PATCH conduit shards").await?;

		let parsed: UpdateShardsResponse = serde_json::from_str(&body).context("helix update shards parse json")?;
		if let Some(err) = parsed.errors.first() {
			anyhow::bail!("helix shard {} rejected: {}", err.id, err.message);
		}
		Ok(())
	}

	async fn create_subscription(&self, request: &SubscriptionRequest) -> anyhow::Result<SubscriptionInfo> {
		let url = self.url(SUBSCRIPTIONS_PATH)?;
		let auth = self.app_auth()?;

		let resp = send_with_retry(
			|| self.authed(self.http.post(url.clone()), &auth).json(request),
			"POST subscriptions",
		)
		.await
		.with_context(|| format!("helix create subscription (type={})", request.kind))?;

		if resp.status() == StatusCode::CONFLICT {
			anyhow::bail!("helix create subscription conflict (type={})", request.kind);
		}
		let body = Self::read_body(resp, "POST subscriptions").await?;
		let parsed: HelixDataResponse<SubscriptionInfo> = serde_json::from_str(&body)
			.with_context(|| format!("helix create subscription parse json (type={})", request.kind))?;

		parsed
			.data
			.into_iter()
			.next()
			.with_context(|| format!("helix create subscription returned nothing (type={})", request.kind))
	}

	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!("{SUBSCRIPTIONS_PATH}?id={}", urlencoding::encode(subscription_id)))?;
		let auth = self.app_auth()?;

		let resp = send_with_retry(
			|| self.authed(self.http.delete(url.clone()), &auth),
			"DELETE subscriptions",
		)
		.await?;

		let status = resp.status();
		if status == StatusCode::NO_CONTENT || status.is_success() {
			return Ok(());
		}
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix delete subscription failed: status={status} body={body}");
	}

	async fn delete_conduit(&self, conduit_id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!("{CONDUITS_PATH}?id={}", urlencoding::encode(conduit_id)))?;
		let auth = self.app_auth()?;

		let resp = send_with_retry(|| self.authed(self.http.delete(url.clone()), &auth), "DELETE conduits").await?;

		let status = resp.status();
		if status == StatusCode::NO_CONTENT || status.is_success() {
			return Ok(());
		}
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix delete conduit failed: status={status} body={body}");
	}
}
