//! Shared fakes for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use url::Url;

use crate::SecretString;
use crate::auth::{
	AppTokenResponse, AuthSettings, AuthorizationResponse, CredentialStore, DEFAULT_OAUTH_BASE_URL, TokenApi,
	TokenReply, TwitchCredentials, ValidationResponse,
};

pub const SELF_USER_ID: &str = "1000";
pub const SELF_LOGIN: &str = "catbot";

/// Scripted token endpoints. Empty queues answer with a rejection.
#[derive(Default)]
pub struct FakeTokenApi {
	pub validations: Mutex<VecDeque<anyhow::Result<TokenReply<ValidationResponse>>>>,
	pub refreshes: Mutex<VecDeque<TokenReply<AuthorizationResponse>>>,
	pub app_tokens: Mutex<VecDeque<TokenReply<AppTokenResponse>>>,
	pub revoke_accepted: bool,
	pub validate_calls: AtomicUsize,
	pub refresh_calls: AtomicUsize,
	pub revoke_calls: AtomicUsize,
}

impl FakeTokenApi {
	pub fn push_validation(&self, reply: anyhow::Result<TokenReply<ValidationResponse>>) {
		self.validations.lock().push_back(reply);
	}
}

#[async_trait]
impl TokenApi for FakeTokenApi {
	async fn validate(&self, _token: &str) -> anyhow::Result<TokenReply<ValidationResponse>> {
		self.validate_calls.fetch_add(1, Ordering::SeqCst);
		self.validations
			.lock()
			.pop_front()
			.unwrap_or(Ok(TokenReply::Rejected(401)))
	}

	async fn exchange_code(&self, _code: &str, _redirect_url: &str) -> anyhow::Result<TokenReply<AuthorizationResponse>> {
		Ok(self.refreshes.lock().pop_front().unwrap_or(TokenReply::Rejected(400)))
	}

	async fn app_token(&self) -> anyhow::Result<TokenReply<AppTokenResponse>> {
		Ok(self.app_tokens.lock().pop_front().unwrap_or(TokenReply::Rejected(400)))
	}

	async fn refresh(&self, _refresh_token: &str) -> anyhow::Result<TokenReply<AuthorizationResponse>> {
		self.refresh_calls.fetch_add(1, Ordering::SeqCst);
		Ok(self.refreshes.lock().pop_front().unwrap_or(TokenReply::Rejected(400)))
	}

	async fn revoke(&self, _token: &str) -> anyhow::Result<bool> {
		self.revoke_calls.fetch_add(1, Ordering::SeqCst);
		Ok(self.revoke_accepted)
	}
}

pub fn identity(expires_in: i64) -> ValidationResponse {
	ValidationResponse {
		client_id: "cid".into(),
		login: SELF_LOGIN.into(),
		user_id: SELF_USER_ID.into(),
		scopes: vec!["chat:read".into()],
		expires_in,
	}
}

pub fn creds(access: &str, valid_for: ChronoDuration) -> TwitchCredentials {
	let until = Utc::now() + valid_for;
	TwitchCredentials {
		access_token: Some(SecretString::new(access)),
		refresh_token: Some(SecretString::new("refresh")),
		app_access_token: Some(SecretString::new("app")),
		valid_until: Some(until),
		valid_until_app_token: Some(until),
	}
}

pub fn settings() -> AuthSettings {
	AuthSettings {
		client_id: "cid".into(),
		oauth_base_url: Url::parse(DEFAULT_OAUTH_BASE_URL).unwrap(),
	}
}

pub fn store(api: Arc<FakeTokenApi>) -> CredentialStore {
	CredentialStore::new(api, settings(), None)
}

/// A store holding a valid `access` token with a cached identity.
pub async fn authenticated_store(access: &str) -> Arc<CredentialStore> {
	let api = Arc::new(FakeTokenApi::default());
	api.push_validation(Ok(TokenReply::Success(identity(3600))));
	api.push_validation(Ok(TokenReply::Success(identity(3600))));
	let store = Arc::new(store(api));
	let candidate = creds(access, ChronoDuration::hours(4));
	assert!(store.validate_access_token(&candidate, true).await.is_some());
	store
}

/// Installs a different valid token on an already authenticated store; identity is kept.
pub fn rotate_token(store: &CredentialStore, access: &str) {
	store.update_credentials(creds(access, ChronoDuration::hours(4)));
}
