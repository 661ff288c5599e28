#![forbid(unsafe_code)]

//! Credential lifecycle: load, validate, refresh and revoke the account tokens.

mod api;
mod credentials;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use catcore_domain::AuthStatus;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};
use url::Url;

pub(crate) use api::send_with_transport_retry;
pub use api::{AppTokenResponse, AuthorizationResponse, HttpTokenApi, TokenApi, TokenReply, ValidationResponse};
pub use credentials::{CredentialFile, CredentialStoreError, TwitchCredentials, VALIDITY_MARGIN};

pub const DEFAULT_OAUTH_BASE_URL: &str = "https://id.twitch.tv/oauth2/";
pub const DEFAULT_AUTH_SERVER_URL: &str = "http://127.0.0.1:7071/";

pub const AUTHORIZATION_SCOPES: &[&str] = &[
	"bits:read",
	"chat:edit",
	"chat:read",
	"channel:manage:broadcast",
	"channel:manage:polls",
	"channel:manage:predictions",
	"channel:manage:raids",
	"channel:manage:redemptions",
	"channel:moderate",
	"moderator:read:followers",
	"channel:read:subscriptions",
	"channel:bot",
	"moderator:manage:announcements",
	"moderator:manage:banned_users",
	"moderator:manage:chat_messages",
	"moderator:manage:chat_settings",
	"moderator:manage:shoutouts",
	"user:manage:chat_color",
	"user:read:follows",
	"user:write:chat",
	"user:bot",
];

#[derive(Debug, Clone)]
pub struct AuthSettings {
	pub client_id: String,
	pub oauth_base_url: Url,
}

enum Validation {
	Valid(ValidationResponse),
	Invalid,
	Unreachable,
}

/// Single source of truth for the account tokens.
///
/// Readers get snapshots; writers install whole new values. Two async locks
/// serialize network work: one for identity validation, one for refresh.
pub struct CredentialStore {
	api: Arc<dyn TokenApi>,
	settings: AuthSettings,
	file: Option<CredentialFile>,
	credentials: watch::Sender<TwitchCredentials>,
	status: watch::Sender<AuthStatus>,
	logged_in_user: RwLock<Option<ValidationResponse>>,
	identity_lock: Mutex<()>,
	refresh_lock: Mutex<()>,
}

impl CredentialStore {
	/// Loads persisted credentials; an unreadable file is logged and treated as logged out.
	pub fn new(api: Arc<dyn TokenApi>, settings: AuthSettings, file: Option<CredentialFile>) -> Self {
		let initial = match file.as_ref().map(CredentialFile::load) {
			Some(Ok(c)) => c,
			Some(Err(e)) => {
				error!(error = %e, "failed to load twitch credentials; starting logged out");
				TwitchCredentials::empty()
			}
			None => TwitchCredentials::empty(),
		};

		let (credentials, _) = watch::channel(initial);
		let (status, _) = watch::channel(AuthStatus::Uninitialized);

		Self {
			api,
			settings,
			file,
			credentials,
			status,
			logged_in_user: RwLock::new(None),
			identity_lock: Mutex::new(()),
			refresh_lock: Mutex::new(()),
		}
	}

	pub fn client_id(&self) -> &str {
		&self.settings.client_id
	}

	pub fn credentials(&self) -> TwitchCredentials {
		self.credentials.borrow().clone()
	}

	/// Fires only when the token strings change.
	pub fn subscribe_credentials(&self) -> watch::Receiver<TwitchCredentials> {
		self.credentials.subscribe()
	}

	pub fn subscribe_status(&self) -> watch::Receiver<AuthStatus> {
		self.status.subscribe()
	}

	pub fn status(&self) -> AuthStatus {
		*self.status.borrow()
	}

	pub fn has_tokens(&self) -> bool {
		self.credentials.borrow().has_tokens()
	}

	pub fn token_is_valid(&self) -> bool {
		self.credentials.borrow().token_is_valid_at(Utc::now())
	}

	pub fn app_token_is_valid(&self) -> bool {
		self.credentials.borrow().app_token_is_valid_at(Utc::now())
	}

	pub fn access_token(&self) -> Option<String> {
		self.credentials.borrow().access_token().map(str::to_string)
	}

	pub fn app_access_token(&self) -> Option<String> {
		self.credentials.borrow().app_access_token().map(str::to_string)
	}

	pub fn logged_in_user(&self) -> Option<ValidationResponse> {
		self.logged_in_user.read().clone()
	}

	/// Last validated identity; never touches the network.
	pub fn fetch_user_info(&self) -> Option<ValidationResponse> {
		self.logged_in_user()
	}

	pub fn authorization_url(&self, redirect_url: &str) -> String {
		format!(
			"{}authorize?client_id={}&redirect_uri={}&response_type=code&force_verify=true&scope={}",
			self.settings.oauth_base_url,
			urlencoding::encode(&self.settings.client_id),
			urlencoding::encode(redirect_url),
			urlencoding::encode(&AUTHORIZATION_SCOPES.join(" ")),
		)
	}

	/// Installs `new` and persists it. Observers are notified only when the tokens differ.
	pub fn update_credentials(&self, new: TwitchCredentials) {
		if let Some(file) = &self.file
			&& let Err(e) = file.save(&new)
		{
			error!(error = %e, "failed to persist twitch credentials");
		}

		let changed = self.credentials.send_if_modified(|current| {
			let changed = *current != new;
			*current = new;
			changed
		});
		if changed {
			info!("twitch credentials changed");
		}
	}

	fn set_status(&self, status: AuthStatus) {
		let changed = self.status.send_if_modified(|current| {
			if *current == status {
				return false;
			}
			*current = status;
			true
		});
		if changed {
			debug!(%status, "twitch authentication status changed");
		}
	}

	fn reset(&self) {
		self.update_credentials(TwitchCredentials::empty());
		*self.logged_in_user.write() = None;
	}

	/// Returns the cached identity, validating and refreshing under the identity lock when needed.
	pub async fn fetch_user_info_with_refresh(&self) -> Option<ValidationResponse> {
		if !self.has_tokens() {
			warn!("no twitch credentials present");
			return None;
		}

		if self.token_is_valid()
			&& let Some(user) = self.logged_in_user()
		{
			return Some(user);
		}

		let _guard = self.identity_lock.lock().await;

		if self.token_is_valid()
			&& let Some(user) = self.logged_in_user()
		{
			return Some(user);
		}

		if matches!(self.status(), AuthStatus::Uninitialized | AuthStatus::Unauthorized) {
			self.set_status(AuthStatus::Initializing);
		}

		let current = self.credentials();
		let validated = match self.validate(&current, false).await {
			Validation::Unreachable => {
				error!("could not reach twitch to validate tokens; check the network connection");
				return None;
			}
			Validation::Valid(v) => Some(v),
			Validation::Invalid => None,
		};

		info!(
			is_valid = validated.is_some() && self.token_is_valid(),
			is_refreshable = current.refresh_token().is_some(),
			"validated twitch token"
		);
		if validated.is_none() || !self.token_is_valid() {
			info!("refreshing twitch tokens");
			self.refresh_tokens().await;
		}

		self.logged_in_user()
	}

	/// Validates app and user token of `candidate`.
	///
	/// On success the merged credential (later expiry wins) is installed. On failure the store is
	/// reset to logged out when `reset_on_failure`; transport errors change nothing.
	pub async fn validate_access_token(
		&self,
		candidate: &TwitchCredentials,
		reset_on_failure: bool,
	) -> Option<ValidationResponse> {
		match self.validate(candidate, reset_on_failure).await {
			Validation::Valid(v) => Some(v),
			Validation::Invalid | Validation::Unreachable => None,
		}
	}

	async fn validate(&self, candidate: &TwitchCredentials, reset_on_failure: bool) -> Validation {
		let (Some(access), Some(app)) = (candidate.access_token(), candidate.app_access_token()) else {
			return Validation::Invalid;
		};

		let app_reply = match self.api.validate(app).await {
			Ok(r) => r,
			Err(e) => {
				warn!(error = %e, "app token validation request failed");
				return Validation::Unreachable;
			}
		};
		let app_validation = match app_reply {
			TokenReply::Success(v) => v,
			other => {
				debug!(reply = ?other, "app token rejected");
				return self.fail_validation(reset_on_failure);
			}
		};

		let user_reply = match self.api.validate(access).await {
			Ok(r) => r,
			Err(e) => {
				warn!(error = %e, "user token validation request failed");
				return Validation::Unreachable;
			}
		};
		let user_validation = match user_reply {
			TokenReply::Success(v) => v,
			other => {
				debug!(reply = ?other, "user token rejected");
				return self.fail_validation(reset_on_failure);
			}
		};

		*self.logged_in_user.write() = Some(user_validation.clone());
		let merged = candidate.merged_with_expiry(user_validation.expires_in, app_validation.expires_in, Utc::now());
		self.update_credentials(merged);
		self.set_status(AuthStatus::Authenticated);

		Validation::Valid(user_validation)
	}

	fn fail_validation(&self, reset_on_failure: bool) -> Validation {
		if reset_on_failure {
			self.reset();
		}
		self.set_status(AuthStatus::Unauthorized);
		Validation::Invalid
	}

	/// Exchanges the refresh token for a new credential and validates it.
	pub async fn refresh_tokens(&self) -> bool {
		let _guard = self.refresh_lock.lock().await;

		let current = self.credentials();
		let Some(refresh_token) = current.refresh_token() else {
			return false;
		};
		if current.token_is_valid_at(Utc::now()) {
			return true;
		}

		info!("refreshing tokens using the auth back-end");
		let user = match self.api.refresh(refresh_token).await {
			Ok(TokenReply::Success(r)) => r,
			Ok(TokenReply::Rejected(status)) => {
				warn!(status, "refreshing tokens resulted in non-success status code");
				return false;
			}
			Ok(TokenReply::Malformed(e)) => {
				warn!(error = %e, "failed to deserialize the refresh tokens body");
				self.reset();
				return false;
			}
			Err(e) => {
				warn!(error = %e, "refresh tokens request failed");
				return false;
			}
		};

		let app = match self.api.app_token().await {
			Ok(TokenReply::Success(r)) => r,
			Ok(TokenReply::Rejected(status)) => {
				warn!(status, "app token request resulted in non-success status code");
				return false;
			}
			Ok(TokenReply::Malformed(e)) => {
				warn!(error = %e, "failed to deserialize the app token body");
				self.reset();
				return false;
			}
			Err(e) => {
				warn!(error = %e, "app token request failed");
				return false;
			}
		};

		let refreshed = TwitchCredentials::from_token_responses(&user, &app, Utc::now());
		self.validate_access_token(&refreshed, true).await.is_some()
	}

	/// Revokes the refresh token. The local credential is cleared whatever the outcome.
	pub async fn revoke_tokens(&self) -> bool {
		let current = self.credentials();
		let Some(refresh_token) = current.refresh_token() else {
			return false;
		};

		let result = self.api.revoke(refresh_token).await;
		self.reset();
		self.set_status(AuthStatus::Unauthorized);

		match result {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "revoke request failed");
				false
			}
		}
	}

	/// Completes the authorization-code flow. Returns whether a validated credential was installed.
	pub async fn get_tokens_by_authorization_code(&self, code: &str, redirect_url: &str) -> bool {
		info!("exchanging authorization code for credentials using the auth back-end");

		let user = match self.api.exchange_code(code, redirect_url).await {
			Ok(TokenReply::Success(r)) => r,
			Ok(TokenReply::Rejected(status)) => {
				warn!(status, "exchanging authorization code resulted in non-success status code");
				return false;
			}
			Ok(TokenReply::Malformed(e)) => {
				error!(error = %e, "failed to deserialize the credentials response");
				return false;
			}
			Err(e) => {
				error!(error = %e, "failed to exchange the authorization code");
				return false;
			}
		};

		let app = match self.api.app_token().await {
			Ok(TokenReply::Success(r)) => r,
			Ok(TokenReply::Rejected(status)) => {
				warn!(status, "app token request resulted in non-success status code");
				return false;
			}
			Ok(TokenReply::Malformed(e)) => {
				error!(error = %e, "failed to deserialize the app token response");
				return false;
			}
			Err(e) => {
				error!(error = %e, "failed to request an app token");
				return false;
			}
		};

		let fresh = TwitchCredentials::from_token_responses(&user, &app, Utc::now());
		self.validate_access_token(&fresh, true).await.is_some()
	}
}
