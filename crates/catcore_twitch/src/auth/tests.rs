use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use catcore_domain::AuthStatus;
use chrono::Duration as ChronoDuration;
use tokio::time::timeout;

use super::*;
use crate::testing::{FakeTokenApi, creds, identity, settings, store};

#[test]
fn expiry_only_change_does_not_notify() {
	let store = store(Arc::new(FakeTokenApi::default()));
	store.update_credentials(creds("tok", ChronoDuration::minutes(10)));
	let mut rx = store.subscribe_credentials();
	rx.mark_unchanged();

	store.update_credentials(creds("tok", ChronoDuration::hours(5)));
	assert!(!rx.has_changed().unwrap());
	assert!(store.token_is_valid(), "new expiry is still installed");

	store.update_credentials(creds("other", ChronoDuration::hours(5)));
	assert!(rx.has_changed().unwrap());
}

#[tokio::test]
async fn validation_keeps_the_longer_expiry() {
	let api = Arc::new(FakeTokenApi::default());
	api.push_validation(Ok(TokenReply::Success(identity(3600))));
	api.push_validation(Ok(TokenReply::Success(identity(3600))));
	let store = store(api);

	let candidate = creds("tok", ChronoDuration::minutes(10));
	let before = Utc::now();
	let user = store.validate_access_token(&candidate, true).await.unwrap();
	assert_eq!(user.login, "catbot");

	let installed = store.credentials();
	let until = installed.valid_until.unwrap();
	assert!(until >= before + ChronoDuration::seconds(3600));
	assert!(until <= Utc::now() + ChronoDuration::seconds(3600));
	assert_eq!(store.status(), AuthStatus::Authenticated);
	assert_eq!(store.fetch_user_info(), Some(user));
}

#[tokio::test]
async fn validation_keeps_stored_expiry_when_it_is_later() {
	let api = Arc::new(FakeTokenApi::default());
	api.push_validation(Ok(TokenReply::Success(identity(3600))));
	api.push_validation(Ok(TokenReply::Success(identity(3600))));
	let store = store(api);

	let candidate = creds("tok", ChronoDuration::hours(3));
	store.validate_access_token(&candidate, true).await.unwrap();
	assert_eq!(store.credentials().valid_until, candidate.valid_until);
}

#[tokio::test]
async fn rejected_validation_resets_only_when_asked() {
	let api = Arc::new(FakeTokenApi::default());
	let store = store(api.clone());
	store.update_credentials(creds("tok", ChronoDuration::minutes(1)));

	assert!(store.validate_access_token(&store.credentials(), false).await.is_none());
	assert!(store.has_tokens());
	assert_eq!(store.status(), AuthStatus::Unauthorized);

	assert!(store.validate_access_token(&store.credentials(), true).await.is_none());
	assert!(store.credentials().is_empty());
	assert!(store.fetch_user_info().is_none());
}

#[tokio::test]
async fn transport_failure_leaves_state_untouched() {
	let api = Arc::new(FakeTokenApi::default());
	api.push_validation(Err(anyhow::anyhow!("connection reset")));
	let store = store(api.clone());
	store.update_credentials(creds("tok", ChronoDuration::minutes(1)));

	assert!(store.fetch_user_info_with_refresh().await.is_none());
	assert!(store.has_tokens());
	assert_eq!(store.status(), AuthStatus::Initializing);
	assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_token_is_refreshed_and_revalidated() {
	let api = Arc::new(FakeTokenApi::default());
	// stale token: validation rejected
	api.push_validation(Ok(TokenReply::Rejected(401)));
	// refreshed token: app + user validation succeed
	api.push_validation(Ok(TokenReply::Success(identity(14400))));
	api.push_validation(Ok(TokenReply::Success(identity(14400))));
	api.refreshes.lock().push_back(TokenReply::Success(AuthorizationResponse {
		access_token: "fresh".into(),
		refresh_token: "refresh2".into(),
		expires_in: 14400,
		scope: vec![],
		token_type: "bearer".into(),
	}));
	api.app_tokens.lock().push_back(TokenReply::Success(AppTokenResponse {
		access_token: "app2".into(),
		expires_in: 5_000_000,
		token_type: "bearer".into(),
	}));

	let store = store(api.clone());
	store.update_credentials(creds("stale", ChronoDuration::minutes(-1)));
	let mut rx = store.subscribe_credentials();
	rx.mark_unchanged();

	let user = timeout(Duration::from_secs(1), store.fetch_user_info_with_refresh())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(user.user_id, "1000");
	assert_eq!(store.access_token().as_deref(), Some("fresh"));
	assert!(store.token_is_valid());
	assert!(rx.has_changed().unwrap());
	assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_refresh_body_logs_out() {
	let api = Arc::new(FakeTokenApi::default());
	api.refreshes.lock().push_back(TokenReply::Malformed("expected value".into()));
	let store = store(api);
	store.update_credentials(creds("stale", ChronoDuration::minutes(-1)));

	assert!(!store.refresh_tokens().await);
	assert!(store.credentials().is_empty());
}

#[tokio::test]
async fn refresh_is_a_noop_while_token_is_valid() {
	let api = Arc::new(FakeTokenApi::default());
	let store = store(api.clone());
	store.update_credentials(creds("tok", ChronoDuration::hours(1)));
	assert!(store.refresh_tokens().await);
	assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cached_identity_short_circuits_validation() {
	let api = Arc::new(FakeTokenApi::default());
	api.push_validation(Ok(TokenReply::Success(identity(3600))));
	api.push_validation(Ok(TokenReply::Success(identity(3600))));
	let store = store(api.clone());
	store.update_credentials(creds("tok", ChronoDuration::hours(1)));

	let first = store.fetch_user_info_with_refresh().await;
	let second = store.fetch_user_info_with_refresh().await;
	assert!(first.is_some());
	assert_eq!(first, second);
	assert_eq!(api.validate_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn revoke_clears_credentials_even_when_rejected() {
	let api = Arc::new(FakeTokenApi::default());
	let store = store(api.clone());
	store.update_credentials(creds("tok", ChronoDuration::hours(1)));

	assert!(!store.revoke_tokens().await);
	assert!(store.credentials().is_empty());
	assert_eq!(api.revoke_calls.load(Ordering::SeqCst), 1);
	assert!(!store.revoke_tokens().await, "nothing left to revoke");
	assert_eq!(api.revoke_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn authorization_url_carries_client_and_scopes() {
	let store = store(Arc::new(FakeTokenApi::default()));
	let url = store.authorization_url("http://localhost:8080/callback");
	assert!(url.starts_with("https://id.twitch.tv/oauth2/authorize?client_id=cid"));
	assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fcallback"));
	assert!(url.contains("response_type=code&force_verify=true"));
	assert!(url.contains("chat%3Aedit%20chat%3Aread"), "scopes are space-joined: {url}");
}

#[test]
fn persisted_credentials_are_loaded_on_start() {
	let dir = tempfile::tempdir().unwrap();
	let file = CredentialFile::new(dir.path().join("twitch_credentials.json"));
	file.save(&creds("persisted", ChronoDuration::hours(1))).unwrap();

	let store = CredentialStore::new(Arc::new(FakeTokenApi::default()), settings(), Some(file));
	assert_eq!(store.access_token().as_deref(), Some("persisted"));
	assert!(store.has_tokens());
}
