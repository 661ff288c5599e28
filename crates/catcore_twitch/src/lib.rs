#![forbid(unsafe_code)]

pub mod auth;
pub mod callbacks;
pub mod eventsub;
pub mod irc;
pub mod pubsub;
pub mod roster;
pub mod state;
pub mod topics;
pub mod ws;

#[cfg(test)]
mod testing;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

pub use auth::{CredentialStore, TwitchCredentials, ValidationResponse};
pub use callbacks::{Callback, CallbackSet};
pub use eventsub::{EventSubManager, EventSubSettings};
pub use irc::{ChatEngine, ChatEvent, ChatSettings};
pub use pubsub::{PubSubManager, PubSubSettings};
pub use roster::ChannelRoster;
pub use state::{RoomStateTracker, UserStateTracker};
pub use topics::{TopicListener, TopicRegistry};
pub use ws::{WsCommand, WsConnector, WsEvent, WsSession};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Cooperative cancellation shared between a session owner and its background tasks.
#[derive(Debug, Clone)]
pub struct CancelToken {
	tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

impl CancelToken {
	pub fn new() -> Self {
		let (tx, _rx) = watch::channel(false);
		Self { tx: Arc::new(tx) }
	}

	pub fn cancel(&self) {
		self.tx.send_replace(true);
	}

	pub fn is_cancelled(&self) -> bool {
		*self.tx.borrow()
	}

	/// Resolves once `cancel` has been called (immediately if it already was).
	pub async fn cancelled(&self) {
		let mut rx = self.tx.subscribe();
		let _ = rx.wait_for(|cancelled| *cancelled).await;
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("oauth-token");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.expose(), "oauth-token");
		assert!(SecretString::new("  ").is_blank());
		assert_eq!(serde_json::to_string(&s).unwrap(), "\"\"");
	}

	#[tokio::test]
	async fn cancel_token_wakes_waiters_and_stays_cancelled() {
		let token = CancelToken::new();
		let waiter = {
			let token = token.clone();
			tokio::spawn(async move { token.cancelled().await })
		};

		token.cancel();
		tokio::time::timeout(Duration::from_millis(250), waiter)
			.await
			.expect("waiter should wake")
			.expect("join");

		assert!(token.is_cancelled());
		tokio::time::timeout(Duration::from_millis(50), token.cancelled())
			.await
			.expect("already-cancelled token resolves immediately");
	}
}
