#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::api::{AppTokenResponse, AuthorizationResponse};
use crate::SecretString;

/// Tokens closer than this to expiry are treated as expired.
pub const VALIDITY_MARGIN: ChronoDuration = ChronoDuration::minutes(5);

/// Immutable credential snapshot. Equality covers the three tokens only.
#[derive(Debug, Clone, Default)]
pub struct TwitchCredentials {
	pub access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
	pub app_access_token: Option<SecretString>,
	pub valid_until: Option<DateTime<Utc>>,
	pub valid_until_app_token: Option<DateTime<Utc>>,
}

impl PartialEq for TwitchCredentials {
	fn eq(&self, other: &Self) -> bool {
		self.access_token == other.access_token
			&& self.refresh_token == other.refresh_token
			&& self.app_access_token == other.app_access_token
	}
}

impl Eq for TwitchCredentials {}

fn non_blank(s: &Option<SecretString>) -> Option<&str> {
	s.as_ref().map(SecretString::expose).filter(|s| !s.trim().is_empty())
}

impl TwitchCredentials {
	pub fn empty() -> Self {
		Self::default()
	}

	pub fn from_token_responses(user: &AuthorizationResponse, app: &AppTokenResponse, now: DateTime<Utc>) -> Self {
		Self {
			access_token: Some(SecretString::new(user.access_token.clone())),
			refresh_token: Some(SecretString::new(user.refresh_token.clone())),
			app_access_token: Some(SecretString::new(app.access_token.clone())),
			valid_until: Some(now + ChronoDuration::seconds(user.expires_in)),
			valid_until_app_token: Some(now + ChronoDuration::seconds(app.expires_in)),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.access_token.is_none() && self.refresh_token.is_none() && self.app_access_token.is_none()
	}

	pub fn access_token(&self) -> Option<&str> {
		non_blank(&self.access_token)
	}

	pub fn refresh_token(&self) -> Option<&str> {
		non_blank(&self.refresh_token)
	}

	pub fn app_access_token(&self) -> Option<&str> {
		non_blank(&self.app_access_token)
	}

	/// Access and refresh token are both present.
	pub fn has_tokens(&self) -> bool {
		self.access_token().is_some() && self.refresh_token().is_some()
	}

	pub fn token_is_valid_at(&self, now: DateTime<Utc>) -> bool {
		self.valid_until.is_some_and(|t| t > now + VALIDITY_MARGIN)
	}

	pub fn app_token_is_valid_at(&self, now: DateTime<Utc>) -> bool {
		self.valid_until_app_token.is_some_and(|t| t > now + VALIDITY_MARGIN)
	}

	/// Same tokens; each expiry becomes the later of the stored one and `now + expires_in`.
	pub fn merged_with_expiry(&self, user_expires_in: i64, app_expires_in: i64, now: DateTime<Utc>) -> Self {
		fn later(old: Option<DateTime<Utc>>, fresh: DateTime<Utc>) -> Option<DateTime<Utc>> {
			Some(old.map_or(fresh, |o| o.max(fresh)))
		}

		Self {
			access_token: self.access_token.clone(),
			refresh_token: self.refresh_token.clone(),
			app_access_token: self.app_access_token.clone(),
			valid_until: later(self.valid_until, now + ChronoDuration::seconds(user_expires_in)),
			valid_until_app_token: later(self.valid_until_app_token, now + ChronoDuration::seconds(app_expires_in)),
		}
	}
}

#[derive(Debug, Error)]
pub enum CredentialStoreError {
	#[error("credentials io error at {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("credentials json error at {path}: {source}")]
	Json {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
}

/// On-disk shape; plain strings since `SecretString` serializes redacted.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedCredentials {
	#[serde(default)]
	access_token: Option<String>,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	app_access_token: Option<String>,
	#[serde(default)]
	valid_until: Option<DateTime<Utc>>,
	#[serde(default)]
	valid_until_app_token: Option<DateTime<Utc>>,
}

impl From<&TwitchCredentials> for PersistedCredentials {
	fn from(c: &TwitchCredentials) -> Self {
		let plain = |s: &Option<SecretString>| s.as_ref().map(|s| s.expose().to_string());
		Self {
			access_token: plain(&c.access_token),
			refresh_token: plain(&c.refresh_token),
			app_access_token: plain(&c.app_access_token),
			valid_until: c.valid_until,
			valid_until_app_token: c.valid_until_app_token,
		}
	}
}

impl From<PersistedCredentials> for TwitchCredentials {
	fn from(p: PersistedCredentials) -> Self {
		Self {
			access_token: p.access_token.map(SecretString::new),
			refresh_token: p.refresh_token.map(SecretString::new),
			app_access_token: p.app_access_token.map(SecretString::new),
			valid_until: p.valid_until,
			valid_until_app_token: p.valid_until_app_token,
		}
	}
}

/// JSON credential file.
#[derive(Debug, Clone)]
pub struct CredentialFile {
	path: PathBuf,
}

impl CredentialFile {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// A missing file yields the empty credential.
	pub fn load(&self) -> Result<TwitchCredentials, CredentialStoreError> {
		let raw = match std::fs::read_to_string(&self.path) {
			Ok(s) => s,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TwitchCredentials::empty()),
			Err(source) => {
				return Err(CredentialStoreError::Io {
					path: self.path.clone(),
					source,
				});
			}
		};

		if raw.trim().is_empty() {
			return Ok(TwitchCredentials::empty());
		}

		let persisted: PersistedCredentials = serde_json::from_str(&raw).map_err(|source| CredentialStoreError::Json {
			path: self.path.clone(),
			source,
		})?;
		Ok(persisted.into())
	}

	pub fn save(&self, credentials: &TwitchCredentials) -> Result<(), CredentialStoreError> {
		let io_err = |source| CredentialStoreError::Io {
			path: self.path.clone(),
			source,
		};

		if let Some(parent) = self.path.parent()
			&& !parent.as_os_str().is_empty()
		{
			std::fs::create_dir_all(parent).map_err(io_err)?;
		}

		let json = serde_json::to_string_pretty(&PersistedCredentials::from(credentials)).map_err(|source| {
			CredentialStoreError::Json {
				path: self.path.clone(),
				source,
			}
		})?;
		std::fs::write(&self.path, json).map_err(io_err)
	}
}
