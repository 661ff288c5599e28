#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use tracing::{info, warn};

use crate::upstream::{Grant, TokenEndpoint};

const AUTHORIZE_PATH: &str = "/api/twitch/authorize";
const APP_AUTHORIZE_PATH: &str = "/api/twitch/appauthorize";
const REFRESH_PATH: &str = "/api/twitch/refresh";

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

fn json(body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	resp.headers_mut()
		.insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
	resp
}

fn query_params<B>(req: &Request<B>) -> HashMap<String, String> {
	req.uri()
		.query()
		.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
		.unwrap_or_default()
}

fn required(params: &HashMap<String, String>, key: &str) -> Option<String> {
	params.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Maps a request onto a grant, or the status to answer with.
fn route<B>(req: &Request<B>) -> Result<(Grant, StatusCode), StatusCode> {
	let path = req.uri().path().trim_end_matches('/');
	let known = matches!(path, AUTHORIZE_PATH | APP_AUTHORIZE_PATH | REFRESH_PATH);
	if !known {
		return Err(StatusCode::NOT_FOUND);
	}
	if req.method() != Method::POST {
		return Err(StatusCode::METHOD_NOT_ALLOWED);
	}

	let params = query_params(req);
	match path {
		AUTHORIZE_PATH => {
			let (Some(code), Some(redirect_uri)) = (required(&params, "code"), required(&params, "redirect_uri")) else {
				return Err(StatusCode::BAD_REQUEST);
			};
			Ok((Grant::AuthorizationCode { code, redirect_uri }, StatusCode::BAD_REQUEST))
		}
		APP_AUTHORIZE_PATH => Ok((Grant::ClientCredentials, StatusCode::UNAUTHORIZED)),
		_ => {
			let Some(refresh_token) = required(&params, "refresh_token") else {
				return Err(StatusCode::BAD_REQUEST);
			};
			Ok((Grant::RefreshToken { refresh_token }, StatusCode::BAD_REQUEST))
		}
	}
}

/// Handles one proxy request. The request body is never read.
pub async fn handle<B>(
	req: Request<B>,
	upstream: Arc<dyn TokenEndpoint>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
	let (grant, rejected) = match route(&req) {
		Ok(v) => v,
		Err(status) => {
			info!(method = %req.method(), path = %req.uri().path(), %status, "rejected proxy request");
			return Ok(empty(status));
		}
	};

	match upstream.exchange(&grant).await {
		Ok(Some(body)) => Ok(json(body)),
		Ok(None) => Ok(empty(rejected)),
		Err(e) => {
			warn!(path = %req.uri().path(), error = ?e, "token exchange failed");
			Ok(empty(rejected))
		}
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;
	use http_body_util::BodyExt;
	use std::sync::Mutex;

	use super::*;

	#[derive(Default)]
	struct FakeEndpoint {
		grants: Mutex<Vec<Grant>>,
		reject: bool,
	}

	#[async_trait]
	impl TokenEndpoint for FakeEndpoint {
		async fn exchange(&self, grant: &Grant) -> anyhow::Result<Option<Bytes>> {
			self.grants.lock().unwrap().push(grant.clone());
			if self.reject {
				return Ok(None);
			}
			Ok(Some(Bytes::from_static(br#"{"access_token":"a"}"#)))
		}
	}

	fn request(method: Method, uri: &str) -> Request<()> {
		Request::builder().method(method).uri(uri).body(()).unwrap()
	}

	async fn call(endpoint: Arc<FakeEndpoint>, method: Method, uri: &str) -> (StatusCode, Option<String>, String) {
		let resp = handle(request(method, uri), endpoint).await.unwrap();
		let status = resp.status();
		let ct = resp
			.headers()
			.get(CONTENT_TYPE)
			.map(|v| v.to_str().unwrap().to_string());
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		(status, ct, String::from_utf8(body.to_vec()).unwrap())
	}

	#[tokio::test]
	async fn authorize_forwards_code_and_redirect() {
		let endpoint = Arc::new(FakeEndpoint::default());
		let (status, ct, body) = call(
			endpoint.clone(),
			Method::POST,
			"/api/twitch/authorize?code=abc&redirect_uri=http%3A%2F%2Flocalhost%2Fcb",
		)
		.await;

		assert_eq!(status, StatusCode::OK);
		assert_eq!(ct.as_deref(), Some("application/json"));
		assert_eq!(body, r#"{"access_token":"a"}"#);
		assert_eq!(
			endpoint.grants.lock().unwrap().clone(),
			vec![Grant::AuthorizationCode {
				code: "abc".into(),
				redirect_uri: "http://localhost/cb".into()
			}]
		);
	}

	#[tokio::test]
	async fn missing_parameters_are_bad_requests() {
		let endpoint = Arc::new(FakeEndpoint::default());
		for uri in [
			"/api/twitch/authorize?code=abc",
			"/api/twitch/authorize?redirect_uri=x&code=%20",
			"/api/twitch/refresh",
		] {
			let (status, _, body) = call(endpoint.clone(), Method::POST, uri).await;
			assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
			assert!(body.is_empty());
		}
		assert!(endpoint.grants.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn unknown_paths_and_methods_are_refused() {
		let endpoint = Arc::new(FakeEndpoint::default());
		let (status, _, _) = call(endpoint.clone(), Method::POST, "/api/twitch/other").await;
		assert_eq!(status, StatusCode::NOT_FOUND);
		let (status, _, _) = call(endpoint.clone(), Method::GET, "/api/twitch/appauthorize").await;
		assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
		assert!(endpoint.grants.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn upstream_rejection_maps_to_client_errors() {
		let endpoint = Arc::new(FakeEndpoint {
			reject: true,
			..FakeEndpoint::default()
		});
		let (status, _, body) = call(endpoint.clone(), Method::POST, "/api/twitch/refresh?refresh_token=r").await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert!(body.is_empty());

		let (status, _, _) = call(endpoint.clone(), Method::POST, "/api/twitch/appauthorize").await;
		assert_eq!(status, StatusCode::UNAUTHORIZED);
		assert_eq!(
			endpoint.grants.lock().unwrap().clone(),
			vec![
				Grant::RefreshToken {
					refresh_token: "r".into()
				},
				Grant::ClientCredentials
			]
		);
	}
}
