#![forbid(unsafe_code)]

mod handler;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use catcore_util::endpoint::HttpBindEndpoint;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::upstream::{ClientCredentials, TokenEndpoint, TwitchTokenEndpoint};

const DEFAULT_BIND: &str = "http://127.0.0.1:7071";

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,catcore_auth_proxy=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false)
		.init();
}

fn required_env(key: &str) -> anyhow::Result<String> {
	std::env::var(key)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
		.with_context(|| format!("{key} must be set"))
}

fn bind_addr() -> anyhow::Result<SocketAddr> {
	let raw = std::env::var("CATCORE_AUTH_PROXY_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
	let endpoint = HttpBindEndpoint::parse(&raw).map_err(anyhow::Error::msg)?;
	endpoint.to_socket_addr().map_err(anyhow::Error::msg)
}

async fn serve(bind: SocketAddr, upstream: Arc<dyn TokenEndpoint>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await.with_context(|| format!("bind {bind}"))?;
	info!(%bind, "auth proxy listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let upstream = upstream.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handler::handle(req, upstream.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "proxy connection error");
			}
		});
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let credentials = ClientCredentials {
		client_id: required_env("Twitch_CatCore_ClientId")?,
		client_secret: required_env("Twitch_CatCore_ClientSecret")?,
	};
	let bind = bind_addr()?;
	let upstream: Arc<dyn TokenEndpoint> = Arc::new(TwitchTokenEndpoint::new(upstream::TWITCH_TOKEN_URL, credentials)?);

	tokio::select! {
		res = serve(bind, upstream) => res,
		_ = tokio::signal::ctrl_c() => {
			info!("shutting down");
			Ok(())
		}
	}
}
