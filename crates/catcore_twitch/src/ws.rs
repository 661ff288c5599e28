#![forbid(unsafe_code)]

//! Text-frame websocket sessions behind an injectable connector.
//!
//! Agents never touch the tungstenite stream directly: they get a pair of
//! channels and a background pump owns the socket. Tests swap the connector
//! for an in-memory one.

use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};
use url::Url;

use crate::BoxFuture;

pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<WsSession>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsCommand {
	Text(String),
	Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
	Text(String),
	Closed(Option<String>),
}

/// Both halves of a live socket.
#[derive(Debug)]
pub struct WsSession {
	pub tx: mpsc::Sender<WsCommand>,
	pub rx: mpsc::Receiver<WsEvent>,
}

impl WsSession {
	/// Build a session out of raw channel halves; used by in-memory connectors.
	pub fn from_channels(tx: mpsc::Sender<WsCommand>, rx: mpsc::Receiver<WsEvent>) -> Self {
		Self { tx, rx }
	}

	/// Splits into a cloneable writer and the inbound receiver.
	pub fn split(self) -> (WsWriter, mpsc::Receiver<WsEvent>) {
		(WsWriter { tx: self.tx }, self.rx)
	}
}

#[derive(Debug, Clone)]
pub struct WsWriter {
	tx: mpsc::Sender<WsCommand>,
}

impl WsWriter {
	pub async fn send_text(&self, text: impl Into<String>) -> anyhow::Result<()> {
		self.tx
			.send(WsCommand::Text(text.into()))
			.await
			.map_err(|_| anyhow::anyhow!("websocket writer closed"))
	}

	/// Non-blocking send for replies issued from synchronous handlers.
	pub fn try_send_text(&self, text: impl Into<String>) -> anyhow::Result<()> {
		self.tx
			.try_send(WsCommand::Text(text.into()))
			.map_err(|e| anyhow::anyhow!("websocket writer unavailable: {e}"))
	}

	pub async fn close(&self) {
		let _ = self.tx.send(WsCommand::Close).await;
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

const CHANNEL_CAPACITY: usize = 256;

/// Connector that dials a real TLS websocket.
pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(async move { connect_tungstenite(url).await }) as BoxFuture<'static, _>)
}

async fn connect_tungstenite(url: Url) -> anyhow::Result<WsSession> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.with_context(|| format!("connect_async to {url}"))?;

	let (mut sink, mut stream) = ws.split();
	let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(CHANNEL_CAPACITY);
	let (evt_tx, evt_rx) = mpsc::channel::<WsEvent>(CHANNEL_CAPACITY);
	let host = url.host_str().unwrap_or_default().to_string();

	tokio::spawn(async move {
		loop {
			tokio::select! {
				cmd = cmd_rx.recv() => match cmd {
					Some(WsCommand::Text(t)) => {
						if let Err(e) = sink.send(Message::Text(t.into())).await {
							warn!(%host, error = %e, "websocket write failed");
							let _ = evt_tx.send(WsEvent::Closed(Some(e.to_string()))).await;
							break;
						}
					}
					Some(WsCommand::Close) | None => {
						let _ = sink.send(Message::Close(None)).await;
						let _ = evt_tx.send(WsEvent::Closed(None)).await;
						break;
					}
				},
				msg = stream.next() => match msg {
					Some(Ok(Message::Text(t))) => {
						if evt_tx.send(WsEvent::Text(t.to_string())).await.is_err() {
							break;
						}
					}
					Some(Ok(Message::Ping(p))) => {
						let _ = sink.send(Message::Pong(p)).await;
					}
					Some(Ok(Message::Close(frame))) => {
						debug!(%host, ?frame, "websocket closed by peer");
						let _ = evt_tx.send(WsEvent::Closed(frame.map(|f| f.reason.to_string()))).await;
						break;
					}
					Some(Ok(_)) => {}
					Some(Err(e)) => {
						warn!(%host, error = %e, "websocket read failed");
						let _ = evt_tx.send(WsEvent::Closed(Some(e.to_string()))).await;
						break;
					}
					None => {
						let _ = evt_tx.send(WsEvent::Closed(None)).await;
						break;
					}
				}
			}
		}
	});

	Ok(WsSession::from_channels(cmd_tx, evt_rx))
}
