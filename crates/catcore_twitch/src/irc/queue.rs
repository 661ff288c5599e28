#![forbid(unsafe_code)]

//! Outbound chat queue and its rate-limited drain worker.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::rate_limit::{RateLimitTier, SlidingWindow};
use crate::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
	pub channel_id: String,
	pub line: String,
}

/// Where the worker hands messages off, and how it classifies their target.
#[async_trait]
pub trait OutboundSink: Send + Sync + 'static {
	fn tier(&self, channel_id: &str) -> RateLimitTier;
	async fn deliver(&self, message: &OutboundMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct SendQueue {
	items: Mutex<VecDeque<OutboundMessage>>,
	wake: Notify,
	limiter: Mutex<SlidingWindow>,
}

impl SendQueue {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn enqueue(&self, message: OutboundMessage) {
		self.items.lock().push_back(message);
		self.wake.notify_one();
	}

	pub fn len(&self) -> usize {
		self.items.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.lock().is_empty()
	}

	pub fn clear(&self) {
		self.items.lock().clear();
	}

	fn head_channel(&self) -> Option<String> {
		self.items.lock().front().map(|m| m.channel_id.clone())
	}

	/// When the head message will fit under its tier; `None` if the queue is empty.
	fn capacity_deadline(&self, sink: &dyn OutboundSink) -> Option<Instant> {
		let channel = self.head_channel()?;
		let tier = sink.tier(&channel);
		let now = Instant::now();
		let mut limiter = self.limiter.lock();
		limiter.prune(now);
		Some(now + limiter.time_until_capacity(tier, now))
	}
}

/// Drains `queue` in order until `cancel` fires.
///
/// Each send waits for global capacity under the head message's tier and for the
/// per-channel spacing. Sent lines are counted in the trailing window.
pub async fn run_worker(queue: Arc<SendQueue>, sink: Arc<dyn OutboundSink>, cancel: CancelToken) {
	debug!("chat send worker started");
	loop {
		drain(&queue, sink.as_ref(), &cancel).await;
		if cancel.is_cancelled() {
			break;
		}

		let deadline = queue.capacity_deadline(sink.as_ref());
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = queue.wake.notified() => {}
			_ = async {
				match deadline {
					Some(at) => tokio::time::sleep_until(at).await,
					None => pending::<()>().await,
				}
			} => {}
		}
	}
	debug!("chat send worker stopped");
}

async fn drain(queue: &SendQueue, sink: &dyn OutboundSink, cancel: &CancelToken) {
	loop {
		let Some(channel) = queue.head_channel() else {
			return;
		};
		let tier = sink.tier(&channel);

		let spacing = {
			let now = Instant::now();
			let mut limiter = queue.limiter.lock();
			limiter.prune(now);
			if !limiter.has_capacity(tier) {
				metrics::counter!("catcore_irc_rate_limited_total", "tier" => tier.as_str()).increment(1);
				debug!(tier = tier.as_str(), in_window = limiter.in_window(), "send capacity reached; parking");
				return;
			}
			limiter.channel_delay(&channel, tier, now)
		};

		if !spacing.is_zero() {
			tokio::select! {
				_ = cancel.cancelled() => return,
				_ = tokio::time::sleep(spacing) => {}
			}
		}

		if cancel.is_cancelled() {
			return;
		}
		let Some(message) = queue.items.lock().pop_front() else {
			return;
		};

		if let Err(e) = sink.deliver(&message).await {
			warn!(channel_id = %message.channel_id, error = %e, "failed to send chat message");
		}
		queue.limiter.lock().record(&message.channel_id, Instant::now());
		metrics::counter!("catcore_irc_messages_sent_total", "tier" => tier.as_str()).increment(1);
	}
}
