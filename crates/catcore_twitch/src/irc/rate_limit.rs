#![forbid(unsafe_code)]

//! Sliding-window send limiter for the chat socket.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

pub const WINDOW: Duration = Duration::from_secs(32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitTier {
	Normal,
	/// Own channel, or a channel where we hold broadcaster/moderator.
	Relaxed,
}

impl RateLimitTier {
	pub const fn capacity(self) -> usize {
		match self {
			RateLimitTier::Normal => 20,
			RateLimitTier::Relaxed => 100,
		}
	}

	/// Minimum spacing between two sends to the same channel.
	pub const fn channel_spacing(self) -> Duration {
		match self {
			RateLimitTier::Normal => Duration::from_millis(1250),
			RateLimitTier::Relaxed => Duration::from_millis(50),
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			RateLimitTier::Normal => "normal",
			RateLimitTier::Relaxed => "relaxed",
		}
	}
}

/// Send timestamps inside the trailing window plus the last send per channel.
#[derive(Debug, Default)]
pub struct SlidingWindow {
	sent: VecDeque<Instant>,
	last_by_channel: HashMap<String, Instant>,
}

impl SlidingWindow {
	pub fn new() -> Self {
		Self::default()
	}

	/// Drops timestamps whose window has fully elapsed.
	pub fn prune(&mut self, now: Instant) {
		while let Some(front) = self.sent.front() {
			if *front + WINDOW <= now {
				self.sent.pop_front();
			} else {
				break;
			}
		}
	}

	pub fn in_window(&self) -> usize {
		self.sent.len()
	}

	pub fn has_capacity(&self, tier: RateLimitTier) -> bool {
		self.sent.len() < tier.capacity()
	}

	/// Time until one more send fits under `tier`; zero when it already does.
	pub fn time_until_capacity(&self, tier: RateLimitTier, now: Instant) -> Duration {
		let cap = tier.capacity();
		if self.sent.len() < cap {
			return Duration::ZERO;
		}
		let oldest_blocking = self.sent[self.sent.len() - cap];
		(oldest_blocking + WINDOW).saturating_duration_since(now)
	}

	/// Remaining per-channel spacing before the next send to `channel_id`.
	pub fn channel_delay(&self, channel_id: &str, tier: RateLimitTier, now: Instant) -> Duration {
		self.last_by_channel
			.get(channel_id)
			.map(|last| (*last + tier.channel_spacing()).saturating_duration_since(now))
			.unwrap_or(Duration::ZERO)
	}

	pub fn record(&mut self, channel_id: &str, now: Instant) {
		self.sent.push_back(now);
		self.last_by_channel.insert(channel_id.to_string(), now);
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn capacity_frees_once_the_oldest_send_leaves_the_window() {
		let t0 = Instant::now();
		let mut w = SlidingWindow::new();
		for i in 0..20 {
			w.record("1", t0 + Duration::from_secs(i));
		}
		let now = t0 + Duration::from_secs(20);
		assert!(!w.has_capacity(RateLimitTier::Normal));
		assert!(w.has_capacity(RateLimitTier::Relaxed));
		assert_eq!(w.time_until_capacity(RateLimitTier::Normal, now), Duration::from_secs(12));

		w.prune(t0 + WINDOW);
		assert_eq!(w.in_window(), 19);
		assert!(w.has_capacity(RateLimitTier::Normal));
	}

	#[test]
	fn channel_spacing_depends_on_tier() {
		let t0 = Instant::now();
		let mut w = SlidingWindow::new();
		w.record("1", t0);
		let later = t0 + Duration::from_millis(1000);
		assert_eq!(w.channel_delay("1", RateLimitTier::Normal, later), Duration::from_millis(250));
		assert_eq!(w.channel_delay("1", RateLimitTier::Relaxed, later), Duration::ZERO);
		assert_eq!(w.channel_delay("2", RateLimitTier::Normal, later), Duration::ZERO);
	}

	proptest! {
		/// A sender that waits whenever the limiter says so never exceeds capacity in any window.
		#[test]
		fn simulated_bursts_stay_within_capacity(
			gaps_ms in proptest::collection::vec(0u64..3_000, 1..150),
			relaxed in any::<bool>(),
		) {
			let tier = if relaxed { RateLimitTier::Relaxed } else { RateLimitTier::Normal };
			let t0 = Instant::now();
			let mut now = t0;
			let mut w = SlidingWindow::new();
			let mut sends = Vec::new();

			for gap in gaps_ms {
				now += Duration::from_millis(gap);
				w.prune(now);
				if !w.has_capacity(tier) {
					let wait = w.time_until_capacity(tier, now);
					prop_assert!(wait > Duration::ZERO);
					now += wait;
					w.prune(now);
				}
				prop_assert!(w.has_capacity(tier));
				w.record("1", now);
				sends.push(now);
			}

			for (i, t) in sends.iter().enumerate() {
				let in_trailing = sends[..=i].iter().filter(|s| **s + WINDOW > *t).count();
				prop_assert!(in_trailing <= tier.capacity());
			}
		}
	}
}
