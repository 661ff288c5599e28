#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use catcore_domain::{ChannelId, ChannelRosterEntry, RosterDiff};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

/// Tracked channels keyed by id; observers receive a diff on every change.
#[derive(Debug)]
pub struct ChannelRoster {
	entries: RwLock<BTreeMap<ChannelId, ChannelRosterEntry>>,
	updates: broadcast::Sender<RosterDiff>,
}

impl Default for ChannelRoster {
	fn default() -> Self {
		Self::new(Vec::new())
	}
}

impl ChannelRoster {
	pub fn new(initial: Vec<ChannelRosterEntry>) -> Self {
		let (updates, _) = broadcast::channel(64);
		Self {
			entries: RwLock::new(initial.into_iter().map(|e| (e.id.clone(), e)).collect()),
			updates,
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<RosterDiff> {
		self.updates.subscribe()
	}

	pub fn active_channels(&self) -> Vec<ChannelRosterEntry> {
		self.entries.read().values().cloned().collect()
	}

	pub fn active_channel_ids(&self) -> Vec<ChannelId> {
		self.entries.read().keys().cloned().collect()
	}

	pub fn login_for(&self, id: &str) -> Option<String> {
		self.entries
			.read()
			.values()
			.find(|e| e.id.as_str() == id)
			.map(|e| e.login.clone())
	}

	/// Replaces the roster and broadcasts the resulting diff (nothing when empty).
	///
	/// A login change for a known id shows up as disable + enable.
	pub fn set_channels(&self, channels: Vec<ChannelRosterEntry>) -> RosterDiff {
		let next: BTreeMap<ChannelId, ChannelRosterEntry> = channels.into_iter().map(|e| (e.id.clone(), e)).collect();

		let diff = {
			let mut entries = self.entries.write();
			let mut diff = RosterDiff::default();
			for (id, old) in entries.iter() {
				if next.get(id) != Some(old) {
					diff.disabled.push(old.clone());
				}
			}
			for (id, new) in next.iter() {
				if entries.get(id) != Some(new) {
					diff.enabled.push(new.clone());
				}
			}
			*entries = next;
			diff
		};

		if !diff.is_empty() {
			info!(enabled = diff.enabled.len(), disabled = diff.disabled.len(), "channel roster updated");
			let _ = self.updates.send(diff.clone());
		}
		diff
	}
}
