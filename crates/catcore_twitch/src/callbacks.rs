#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;

/// Subscriber for a typed event keyed by channel id.
pub type Callback<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

/// Outcome of adding or removing a callback; drives lazy topic registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
	/// The set went from empty to non-empty (add) or back to empty (remove).
	Edge,
	Unchanged,
	Duplicate,
	NotFound,
}

/// Multicast set of callbacks for one event kind.
pub struct CallbackSet<T> {
	entries: Mutex<Vec<Callback<T>>>,
}

impl<T> Default for CallbackSet<T> {
	fn default() -> Self {
		Self {
			entries: Mutex::new(Vec::new()),
		}
	}
}

impl<T> CallbackSet<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds `cb`; the same `Arc` twice is rejected as a duplicate.
	pub fn add(&self, cb: Callback<T>) -> Transition {
		let mut entries = self.entries.lock();
		if entries.iter().any(|e| Arc::ptr_eq(e, &cb)) {
			return Transition::Duplicate;
		}
		entries.push(cb);
		if entries.len() == 1 {
			Transition::Edge
		} else {
			Transition::Unchanged
		}
	}

	pub fn remove(&self, cb: &Callback<T>) -> Transition {
		let mut entries = self.entries.lock();
		let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(e, cb)) else {
			return Transition::NotFound;
		};
		entries.remove(pos);
		if entries.is_empty() {
			Transition::Edge
		} else {
			Transition::Unchanged
		}
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	/// Invokes every callback outside the lock so callbacks may add/remove.
	pub fn notify(&self, channel_id: &str, value: &T) {
		let snapshot: Vec<Callback<T>> = self.entries.lock().clone();
		for cb in snapshot {
			cb(channel_id, value);
		}
	}
}
