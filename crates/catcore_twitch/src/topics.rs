#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

/// Per-channel agent that can be asked to start or stop delivering a topic.
///
/// Both calls must return promptly; network work is spawned by the agent.
pub trait TopicListener: Send + Sync + 'static {
	fn request_topic_listening(&self, topic: &str);
	fn request_topic_unlistening(&self, topic: &str);
}

/// Agents keyed by channel id.
pub type AgentMap<A> = RwLock<HashMap<String, Arc<A>>>;

/// Set of topics that currently have at least one registered callback.
///
/// Lock order is always agent map first, then the topic set.
#[derive(Debug)]
pub struct TopicRegistry {
	topics: Mutex<HashSet<String>>,
	channel_exclusive: HashSet<&'static str>,
}

impl TopicRegistry {
	/// `channel_exclusive` topics are only ever requested on the self channel agent.
	pub fn new(channel_exclusive: &[&'static str]) -> Self {
		Self {
			topics: Mutex::new(HashSet::new()),
			channel_exclusive: channel_exclusive.iter().copied().collect(),
		}
	}

	pub fn is_channel_exclusive(&self, topic: &str) -> bool {
		self.channel_exclusive.contains(topic)
	}

	pub fn contains(&self, topic: &str) -> bool {
		self.topics.lock().contains(topic)
	}

	pub fn topics(&self) -> Vec<String> {
		let mut out: Vec<String> = self.topics.lock().iter().cloned().collect();
		out.sort();
		out
	}

	/// Adds `topic` and broadcasts a listen request. Returns false when it was already present.
	pub fn register<A: TopicListener>(&self, topic: &str, agents: &AgentMap<A>, self_channel: Option<&str>) -> bool {
		let agents = agents.read();
		let mut topics = self.topics.lock();
		if !topics.insert(topic.to_string()) {
			warn!(%topic, "topic was already requested by previous callbacks");
			return false;
		}

		debug!(%topic, agents = agents.len(), "broadcasting topic listen");
		for agent in self.targets(topic, &agents, self_channel) {
			agent.request_topic_listening(topic);
		}
		true
	}

	/// Removes `topic` and broadcasts an unlisten request. Returns false when it was not present.
	pub fn unregister<A: TopicListener>(&self, topic: &str, agents: &AgentMap<A>, self_channel: Option<&str>) -> bool {
		let agents = agents.read();
		let mut topics = self.topics.lock();
		if !topics.remove(topic) {
			return false;
		}

		debug!(%topic, agents = agents.len(), "broadcasting topic unlisten");
		for agent in self.targets(topic, &agents, self_channel) {
			agent.request_topic_unlistening(topic);
		}
		true
	}

	/// Replays every current topic onto a freshly created agent.
	///
	/// Callers hold the agent map lock while inserting, so this only takes the topic lock.
	pub fn send_all_current_topics_to_agent<A: TopicListener>(&self, channel_id: &str, agent: &A, self_channel: Option<&str>) {
		let is_self_agent = self_channel == Some(channel_id);
		let topics = self.topics.lock();
		for topic in topics.iter() {
			if is_self_agent || !self.is_channel_exclusive(topic) {
				agent.request_topic_listening(topic);
			}
		}
	}

	fn targets<'a, A>(&self, topic: &str, agents: &'a HashMap<String, Arc<A>>, self_channel: Option<&str>) -> Vec<&'a Arc<A>> {
		if !self.is_channel_exclusive(topic) {
			return agents.values().collect();
		}
		self_channel.and_then(|id| agents.get(id)).into_iter().collect()
	}
}
