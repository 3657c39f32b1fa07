use std::{collections::HashMap, time::SystemTime};

/// Remembers when each notification type was last announced, so that a restarted process neither floods
/// the network with announcements nor leaves stale ones from its previous life cached by control points.
///
/// Stamps are wall-clock times because they are meant to outlive the process.
pub trait AnnounceStore: Send {
	fn last_announced(&self, notification_type: &str) -> Option<SystemTime>;
	fn set_last_announced(&mut self, notification_type: &str, at: SystemTime);
	fn remove(&mut self, notification_type: &str);
}

#[derive(Default, Debug, Clone)]
/// An [`AnnounceStore`] that lives only as long as the process
pub struct MemoryStore(HashMap<String, SystemTime>);
impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}
impl AnnounceStore for MemoryStore {
	fn last_announced(&self, notification_type: &str) -> Option<SystemTime> {
		self.0.get(notification_type).copied()
	}

	fn set_last_announced(&mut self, notification_type: &str, at: SystemTime) {
		self.0.insert(notification_type.to_string(), at);
	}

	fn remove(&mut self, notification_type: &str) {
		self.0.remove(notification_type);
	}
}

/// Lets a store be shared with the code that persists it
impl<S: AnnounceStore> AnnounceStore for std::sync::Arc<std::sync::Mutex<S>> {
	fn last_announced(&self, notification_type: &str) -> Option<SystemTime> {
		crate::util::lock(&**self).last_announced(notification_type)
	}

	fn set_last_announced(&mut self, notification_type: &str, at: SystemTime) {
		crate::util::lock(&**self).set_last_announced(notification_type, at)
	}

	fn remove(&mut self, notification_type: &str) {
		crate::util::lock(&**self).remove(notification_type)
	}
}
