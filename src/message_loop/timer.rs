use super::{MessageLoop, TimerCallback};
use std::{
	sync::{Arc, Mutex},
	time::Duration,
};

/// A repeating or one-shot delay bound to a [`MessageLoop`].
///
/// The callback runs on the loop thread. Dropping a timer stops it.
///
/// ```no_run
/// use lighthouse::{MessageLoop, Timer};
/// use std::time::Duration;
///
/// let message_loop = MessageLoop::new();
///
/// let stopper = message_loop.clone();
/// let timer = Timer::new(&message_loop, move || stopper.stop(0));
/// timer.start_once(Duration::from_secs(1));
///
/// message_loop.run();
/// ```
pub struct Timer {
	message_loop: MessageLoop,
	id: u64,
	callback: TimerCallback,
}
impl Timer {
	pub fn new<F>(message_loop: &MessageLoop, callback: F) -> Self
	where
		F: FnMut() + Send + 'static,
	{
		Self {
			message_loop: message_loop.clone(),
			id: message_loop.next_timer_id(),
			callback: Arc::new(Mutex::new(Box::new(callback))),
		}
	}

	/// Fires every `interval`, the first time one `interval` from now.
	///
	/// Firings are scheduled relative to the previous scheduled firing rather than to when the callback
	/// actually ran, so a slow callback does not push later firings back. Restarting an active timer
	/// reschedules it from now.
	pub fn start(&self, interval: Duration) {
		self.message_loop.start_timer(self.id, interval, false, self.callback.clone());
	}

	/// Fires once, `delay` from now, then deactivates.
	pub fn start_once(&self, delay: Duration) {
		self.message_loop.start_timer(self.id, delay, true, self.callback.clone());
	}

	/// Returns whether the timer was active. Stopping an inactive timer does nothing.
	pub fn stop(&self) -> bool {
		self.message_loop.stop_timer(self.id)
	}

	pub fn is_active(&self) -> bool {
		self.message_loop.is_timer_active(self.id)
	}

	#[inline(always)]
	pub fn message_loop(&self) -> &MessageLoop {
		&self.message_loop
	}
}
impl Drop for Timer {
	fn drop(&mut self) {
		self.stop();
	}
}
impl std::fmt::Debug for Timer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Timer").field("id", &self.id).field("active", &self.is_active()).finish()
	}
}
