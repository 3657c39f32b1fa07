//! A single-threaded cooperative scheduler.
//!
//! A [`MessageLoop`] runs posted callables and [`Timer`] callbacks one at a time on whichever thread
//! calls [`MessageLoop::run`]. Posted callables always run before timers and in the order they were
//! posted; at most one due timer is serviced per iteration.
//!
//! Callables and timer callbacks run with the loop's lock released, so they may freely post, send to
//! other loops, start or stop timers (including their own) and stop the loop.

use crate::util::lock;
use std::{
	collections::{BTreeMap, VecDeque},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Condvar, Mutex, PoisonError,
	},
	time::{Duration, Instant},
};

mod timer;
pub use timer::Timer;

type Message = Box<dyn FnOnce() + Send>;

/// What "never" is clamped to for durations that do not fit in an [`Instant`]
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn later(instant: Instant, duration: Duration) -> Instant {
	instant
		.checked_add(duration)
		.or_else(|| instant.checked_add(FAR_FUTURE))
		.unwrap_or(instant)
}
type TimerCallback = Arc<Mutex<Box<dyn FnMut() + Send>>>;

struct ActiveTimer {
	next: Instant,
	interval: Duration,
	once: bool,
	callback: TimerCallback,
}

#[derive(Default)]
struct LoopState {
	messages: VecDeque<Message>,
	timers: BTreeMap<u64, ActiveTimer>,
	stopped: bool,
	exit_code: i32,
}
impl LoopState {
	fn take_stop(&mut self) -> Option<i32> {
		if self.stopped {
			self.stopped = false;
			Some(self.exit_code)
		} else {
			None
		}
	}

	/// Picks the most overdue timer, if any is due.
	///
	/// One-shot timers are deactivated before their callback is handed out; repeating timers are
	/// advanced by exactly one interval so that late firings do not accumulate drift.
	fn take_due_timer(&mut self, now: Instant) -> Option<TimerCallback> {
		let id = self
			.timers
			.iter()
			.filter(|(_, timer)| timer.next <= now)
			.min_by_key(|(_, timer)| timer.next)
			.map(|(id, _)| *id)?;

		if self.timers.get(&id)?.once {
			return self.timers.remove(&id).map(|timer| timer.callback);
		}

		let timer = self.timers.get_mut(&id)?;
		timer.next = later(timer.next, timer.interval);
		Some(timer.callback.clone())
	}

	fn next_deadline(&self) -> Option<Instant> {
		self.timers.values().map(|timer| timer.next).min()
	}
}

struct LoopInner {
	state: Mutex<LoopState>,
	wake: Condvar,
	next_timer_id: AtomicU64,
}

/// A handle to a message loop.
///
/// Handles are cheap to clone and every clone refers to the same loop, so a handle can be moved into
/// another thread to [`post`](Self::post) or [`send`](Self::send) work back to the loop thread.
///
/// Every [`Timer`] keeps a handle to its loop, so a loop can never be torn down while a timer is still
/// registered with it.
#[derive(Clone)]
pub struct MessageLoop(Arc<LoopInner>);
impl MessageLoop {
	pub fn new() -> Self {
		Self(Arc::new(LoopInner {
			state: Mutex::new(LoopState::default()),
			wake: Condvar::new(),
			next_timer_id: AtomicU64::new(0),
		}))
	}

	/// Queues `message` to be run on the loop thread after everything already queued.
	pub fn post<F>(&self, message: F)
	where
		F: FnOnce() + Send + 'static,
	{
		lock(&self.0.state).messages.push_back(Box::new(message));
		self.0.wake.notify_one();
	}

	/// Runs `message` on the loop thread and blocks the calling thread until it has finished,
	/// handing back its return value.
	///
	/// Must not be called from the loop's own thread, and will block forever if the loop is never run
	/// again.
	pub fn send<F, R>(&self, message: F) -> R
	where
		F: FnOnce() -> R + Send + 'static,
		R: Send + 'static,
	{
		let processed = Arc::new((Mutex::new(None), Condvar::new()));

		let signal = processed.clone();
		self.post(move || {
			let result = message();
			let (slot, send_processed) = &*signal;
			*lock(slot) = Some(result);
			send_processed.notify_all();
		});

		let (slot, send_processed) = &*processed;
		let mut slot = lock(slot);
		loop {
			if let Some(result) = slot.take() {
				return result;
			}
			slot = send_processed.wait(slot).unwrap_or_else(PoisonError::into_inner);
		}
	}

	/// Runs the loop on the current thread until [`stop`](Self::stop) is observed, returning the exit code.
	///
	/// A stop requested before `run` was entered makes it return straight away. Observing a stop
	/// consumes it, so the loop can be run again afterwards.
	pub fn run(&self) -> i32 {
		let mut state = lock(&self.0.state);
		loop {
			if let Some(exit_code) = state.take_stop() {
				return exit_code;
			}

			if let Some(message) = state.messages.pop_front() {
				drop(state);
				message();
				state = lock(&self.0.state);
				continue;
			}

			let now = Instant::now();
			if let Some(callback) = state.take_due_timer(now) {
				drop(state);
				{
					let mut callback = lock(&*callback);
					(&mut **callback)();
				}
				state = lock(&self.0.state);
				continue;
			}

			state = match state.next_deadline() {
				Some(deadline) => {
					self.0
						.wake
						.wait_timeout(state, deadline.saturating_duration_since(now))
						.unwrap_or_else(PoisonError::into_inner)
						.0
				}
				None => self.0.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
			};
		}
	}

	/// Asks the loop to exit with `exit_code` once the callable currently executing (if any) returns.
	///
	/// Thread-safe and idempotent; if called more than once before the loop notices, the last exit code wins.
	pub fn stop(&self, exit_code: i32) {
		{
			let mut state = lock(&self.0.state);
			state.stopped = true;
			state.exit_code = exit_code;
		}
		self.0.wake.notify_all();
	}

	/// Runs posted callables (but not timers) on the current thread for up to `duration`.
	///
	/// Returns `Some(exit_code)` if a stop was observed before the deadline, otherwise `None`. A
	/// `duration` too large to be represented as a deadline pumps until stopped.
	pub fn process_events(&self, duration: Duration) -> Option<i32> {
		let deadline = Instant::now().checked_add(duration);

		let mut state = lock(&self.0.state);
		loop {
			if let Some(exit_code) = state.take_stop() {
				return Some(exit_code);
			}

			let now = Instant::now();
			if deadline.map_or(false, |deadline| now >= deadline) {
				return None;
			}

			if let Some(message) = state.messages.pop_front() {
				drop(state);
				message();
				state = lock(&self.0.state);
				continue;
			}

			state = match deadline {
				Some(deadline) => {
					self.0
						.wake
						.wait_timeout(state, deadline - now)
						.unwrap_or_else(PoisonError::into_inner)
						.0
				}
				None => self.0.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
			};
		}
	}

	fn next_timer_id(&self) -> u64 {
		self.0.next_timer_id.fetch_add(1, Ordering::Relaxed)
	}

	fn start_timer(&self, id: u64, interval: Duration, once: bool, callback: TimerCallback) {
		lock(&self.0.state).timers.insert(
			id,
			ActiveTimer {
				next: later(Instant::now(), interval),
				interval,
				once,
				callback,
			},
		);

		// The loop may be sleeping towards a later deadline
		self.0.wake.notify_all();
	}

	fn stop_timer(&self, id: u64) -> bool {
		lock(&self.0.state).timers.remove(&id).is_some()
	}

	fn is_timer_active(&self, id: u64) -> bool {
		lock(&self.0.state).timers.contains_key(&id)
	}
}
impl Default for MessageLoop {
	fn default() -> Self {
		Self::new()
	}
}
impl std::fmt::Debug for MessageLoop {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = lock(&self.0.state);
		f.debug_struct("MessageLoop")
			.field("messages", &state.messages.len())
			.field("timers", &state.timers.len())
			.field("stopped", &state.stopped)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::mpsc;

	#[test]
	fn posted_messages_run_in_order() {
		for n in [0, 1, 2, 17, 256] {
			let message_loop = MessageLoop::new();
			let order = Arc::new(Mutex::new(Vec::new()));

			for i in 0..n {
				let order = order.clone();
				message_loop.post(move || order.lock().unwrap().push(i));
			}

			let stopper = message_loop.clone();
			message_loop.post(move || stopper.stop(0));

			assert_eq!(message_loop.run(), 0);
			assert_eq!(*order.lock().unwrap(), (0..n).collect::<Vec<_>>());
		}
	}

	#[test]
	fn run_returns_exit_code() {
		let message_loop = MessageLoop::new();
		let stopper = message_loop.clone();
		message_loop.post(move || stopper.stop(123));
		assert_eq!(message_loop.run(), 123);
	}

	#[test]
	fn stop_before_run_is_honoured_once() {
		let message_loop = MessageLoop::new();
		message_loop.stop(7);
		assert_eq!(message_loop.run(), 7);

		let stopper = message_loop.clone();
		message_loop.post(move || stopper.stop(8));
		assert_eq!(message_loop.run(), 8);
	}

	#[test]
	fn messages_after_stop_wait_for_next_run() {
		let message_loop = MessageLoop::new();
		let ran = Arc::new(Mutex::new(Vec::new()));

		let stopper = message_loop.clone();
		message_loop.post(move || stopper.stop(1));
		{
			let ran = ran.clone();
			message_loop.post(move || ran.lock().unwrap().push("late"));
		}

		assert_eq!(message_loop.run(), 1);
		assert!(ran.lock().unwrap().is_empty());

		let stopper = message_loop.clone();
		message_loop.post(move || stopper.stop(2));
		assert_eq!(message_loop.run(), 2);
		assert_eq!(*ran.lock().unwrap(), ["late"]);
	}

	#[test]
	fn messages_posted_from_callbacks_run() {
		let message_loop = MessageLoop::new();
		let inner = message_loop.clone();
		message_loop.post(move || {
			let stopper = inner.clone();
			inner.post(move || stopper.stop(42));
		});
		assert_eq!(message_loop.run(), 42);
	}

	#[test]
	fn send_blocks_until_done() {
		let message_loop = MessageLoop::new();
		let (done_tx, done_rx) = mpsc::channel();

		let remote = message_loop.clone();
		let sender = std::thread::spawn(move || {
			let value = Arc::new(Mutex::new(0));
			let inner = value.clone();
			let returned = remote.send(move || {
				std::thread::sleep(Duration::from_millis(20));
				*inner.lock().unwrap() = 99;
				"done"
			});
			let observed = *value.lock().unwrap();
			done_tx.send((returned, observed)).unwrap();
			remote.stop(0);
		});

		assert_eq!(message_loop.run(), 0);
		sender.join().unwrap();
		assert_eq!(done_rx.recv_timeout(Duration::from_secs(1)).unwrap(), ("done", 99));
	}

	#[test]
	fn process_events_respects_deadline() {
		let message_loop = MessageLoop::new();
		let ran = Arc::new(Mutex::new(0));
		for _ in 0..3 {
			let ran = ran.clone();
			message_loop.post(move || *ran.lock().unwrap() += 1);
		}

		let start = Instant::now();
		assert_eq!(message_loop.process_events(Duration::from_millis(30)), None);
		assert!(start.elapsed() >= Duration::from_millis(30));
		assert_eq!(*ran.lock().unwrap(), 3);
	}

	#[test]
	fn process_events_ignores_timers() {
		let message_loop = MessageLoop::new();
		let fired = Arc::new(Mutex::new(false));
		let timer = {
			let fired = fired.clone();
			Timer::new(&message_loop, move || *fired.lock().unwrap() = true)
		};
		timer.start_once(Duration::ZERO);

		assert_eq!(message_loop.process_events(Duration::from_millis(10)), None);
		assert!(!*fired.lock().unwrap());
		assert!(timer.is_active());
	}

	#[test]
	fn process_events_observes_stop() {
		let message_loop = MessageLoop::new();
		let stopper = message_loop.clone();
		message_loop.post(move || stopper.stop(5));

		let start = Instant::now();
		assert_eq!(message_loop.process_events(Duration::from_secs(10)), Some(5));
		assert!(start.elapsed() < Duration::from_secs(5));
	}

	#[test]
	fn process_events_without_deadline() {
		let message_loop = MessageLoop::new();
		let stopper = message_loop.clone();
		let poster = std::thread::spawn(move || {
			std::thread::sleep(Duration::from_millis(20));
			stopper.post({
				let stopper = stopper.clone();
				move || stopper.stop(3)
			});
		});

		assert_eq!(message_loop.process_events(Duration::MAX), Some(3));
		poster.join().unwrap();
	}

	#[test]
	fn timers_far_in_the_future() {
		let message_loop = MessageLoop::new();
		let never = Timer::new(&message_loop, || panic!("fired"));
		never.start_once(Duration::MAX);
		assert!(never.is_active());

		let repeating = Timer::new(&message_loop, || {});
		repeating.start(Duration::MAX);

		let stopper = message_loop.clone();
		let stop = Timer::new(&message_loop, move || stopper.stop(0));
		stop.start_once(Duration::from_millis(10));

		assert_eq!(message_loop.run(), 0);
		assert!(never.is_active());
		assert!(repeating.is_active());
	}

	#[test]
	fn due_timers_take_turns() {
		let message_loop = MessageLoop::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		let timers = ["a", "b"]
			.into_iter()
			.map(|name| {
				let order = order.clone();
				let stopper = message_loop.clone();
				Timer::new(&message_loop, move || {
					let mut order = order.lock().unwrap();
					order.push(name);
					if order.len() == 6 {
						stopper.stop(0);
					}
				})
			})
			.collect::<Vec<_>>();

		for timer in &timers {
			timer.start(Duration::from_millis(1));
		}

		// Let both fall well behind so that both are due on every iteration
		std::thread::sleep(Duration::from_millis(20));
		message_loop.run();

		let order = order.lock().unwrap();
		assert_eq!(order.iter().filter(|name| **name == "a").count(), 3);
		assert_eq!(order.iter().filter(|name| **name == "b").count(), 3);
	}
}
