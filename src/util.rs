use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, carrying on with the inner value if a callback panicked while holding it.
#[inline(always)]
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The default `SERVER` header: `<os>/<arch>, UPnP/1.0, <product>/<version>`
pub(crate) fn default_server_id() -> String {
	format!(
		"{}/{}, UPnP/1.0, {}/{}",
		std::env::consts::OS,
		std::env::consts::ARCH,
		env!("CARGO_PKG_NAME"),
		env!("CARGO_PKG_VERSION")
	)
}
