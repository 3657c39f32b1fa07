use super::{engine::Engine, nodes::Node, HttpServer, Transport, SEARCH_UPDATE_DELAY};
use crate::{util::lock, MessageLoop, Timer};
use std::{
	net::{Ipv4Addr, SocketAddr},
	sync::{Arc, Mutex, Weak},
	time::{Duration, SystemTime},
};

type SearchUpdated = Box<dyn FnMut() + Send>;

struct Shared {
	engine: Mutex<Engine>,
	transport: Arc<dyn Transport>,
	announce_interval: Duration,
	publish_delay: Duration,

	/// Re-announces everything every half publish time
	announce_timer: Timer,

	/// Announces shortly after a publish
	publish_timer: Timer,

	/// Tells subscribers the node table changed, once it has settled
	update_timer: Timer,

	search_updated: Mutex<Option<SearchUpdated>>,
}
impl Shared {
	fn publish_services(&self) {
		lock(&self.engine).publish_services(&*self.transport, SystemTime::now());
	}

	fn handle_datagram(&self, interface: Ipv4Addr, datagram: &[u8], from: SocketAddr) {
		let changed = lock(&self.engine).handle_datagram(interface, datagram, from, &*self.transport);
		if changed {
			self.update_timer.start_once(SEARCH_UPDATE_DELAY);
		}
	}

	fn search_updated(&self) {
		// Taken out while it runs so that it may replace itself
		let taken = lock(&self.search_updated).take();
		if let Some(mut search_updated) = taken {
			search_updated();
			lock(&self.search_updated).get_or_insert(search_updated);
		}
	}
}

/// An SSDP announcer and client running on a [`MessageLoop`].
///
/// All timer-driven work (periodic announcements, the announcement pass after a publish and search
/// update notifications) runs on the loop thread. Incoming datagrams should be handed to it on the
/// loop thread too, through [`handle_datagram`](Self::handle_datagram) or a [`DatagramHandler`].
///
/// Dropping the server withdraws everything it published.
pub struct SsdpServer(Arc<Shared>);
impl SsdpServer {
	pub(super) fn new(
		message_loop: &MessageLoop,
		engine: Engine,
		transport: Arc<dyn Transport>,
		announce_interval: Duration,
		publish_delay: Duration,
	) -> Self {
		let on_loop = |weak: &Weak<Shared>, f: fn(&Shared)| {
			let weak = weak.clone();
			Timer::new(message_loop, move || {
				if let Some(shared) = weak.upgrade() {
					f(&shared);
				}
			})
		};

		Self(Arc::new_cyclic(|weak| Shared {
			engine: Mutex::new(engine),
			transport,
			announce_interval,
			publish_delay,
			announce_timer: on_loop(weak, Shared::publish_services),
			publish_timer: on_loop(weak, Shared::publish_services),
			update_timer: on_loop(weak, Shared::search_updated),
			search_updated: Mutex::new(None),
		}))
	}

	/// Starts announcing on `interfaces`, replacing any previous ones.
	pub fn initialize(&self, interfaces: impl IntoIterator<Item = Ipv4Addr>) {
		lock(&self.0.engine).initialize(interfaces);
		self.0.announce_timer.start(self.0.announce_interval);
		log::debug!("SSDP announcements every {:?}", self.0.announce_interval);
	}

	/// Publishes `notification_type`, served by `server` at `relative_url` on every interface.
	///
	/// The record is announced after a short delay rather than at the next periodic announcement.
	pub fn publish(&self, notification_type: &str, server: Arc<dyn HttpServer>, relative_url: &str) {
		let published = lock(&self.0.engine).publish(notification_type, server, relative_url, &*self.0.transport, SystemTime::now());
		if published {
			self.0.publish_timer.start_once(self.0.publish_delay);
		}
	}

	/// Announces every published record now.
	pub fn publish_services(&self) {
		self.0.publish_services();
	}

	/// Withdraws every published record and stops announcing.
	pub fn close(&self) {
		self.0.announce_timer.stop();
		self.0.publish_timer.stop();
		self.0.update_timer.stop();
		lock(&self.0.engine).close(&*self.0.transport);
	}

	pub fn handle_datagram(&self, interface: Ipv4Addr, datagram: &[u8], from: SocketAddr) {
		self.0.handle_datagram(interface, datagram, from);
	}

	/// A handle for feeding incoming datagrams to this server from wherever they are received.
	///
	/// The handle does not keep the server alive.
	pub fn datagram_handler(&self) -> DatagramHandler {
		DatagramHandler(Arc::downgrade(&self.0))
	}

	/// Multicasts a search for `search_target` on every interface.
	pub fn search(&self, search_target: &str) {
		lock(&self.0.engine).search(search_target, &*self.0.transport);
	}

	/// The nodes of type `search_target` seen so far, one per device.
	pub fn search_results(&self, search_target: &str) -> Vec<Node> {
		lock(&self.0.engine).search_results(search_target)
	}

	/// Calls `search_updated` on the loop thread whenever the nodes seen on the network change.
	///
	/// Bursts of changes are reported once.
	pub fn on_search_updated<F>(&self, search_updated: F)
	where
		F: FnMut() + Send + 'static,
	{
		*lock(&self.0.search_updated) = Some(Box::new(search_updated));
	}

	#[inline(always)]
	pub fn message_loop(&self) -> &MessageLoop {
		self.0.announce_timer.message_loop()
	}

	/// Runs `f` with the protocol engine, e.g. to inspect the published records.
	pub fn with_engine<F, R>(&self, f: F) -> R
	where
		F: FnOnce(&Engine) -> R,
	{
		f(&lock(&self.0.engine))
	}

	/// Receives datagrams from `transport` and handles them on the loop thread.
	#[cfg(feature = "socket")]
	#[cfg_attr(docsrs, doc(cfg(feature = "socket")))]
	pub fn listen(&self, transport: &crate::socket::UdpTransport) -> Result<crate::socket::ListenerHandle, crate::errors::SocketError> {
		let handler = self.datagram_handler();
		let message_loop = self.message_loop().clone();
		transport.listen(move |interface, datagram, from| {
			let handler = handler.clone();
			message_loop.post(move || {
				handler.handle_datagram(interface, &datagram, from);
			});
		})
	}
}
impl Drop for SsdpServer {
	fn drop(&mut self) {
		self.close();
	}
}

#[derive(Clone)]
/// Feeds incoming datagrams to an [`SsdpServer`] without keeping it alive
pub struct DatagramHandler(Weak<Shared>);
impl DatagramHandler {
	/// Returns `false` if the server is gone.
	pub fn handle_datagram(&self, interface: Ipv4Addr, datagram: &[u8], from: SocketAddr) -> bool {
		match self.0.upgrade() {
			Some(shared) => {
				shared.handle_datagram(interface, datagram, from);
				true
			}
			None => false,
		}
	}
}
