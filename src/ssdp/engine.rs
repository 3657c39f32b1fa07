use super::{
	message::{self, Message, SSDP_ALL},
	nodes::{Node, NodeMemory},
	store::AnnounceStore,
	HttpServer, Transport, CACHE_CONTROL_MARGIN, SEARCH_MX,
};
use crate::{SSDP_PORT, SSDP_V4_IP};
use std::{
	collections::BTreeSet,
	net::{Ipv4Addr, SocketAddr, SocketAddrV4},
	sync::Arc,
	time::{Duration, SystemTime},
};

/// A resource advertised on every interface
#[derive(Clone)]
struct Record {
	notification_type: String,
	server: Arc<dyn HttpServer>,
	relative_url: String,
}
impl Record {
	fn is(&self, notification_type: &str, server: &Arc<dyn HttpServer>, relative_url: &str) -> bool {
		self.notification_type == notification_type
			&& Arc::as_ptr(&self.server) as *const () == Arc::as_ptr(server) as *const ()
			&& self.relative_url == relative_url
	}

	fn location(&self, interface: Ipv4Addr, port: u16) -> String {
		format!("http://{interface}:{port}{}", self.relative_url)
	}
}

#[derive(Clone, Debug)]
pub(super) struct EngineConfig {
	pub(super) uuid: String,
	pub(super) server_id: String,
	pub(super) publish_time: Duration,
	pub(super) retransmits: u8,
}

/// The SSDP protocol state machine, without any notion of time passing by itself.
///
/// The engine keeps the published records and the nodes seen on the network, and reacts to the calls
/// made into it by sending datagrams through a [`Transport`]. Something else has to call
/// [`publish_services`](Self::publish_services) periodically and feed it incoming datagrams;
/// [`SsdpServer`](super::SsdpServer) does both on a [`MessageLoop`](crate::MessageLoop).
pub struct Engine {
	config: EngineConfig,
	interfaces: Vec<Ipv4Addr>,
	records: Vec<Record>,
	nodes: NodeMemory,
	store: Option<Box<dyn AnnounceStore>>,
}
impl Engine {
	pub(super) fn new(config: EngineConfig, store: Option<Box<dyn AnnounceStore>>) -> Self {
		Self {
			config,
			interfaces: Vec::new(),
			records: Vec::new(),
			nodes: NodeMemory::default(),
			store,
		}
	}

	#[inline(always)]
	pub fn uuid(&self) -> &str {
		&self.config.uuid
	}

	#[inline(always)]
	pub fn interfaces(&self) -> &[Ipv4Addr] {
		&self.interfaces
	}

	/// `(notification type, relative URL)` of every published record
	pub fn published(&self) -> impl Iterator<Item = (&str, &str)> {
		self.records.iter().map(|record| (record.notification_type.as_str(), record.relative_url.as_str()))
	}

	/// Seconds control points may cache an announcement for
	pub fn max_age(&self) -> u32 {
		(self.config.publish_time.as_secs() + CACHE_CONTROL_MARGIN).try_into().unwrap_or(u32::MAX)
	}

	/// Replaces the interfaces announcements are made on.
	pub fn initialize(&mut self, interfaces: impl IntoIterator<Item = Ipv4Addr>) {
		let mut seen = BTreeSet::new();
		self.interfaces = interfaces.into_iter().filter(|interface| seen.insert(*interface)).collect();
		log::debug!("SSDP interfaces: {:?}", self.interfaces);
	}

	/// Registers a record. Publishing a record that is already published does nothing and returns `false`.
	///
	/// Nothing is announced yet; that happens on the next [`publish_services`](Self::publish_services).
	pub fn publish(
		&mut self,
		notification_type: &str,
		server: Arc<dyn HttpServer>,
		relative_url: &str,
		transport: &dyn Transport,
		now: SystemTime,
	) -> bool {
		let relative_url = if relative_url.starts_with('/') {
			relative_url.to_string()
		} else {
			format!("/{relative_url}")
		};

		if self.records.iter().any(|record| record.is(notification_type, &server, &relative_url)) {
			return false;
		}

		let already_published = self.records.iter().any(|record| record.notification_type == notification_type);
		if !already_published && self.announced_within(notification_type, now, self.config.publish_time * 2) {
			// Announcements of an earlier instance may still be cached by control points
			log::debug!("Withdrawing stale announcements of {notification_type}");
			let usn = message::unique_service_name(&self.config.uuid, notification_type);
			let byebye = message::build_byebye(&self.config.server_id, notification_type, &usn);
			for interface in &self.interfaces {
				self.send(transport, *interface, &byebye, multicast_addr());
			}
		}

		// The next pass must announce the new record, whatever was announced of its type before
		if let Some(store) = &mut self.store {
			store.remove(notification_type);
		}

		log::debug!("Publishing {notification_type} at {relative_url}");
		self.records.push(Record {
			notification_type: notification_type.to_string(),
			server,
			relative_url,
		});

		true
	}

	/// Announces every published record on every interface its server is listening on.
	pub fn publish_services(&mut self, transport: &dyn Transport, now: SystemTime) {
		let mut announced = BTreeSet::new();

		for record in &self.records {
			// Periodic passes come every half publish time, well outside this window; only a pass
			// shortly after another one (or after a restart) is skipped
			if self.announced_within(&record.notification_type, now, self.config.publish_time / 4) {
				log::trace!("{} was announced recently, skipping", record.notification_type);
				continue;
			}

			let usn = message::unique_service_name(&self.config.uuid, &record.notification_type);
			for interface in &self.interfaces {
				let port = record.server.server_port(*interface);
				if port == 0 {
					log::trace!("{} is not served on {interface} yet", record.notification_type);
					continue;
				}

				let alive = message::build_alive(
					&self.config.server_id,
					&record.notification_type,
					&usn,
					&record.location(*interface, port),
					self.max_age(),
				);
				self.send(transport, *interface, &alive, multicast_addr());
				announced.insert(record.notification_type.clone());
			}
		}

		if let Some(store) = &mut self.store {
			for notification_type in &announced {
				store.set_last_announced(notification_type, now);
			}
		}
	}

	/// Withdraws every record on every interface, then forgets the records, interfaces and nodes.
	pub fn close(&mut self, transport: &dyn Transport) {
		for record in &self.records {
			let usn = message::unique_service_name(&self.config.uuid, &record.notification_type);
			let byebye = message::build_byebye(&self.config.server_id, &record.notification_type, &usn);
			for interface in &self.interfaces {
				self.send(transport, *interface, &byebye, multicast_addr());
			}
		}

		if let Some(store) = &mut self.store {
			for record in &self.records {
				store.remove(&record.notification_type);
			}
		}

		log::debug!("Closed SSDP engine, withdrew {} record(s)", self.records.len());

		self.records.clear();
		self.interfaces.clear();
		self.nodes.clear();
	}

	/// Handles a datagram that arrived on `interface`.
	///
	/// Searches are answered; announcements and search responses from other nodes are remembered.
	/// Returns whether the remembered nodes changed.
	pub fn handle_datagram(&mut self, interface: Ipv4Addr, datagram: &[u8], from: SocketAddr, transport: &dyn Transport) -> bool {
		let message = match message::parse(datagram) {
			Ok(message) => message,
			Err(err) => {
				log::trace!("Ignoring datagram from {from}: {err}");
				return false;
			}
		};

		log::trace!("Received {message:?} from {from} on {interface}");

		match message {
			Message::Search { search_target, .. } => {
				self.respond(interface, &search_target, from, transport);
				false
			}

			Message::NotifyAlive {
				notification_type,
				unique_service_name,
				location,
				..
			} => self.nodes.add(&notification_type, Node::from_usn(&unique_service_name, &location)),

			Message::NotifyByeBye {
				notification_type,
				unique_service_name,
			} => self.nodes.remove(&notification_type, &Node::from_usn(&unique_service_name, "").uuid),

			Message::Response {
				search_target,
				unique_service_name,
				location,
			} => self.nodes.add(&search_target, Node::from_usn(&unique_service_name, &location)),
		}
	}

	fn respond(&self, interface: Ipv4Addr, search_target: &str, from: SocketAddr, transport: &dyn Transport) {
		if from.ip().is_unspecified() || from.port() == 0 {
			return;
		}

		if !self.interfaces.contains(&interface) {
			return;
		}

		for record in self
			.records
			.iter()
			.filter(|record| search_target == SSDP_ALL || record.notification_type == search_target)
		{
			let port = record.server.server_port(interface);
			if port == 0 {
				continue;
			}

			let response = message::build_response(
				&self.config.server_id,
				&self.config.uuid,
				&record.notification_type,
				&message::unique_service_name(&self.config.uuid, &record.notification_type),
				&record.location(interface, port),
				self.max_age(),
			);
			self.send(transport, interface, &response, from);
		}
	}

	/// Multicasts a search for `search_target` on every interface.
	pub fn search(&self, search_target: &str, transport: &dyn Transport) {
		log::debug!("Searching for {search_target}");
		let search = message::build_search(search_target, SEARCH_MX);
		for interface in &self.interfaces {
			self.send(transport, *interface, &search, multicast_addr());
		}
	}

	/// The nodes of type `search_target` seen so far, one per device.
	pub fn search_results(&self, search_target: &str) -> Vec<Node> {
		self.nodes.search_results(search_target)
	}

	fn announced_within(&self, notification_type: &str, now: SystemTime, within: Duration) -> bool {
		let last = match self.store.as_ref().and_then(|store| store.last_announced(notification_type)) {
			Some(last) => last,
			None => return false,
		};

		// A stamp from the future counts as recent
		now.duration_since(last).map_or(true, |elapsed| elapsed < within)
	}

	fn send(&self, transport: &dyn Transport, interface: Ipv4Addr, datagram: &str, to: SocketAddr) {
		log::trace!("Sending {} bytes to {to} on {interface}", datagram.len());
		for _ in 0..self.config.retransmits {
			if let Err(err) = transport.send_datagram(interface, datagram.as_bytes(), to) {
				log::warn!("Failed to send SSDP datagram to {to} on {interface}: {err}");
				break;
			}
		}
	}
}

fn multicast_addr() -> SocketAddr {
	SocketAddr::V4(SocketAddrV4::new(SSDP_V4_IP, SSDP_PORT))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ssdp::store::MemoryStore;
	use std::{collections::HashMap, sync::Mutex};

	const ROOT_DEVICE: &str = "upnp:rootdevice";
	const MEDIA_SERVER: &str = "urn:schemas-upnp-org:device:MediaServer:1";

	const LAN: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);
	const WIFI: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 7);

	#[derive(Default)]
	struct FakeTransport {
		sent: Mutex<Vec<(Ipv4Addr, Message, SocketAddr)>>,
	}
	impl FakeTransport {
		fn take(&self) -> Vec<(Ipv4Addr, Message, SocketAddr)> {
			std::mem::take(&mut *self.sent.lock().unwrap())
		}
	}
	impl Transport for FakeTransport {
		fn send_datagram(&self, interface: Ipv4Addr, datagram: &[u8], to: SocketAddr) -> std::io::Result<()> {
			self.sent.lock().unwrap().push((interface, message::parse(datagram).unwrap(), to));
			Ok(())
		}
	}

	struct FakeServer(HashMap<Ipv4Addr, u16>);
	impl HttpServer for FakeServer {
		fn server_port(&self, interface: Ipv4Addr) -> u16 {
			self.0.get(&interface).copied().unwrap_or(0)
		}
	}

	struct Fixture {
		engine: Engine,
		transport: FakeTransport,
		server: Arc<dyn HttpServer>,
	}
	impl Fixture {
		fn new() -> Self {
			Self::new_with(1, None)
		}

		fn new_with(retransmits: u8, store: Option<Box<dyn AnnounceStore>>) -> Self {
			let mut engine = Engine::new(
				EngineConfig {
					uuid: "2f402f80-da50-11e1-9b23-00178809ea66".to_string(),
					server_id: "test/1, UPnP/1.0, lighthouse/0".to_string(),
					publish_time: Duration::from_secs(300),
					retransmits,
				},
				store,
			);
			engine.initialize([LAN, WIFI]);

			Self {
				engine,
				transport: FakeTransport::default(),
				server: Arc::new(FakeServer([(LAN, 4280), (WIFI, 4281)].into_iter().collect())),
			}
		}

		fn publish(&mut self, notification_type: &str, relative_url: &str) -> bool {
			self.engine
				.publish(notification_type, self.server.clone(), relative_url, &self.transport, SystemTime::now())
		}

		fn search(&mut self, search_target: &str, from: SocketAddr) {
			let datagram = message::build_search(search_target, 3);
			assert!(!self.engine.handle_datagram(LAN, datagram.as_bytes(), from, &self.transport));
		}
	}

	fn requester() -> SocketAddr {
		"192.168.1.50:51000".parse().unwrap()
	}

	#[test]
	fn publishing_twice_announces_once() {
		let mut f = Fixture::new();
		assert!(f.publish(ROOT_DEVICE, "/upnp/rootdevice.xml"));
		assert!(!f.publish(ROOT_DEVICE, "/upnp/rootdevice.xml"));
		assert!(f.transport.take().is_empty());

		f.engine.publish_services(&f.transport, SystemTime::now());
		let sent = f.transport.take();
		assert_eq!(sent.len(), 2);

		for (interface, message, to) in sent {
			assert_eq!(to, multicast_addr());
			let port = if interface == LAN { 4280 } else { 4281 };
			assert_eq!(
				message,
				Message::NotifyAlive {
					notification_type: ROOT_DEVICE.to_string(),
					unique_service_name: format!("uuid:{}::{ROOT_DEVICE}", f.engine.uuid()),
					location: format!("http://{interface}:{port}/upnp/rootdevice.xml"),
					max_age: Some(330),
				}
			);
		}
	}

	#[test]
	fn records_sharing_a_type() {
		let mut f = Fixture::new();
		assert!(f.publish(MEDIA_SERVER, "/a.xml"));
		assert!(f.publish(MEDIA_SERVER, "b.xml"));
		assert_eq!(f.engine.published().collect::<Vec<_>>(), [(MEDIA_SERVER, "/a.xml"), (MEDIA_SERVER, "/b.xml")]);

		f.engine.publish_services(&f.transport, SystemTime::now());
		assert_eq!(f.transport.take().len(), 4);
	}

	#[test]
	fn interfaces_without_port_are_skipped() {
		let mut f = Fixture::new();
		f.server = Arc::new(FakeServer([(WIFI, 8080)].into_iter().collect()));
		f.publish(ROOT_DEVICE, "/");

		f.engine.publish_services(&f.transport, SystemTime::now());
		let sent = f.transport.take();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].0, WIFI);
	}

	#[test]
	fn search_is_answered_on_receiving_interface() {
		let mut f = Fixture::new();
		f.publish(ROOT_DEVICE, "/upnp/rootdevice.xml");
		f.publish(MEDIA_SERVER, "/upnp/mediaserver.xml");

		f.search(ROOT_DEVICE, requester());
		let sent = f.transport.take();
		assert_eq!(sent.len(), 1);

		let (interface, message, to) = &sent[0];
		assert_eq!(*interface, LAN);
		assert_eq!(*to, requester());
		assert_eq!(
			*message,
			Message::Response {
				search_target: ROOT_DEVICE.to_string(),
				unique_service_name: format!("uuid:{}::{ROOT_DEVICE}", f.engine.uuid()),
				location: "http://192.168.1.20:4280/upnp/rootdevice.xml".to_string(),
			}
		);
	}

	#[test]
	fn unmatched_search_is_ignored() {
		let mut f = Fixture::new();
		f.publish(ROOT_DEVICE, "/");

		f.search("urn:schemas-upnp-org:service:ContentDirectory:1", requester());
		assert!(f.transport.take().is_empty());

		f.search(ROOT_DEVICE, "0.0.0.0:51000".parse().unwrap());
		f.search(ROOT_DEVICE, "192.168.1.50:0".parse().unwrap());
		assert!(f.transport.take().is_empty());
	}

	#[test]
	fn search_all() {
		let mut f = Fixture::new();
		f.publish(ROOT_DEVICE, "/root.xml");
		f.publish(MEDIA_SERVER, "/media.xml");

		f.search(SSDP_ALL, requester());
		let targets = f
			.transport
			.take()
			.into_iter()
			.map(|(_, message, _)| match message {
				Message::Response { search_target, .. } => search_target,
				other => panic!("unexpected {other:?}"),
			})
			.collect::<Vec<_>>();
		assert_eq!(targets, [ROOT_DEVICE, MEDIA_SERVER]);
	}

	#[test]
	fn search_not_answered_without_port() {
		let mut f = Fixture::new();
		f.server = Arc::new(FakeServer([(WIFI, 8080)].into_iter().collect()));
		f.publish(ROOT_DEVICE, "/");

		f.search(ROOT_DEVICE, requester());
		assert!(f.transport.take().is_empty());
	}

	#[test]
	fn close_withdraws_everything() {
		let mut f = Fixture::new();
		f.publish(ROOT_DEVICE, "/root.xml");
		f.publish(MEDIA_SERVER, "/media.xml");

		f.engine.close(&f.transport);
		let sent = f.transport.take();
		assert_eq!(sent.len(), 4);
		assert!(sent.iter().all(|(_, message, to)| matches!(message, Message::NotifyByeBye { .. }) && *to == multicast_addr()));

		let pairs = sent
			.iter()
			.map(|(interface, message, _)| match message {
				Message::NotifyByeBye { notification_type, .. } => (*interface, notification_type.as_str()),
				_ => unreachable!(),
			})
			.collect::<BTreeSet<_>>();
		assert_eq!(pairs.len(), 4);

		f.engine.publish_services(&f.transport, SystemTime::now());
		assert!(f.transport.take().is_empty());
		assert_eq!(f.engine.published().count(), 0);
	}

	#[test]
	fn retransmits() {
		let mut f = Fixture::new_with(3, None);
		f.publish(ROOT_DEVICE, "/");
		f.engine.publish_services(&f.transport, SystemTime::now());
		assert_eq!(f.transport.take().len(), 6);
	}

	#[test]
	fn stale_announcements_are_withdrawn_on_publish() {
		let mut store = MemoryStore::new();
		store.set_last_announced(ROOT_DEVICE, SystemTime::now() - Duration::from_secs(60));

		let mut f = Fixture::new_with(1, Some(Box::new(store)));
		f.publish(ROOT_DEVICE, "/");
		let sent = f.transport.take();
		assert_eq!(sent.len(), 2);
		assert!(sent.iter().all(|(_, message, _)| matches!(message, Message::NotifyByeBye { .. })));

		// The stamp was dropped, so the record is announced straight away
		f.engine.publish_services(&f.transport, SystemTime::now());
		assert_eq!(f.transport.take().len(), 2);
	}

	#[test]
	fn old_stamps_are_ignored() {
		let mut store = MemoryStore::new();
		store.set_last_announced(ROOT_DEVICE, SystemTime::now() - Duration::from_secs(3600));

		let mut f = Fixture::new_with(1, Some(Box::new(store)));
		f.publish(ROOT_DEVICE, "/");
		assert!(f.transport.take().is_empty());
	}

	#[test]
	fn recently_announced_types_are_skipped() {
		let mut f = Fixture::new_with(1, Some(Box::new(MemoryStore::new())));
		f.publish(ROOT_DEVICE, "/root.xml");
		f.publish(ROOT_DEVICE, "/other.xml");

		let start = SystemTime::now();
		f.engine.publish_services(&f.transport, start);
		assert_eq!(f.transport.take().len(), 4);

		f.engine.publish_services(&f.transport, start + Duration::from_secs(10));
		assert!(f.transport.take().is_empty());

		f.engine.publish_services(&f.transport, start + Duration::from_secs(150));
		assert_eq!(f.transport.take().len(), 4);
	}

	#[test]
	fn new_record_of_announced_type_is_announced_promptly() {
		let mut f = Fixture::new_with(1, Some(Box::new(MemoryStore::new())));
		let start = SystemTime::now();

		assert!(f.engine.publish(MEDIA_SERVER, f.server.clone(), "/a.xml", &f.transport, start));
		f.engine.publish_services(&f.transport, start + Duration::from_secs(1));
		assert_eq!(f.transport.take().len(), 2);

		// Another record of a type this process already announces is not withdrawn first
		assert!(f.engine.publish(MEDIA_SERVER, f.server.clone(), "/b.xml", &f.transport, start + Duration::from_secs(10)));
		assert!(f.transport.take().is_empty());

		f.engine.publish_services(&f.transport, start + Duration::from_secs(11));
		let locations = f
			.transport
			.take()
			.into_iter()
			.map(|(_, message, _)| match message {
				Message::NotifyAlive { location, .. } => location,
				other => panic!("unexpected {other:?}"),
			})
			.collect::<BTreeSet<_>>();
		assert_eq!(
			locations,
			[
				"http://192.168.1.20:4280/a.xml",
				"http://192.168.1.20:4280/b.xml",
				"http://10.0.0.7:4281/a.xml",
				"http://10.0.0.7:4281/b.xml",
			]
			.into_iter()
			.map(str::to_string)
			.collect()
		);
	}

	#[test]
	fn nothing_is_announced_after_close() {
		let mut f = Fixture::new();
		f.publish(ROOT_DEVICE, "/root.xml");
		f.engine.close(&f.transport);
		f.transport.take();

		assert!(f.publish(MEDIA_SERVER, "/media.xml"));
		f.engine.publish_services(&f.transport, SystemTime::now());
		assert!(f.transport.take().is_empty());
	}

	#[test]
	fn remembers_other_nodes() {
		let mut f = Fixture::new();
		let from = "192.168.1.9:1900".parse().unwrap();

		let alive = message::build_alive("x", MEDIA_SERVER, "uuid:other::urn:x", "http://192.168.1.9:80/desc.xml", 1800);
		assert!(f.engine.handle_datagram(LAN, alive.as_bytes(), from, &f.transport));
		assert!(!f.engine.handle_datagram(LAN, alive.as_bytes(), from, &f.transport));
		assert_eq!(
			f.engine.search_results(MEDIA_SERVER),
			[Node {
				uuid: "uuid:other".to_string(),
				location: "http://192.168.1.9:80/desc.xml".to_string()
			}]
		);

		let byebye = message::build_byebye("x", MEDIA_SERVER, "uuid:other::urn:x");
		assert!(f.engine.handle_datagram(LAN, byebye.as_bytes(), from, &f.transport));
		assert!(f.engine.search_results(MEDIA_SERVER).is_empty());

		let response = message::build_response("x", "other", ROOT_DEVICE, "uuid:other::upnp:rootdevice", "http://10.0.0.9/", 1800);
		assert!(f.engine.handle_datagram(WIFI, response.as_bytes(), from, &f.transport));
		assert_eq!(f.engine.search_results(ROOT_DEVICE).len(), 1);

		assert!(!f.engine.handle_datagram(WIFI, b"garbage", from, &f.transport));
		assert!(f.transport.take().is_empty());
	}

	#[test]
	fn search_goes_out_on_every_interface() {
		let f = Fixture::new();
		f.engine.search(ROOT_DEVICE, &f.transport);

		let sent = f.transport.take();
		assert_eq!(sent.iter().map(|(interface, ..)| *interface).collect::<Vec<_>>(), [LAN, WIFI]);
		assert!(sent.iter().all(|(_, message, to)| *to == multicast_addr()
			&& *message
				== Message::Search {
					search_target: ROOT_DEVICE.to_string(),
					maximum_wait_sec: Some(SEARCH_MX),
				}));
	}

	#[test]
	fn duplicate_interfaces_are_collapsed() {
		let mut f = Fixture::new();
		f.engine.initialize([LAN, LAN, WIFI, LAN]);
		assert_eq!(f.engine.interfaces(), [LAN, WIFI]);
	}
}
