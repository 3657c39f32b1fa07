//! A UDP [`Transport`] on real sockets

use crate::{
	errors::{ShutdownError, SocketError},
	ssdp::Transport,
	SSDP_PORT, SSDP_V4_IP,
};
use std::{
	net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
	sync::Arc,
	thread::JoinHandle,
};
use tokio::net::UdpSocket as AsyncUdpSocket;

/// Multicast TTL of everything we send
pub const MULTICAST_TTL: u32 = 4;

/// Largest datagram we read; SSDP messages are far smaller
const RECV_BUFFER_SIZE: usize = 4096;

type DatagramHandler = Arc<dyn Fn(Ipv4Addr, Vec<u8>, SocketAddr) + Send + Sync>;

struct InterfaceSockets {
	interface: Ipv4Addr,

	/// Bound to the SSDP port, receives announcements and searches that arrive on this interface only
	multicast: Option<UdpSocket>,

	/// Bound to an ephemeral port on the interface, sends everything and receives search responses
	private: UdpSocket,
}

/// SSDP sockets on a set of IPv4 interfaces.
///
/// Every interface gets a socket bound to the SSDP port that joins the SSDP multicast group on that
/// interface, and a private socket bound to the interface's own address that all datagrams for the
/// interface are sent from.
pub struct UdpTransport {
	interfaces: Vec<InterfaceSockets>,
	loopback: bool,
}
impl UdpTransport {
	/// Opens sockets on every interface in `interfaces`.
	///
	/// Interfaces that cannot be bound are skipped with a warning; it is an error only if none can be.
	pub fn open(interfaces: &[Ipv4Addr]) -> Result<Self, SocketError> {
		Self::open_with_loopback(interfaces, false)
	}

	/// Like [`open`](Self::open), but our own multicast datagrams are looped back to us.
	pub fn open_with_loopback(interfaces: &[Ipv4Addr], loopback: bool) -> Result<Self, SocketError> {
		let mut opened = Vec::with_capacity(interfaces.len());

		for interface in interfaces.iter().copied() {
			let private = match new_private_socket(interface, loopback) {
				Ok(private) => private,
				Err(err) => {
					log::warn!("{err}");
					continue;
				}
			};

			let multicast = match new_multicast_socket(interface, loopback) {
				Ok(multicast) => Some(multicast),
				Err(err) => {
					log::warn!("{err}");
					None
				}
			};

			opened.push(InterfaceSockets { interface, multicast, private });
		}

		if opened.is_empty() {
			return Err(SocketError::NoInterfaces);
		}

		Ok(Self { interfaces: opened, loopback })
	}

	/// The interfaces that could be opened, in the order they were given.
	pub fn interfaces(&self) -> Vec<Ipv4Addr> {
		self.interfaces.iter().map(|sockets| sockets.interface).collect()
	}

	/// Whether our own multicast datagrams are looped back to us.
	#[inline(always)]
	pub fn loopback(&self) -> bool {
		self.loopback
	}

	/// The address of the socket datagrams for `interface` are sent from.
	pub fn local_addr(&self, interface: Ipv4Addr) -> Result<SocketAddr, std::io::Error> {
		self.sockets(interface)?.private.local_addr()
	}

	fn sockets(&self, interface: Ipv4Addr) -> Result<&InterfaceSockets, std::io::Error> {
		self.interfaces
			.iter()
			.find(|sockets| sockets.interface == interface)
			.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("No socket on interface {interface}")))
	}

	/// Starts a background thread that passes every datagram received on any of the sockets to
	/// `handler`, along with the interface it arrived on and who sent it.
	///
	/// `handler` runs on the listener thread; to handle datagrams on a [`MessageLoop`](crate::MessageLoop),
	/// post them to it (as [`SsdpServer::listen`](crate::ssdp::SsdpServer::listen) does).
	pub fn listen<F>(&self, handler: F) -> Result<ListenerHandle, SocketError>
	where
		F: Fn(Ipv4Addr, Vec<u8>, SocketAddr) + Send + Sync + 'static,
	{
		let mut sockets = Vec::new();
		for interface_sockets in &self.interfaces {
			let interface = interface_sockets.interface;
			for socket in interface_sockets.multicast.iter().chain(std::iter::once(&interface_sockets.private)) {
				let socket = socket
					.try_clone()
					.and_then(|socket| socket.set_nonblocking(true).map(|_| socket))
					.map_err(|source| SocketError::Interface { interface, source })?;
				sockets.push((interface, socket));
			}
		}

		let handler: DatagramHandler = Arc::new(handler);
		let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

		let thread = std::thread::spawn(move || -> Result<(), std::io::Error> {
			tokio::runtime::Builder::new_current_thread()
				.thread_name("Lighthouse SSDP Listener (Tokio)")
				.enable_all()
				.build()?
				.block_on(receive_all(sockets, handler, shutdown_rx))
		});

		Ok(ListenerHandle(ListenerHandleDrop(Some(ListenerHandleInner { thread, shutdown_tx }))))
	}
}
impl Transport for UdpTransport {
	fn send_datagram(&self, interface: Ipv4Addr, datagram: &[u8], to: SocketAddr) -> std::io::Result<()> {
		self.sockets(interface)?.private.send_to(datagram, to).map(|_| ())
	}
}

async fn receive_all(
	sockets: Vec<(Ipv4Addr, UdpSocket)>,
	handler: DatagramHandler,
	shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), std::io::Error> {
	let mut receivers = tokio::task::JoinSet::new();
	for (interface, socket) in sockets {
		receivers.spawn(receive(interface, AsyncUdpSocket::from_std(socket)?, handler.clone()));
	}

	tokio::select! {
		biased;
		_ = shutdown_rx => Ok(()),
		Some(res) = receivers.join_next() => match res {
			Ok(res) => res,
			Err(err) => Err(std::io::Error::new(std::io::ErrorKind::Other, err)),
		},
	}
}

async fn receive(interface: Ipv4Addr, socket: AsyncUdpSocket, handler: DatagramHandler) -> Result<(), std::io::Error> {
	let mut buffer = vec![0; RECV_BUFFER_SIZE];
	loop {
		match socket.recv_from(&mut buffer).await {
			Ok((count, from)) => {
				log::trace!("Received {count} bytes from {from} on {interface}");
				handler(interface, buffer[..count].to_vec(), from);
			}

			// ICMP errors for earlier sends surface here on some platforms
			Err(err) if matches!(err.kind(), std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::Interrupted) => {
				log::debug!("Ignoring receive error on {interface}: {err}");
			}

			Err(err) => {
				log::warn!("Error receiving on {interface}: {err}");
				return Err(err);
			}
		}
	}
}

fn new_multicast_socket(interface: Ipv4Addr, loopback: bool) -> Result<UdpSocket, SocketError> {
	let setup = || -> Result<UdpSocket, std::io::Error> {
		let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
		socket.set_reuse_address(true)?;

		#[cfg(unix)]
		{
			socket.set_reuse_port(true)?;
		}

		// Linux hands group traffic to every socket bound to the port unless told otherwise, whichever
		// interface it joined the group on
		#[cfg(target_os = "linux")]
		{
			disable_multicast_all(&socket)?;
			socket.bind(&socket2::SockAddr::from(SocketAddrV4::new(SSDP_V4_IP, SSDP_PORT)))?;
		}
		#[cfg(not(target_os = "linux"))]
		{
			socket.bind(&socket2::SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT)))?;
		}

		socket.join_multicast_v4(&SSDP_V4_IP, &interface)?;
		socket.set_multicast_if_v4(&interface)?;
		socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
		socket.set_multicast_loop_v4(loopback)?;

		Ok(socket.into())
	};

	setup().map_err(|source| SocketError::Interface { interface, source })
}

#[cfg(target_os = "linux")]
fn disable_multicast_all(socket: &socket2::Socket) -> Result<(), std::io::Error> {
	use std::os::unix::io::AsRawFd;

	let off: libc::c_int = 0;
	let res = unsafe {
		libc::setsockopt(
			socket.as_raw_fd(),
			libc::IPPROTO_IP,
			libc::IP_MULTICAST_ALL,
			&off as *const _ as *const _,
			std::mem::size_of::<libc::c_int>() as libc::socklen_t,
		)
	};
	if res == 0 {
		Ok(())
	} else {
		Err(std::io::Error::last_os_error())
	}
}

fn new_private_socket(interface: Ipv4Addr, loopback: bool) -> Result<UdpSocket, SocketError> {
	let setup = || -> Result<UdpSocket, std::io::Error> {
		let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
		socket.bind(&socket2::SockAddr::from(SocketAddrV4::new(interface, 0)))?;
		socket.set_multicast_if_v4(&interface)?;
		socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
		socket.set_multicast_loop_v4(loopback)?;

		Ok(socket.into())
	};

	setup().map_err(|source| SocketError::Interface { interface, source })
}

struct ListenerHandleInner {
	thread: JoinHandle<Result<(), std::io::Error>>,
	shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

struct ListenerHandleDrop(Option<ListenerHandleInner>);
impl ListenerHandleDrop {
	fn shutdown(&mut self) -> Result<(), ShutdownError> {
		let ListenerHandleInner { thread, shutdown_tx } = match self.0.take() {
			Some(inner) => inner,
			None => return Ok(()),
		};

		if !thread.is_finished() {
			shutdown_tx.send(()).ok();
		}

		match thread.join() {
			Ok(Ok(_)) => Ok(()),
			Ok(Err(err)) => Err(ShutdownError::IoError(err)),
			Err(err) => Err(ShutdownError::ThreadJoinError(err)),
		}
	}
}
impl Drop for ListenerHandleDrop {
	fn drop(&mut self) {
		if let Err(err) = self.shutdown() {
			log::error!("{err}");
		}
	}
}

/// Stops the listener thread when dropped or [shut down](Self::shutdown).
pub struct ListenerHandle(ListenerHandleDrop);
impl ListenerHandle {
	/// Stops the listener thread and waits for it to exit.
	///
	/// Returns the I/O error that stopped the listener early, if any.
	pub fn shutdown(mut self) -> Result<(), ShutdownError> {
		self.0.shutdown()
	}
}
