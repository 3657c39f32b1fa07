use lighthouse::{
	net::ipv4_interfaces,
	socket::UdpTransport,
	ssdp::{HttpServer, SsdpServerBuilder},
	MessageLoop, Timer,
};
use std::{net::Ipv4Addr, sync::Arc, time::Duration};

/// Pretends a description document is served on port 8080 everywhere
struct DescriptionServer;
impl HttpServer for DescriptionServer {
	fn server_port(&self, _interface: Ipv4Addr) -> u16 {
		8080
	}
}

fn main() {
	simple_logger::init_with_level(log::Level::Debug).unwrap();

	let message_loop = MessageLoop::new();

	let transport = Arc::new(UdpTransport::open(&ipv4_interfaces(false).unwrap()).unwrap());

	let server = SsdpServerBuilder::new().build(&message_loop, transport.clone()).unwrap();
	server.initialize(transport.interfaces());

	let http: Arc<dyn HttpServer> = Arc::new(DescriptionServer);
	server.publish("upnp:rootdevice", http.clone(), "/rootdevice.xml");
	server.publish("urn:schemas-upnp-org:device:MediaServer:1", http, "/rootdevice.xml");

	let listener = server.listen(&transport).unwrap();

	println!("Announcing for 60 seconds...");

	let stopper = message_loop.clone();
	let deadline = Timer::new(&message_loop, move || stopper.stop(0));
	deadline.start_once(Duration::from_secs(60));

	message_loop.run();

	println!("Shutting down...");

	server.close();
	listener.shutdown().unwrap();

	println!("Done!");
}
