use lighthouse::{net::ipv4_interfaces, socket::UdpTransport, ssdp::SsdpServerBuilder, MessageLoop, Timer};
use std::{sync::Arc, time::Duration};

fn main() {
	let search_target = std::env::args().nth(1).unwrap_or_else(|| "upnp:rootdevice".to_string());

	let message_loop = MessageLoop::new();

	let transport = Arc::new(UdpTransport::open(&ipv4_interfaces(false).unwrap()).unwrap());

	let client = Arc::new(SsdpServerBuilder::new().build(&message_loop, transport.clone()).unwrap());
	client.initialize(transport.interfaces());

	let results = Arc::downgrade(&client);
	let target = search_target.clone();
	client.on_search_updated(move || {
		if let Some(client) = results.upgrade() {
			println!("{target}:");
			for node in client.search_results(&target) {
				println!("  {} at {}", node.uuid, node.location);
			}
		}
	});

	let listener = client.listen(&transport).unwrap();

	println!("Searching for {search_target} for 10 seconds...");
	client.search(&search_target);

	let stopper = message_loop.clone();
	let deadline = Timer::new(&message_loop, move || stopper.stop(0));
	deadline.start_once(Duration::from_secs(10));

	message_loop.run();

	listener.shutdown().unwrap();
}
