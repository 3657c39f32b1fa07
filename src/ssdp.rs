//! Announcing resources with, and discovering them over, the
//! [Simple Service Discovery Protocol](https://en.wikipedia.org/wiki/Simple_Service_Discovery_Protocol).
//!
//! An [`SsdpServer`] keeps a table of published records, re-announces them on every interface every
//! half publish time, answers matching searches and withdraws everything on [`close`](SsdpServer::close).
//! It also remembers the nodes other devices announce, so it doubles as a client.

use std::{
	net::{Ipv4Addr, SocketAddr},
	time::Duration,
};

mod builder;
mod engine;
mod nodes;
mod server;
mod store;

pub mod errors;
pub mod message;

pub use builder::SsdpServerBuilder;
pub use engine::Engine;
pub use nodes::Node;
pub use server::{DatagramHandler, SsdpServer};
pub use store::{AnnounceStore, MemoryStore};

/// How long an announcement is considered valid for
pub const PUBLISH_TIME: Duration = Duration::from_secs(300);

/// How long after a [`publish`](SsdpServer::publish) the announcement pass runs
pub const PUBLISH_DELAY: Duration = Duration::from_secs(1);

/// Seconds added to the publish time in `CACHE-CONTROL: max-age`
pub const CACHE_CONTROL_MARGIN: u64 = 30;

/// How long the node table has to settle before search subscribers are told about a change
pub const SEARCH_UPDATE_DELAY: Duration = Duration::from_millis(250);

/// `MX` of outgoing searches
pub const SEARCH_MX: u8 = 3;

/// The HTTP server that serves a published resource.
pub trait HttpServer: Send + Sync {
	/// The port the server listens on for `interface`, or 0 if it is not listening there (yet).
	fn server_port(&self, interface: Ipv4Addr) -> u16;
}

/// Sends datagrams on behalf of the SSDP engine.
///
/// Errors are logged by the caller and otherwise ignored; SSDP is best-effort.
pub trait Transport: Send + Sync {
	fn send_datagram(&self, interface: Ipv4Addr, datagram: &[u8], to: SocketAddr) -> std::io::Result<()>;
}
