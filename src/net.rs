//! Networking utilities

use std::{
	collections::BTreeSet,
	net::{IpAddr, Ipv4Addr},
};

/// The [`if_addrs`](https://crates.io/crates/if_addrs) crate is used to discover network interfaces on the system.
///
/// Here is a re-export for your convenience.
pub use if_addrs;

/// The IPv4 addresses of the system's network interfaces, deduplicated and sorted.
///
/// Loopback interfaces are only included if `loopback` is set.
pub fn ipv4_interfaces(loopback: bool) -> Result<Vec<Ipv4Addr>, std::io::Error> {
	Ok(if_addrs::get_if_addrs()?
		.into_iter()
		.filter(|iface| loopback || !iface.is_loopback())
		.filter_map(|iface| if let IpAddr::V4(addr) = iface.ip() { Some(addr) } else { None })
		.collect::<BTreeSet<_>>()
		.into_iter()
		.collect())
}
