use std::{
	collections::{BTreeMap, BTreeSet},
	net::Ipv4Addr,
};
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A device or service seen on the network, either announcing itself or answering a search
pub struct Node {
	/// The `uuid:...` part of the node's USN
	pub uuid: String,

	/// Where the node's description can be fetched from
	pub location: String,
}
impl Node {
	/// Splits `uuid:<uuid>::<type>` down to `uuid:<uuid>`.
	pub fn from_usn(unique_service_name: &str, location: &str) -> Self {
		let uuid = unique_service_name.split("::").next().unwrap_or_default();
		Self {
			uuid: uuid.trim().to_string(),
			location: location.trim().to_string(),
		}
	}

	/// How reachable the location's host probably is; bigger is better.
	fn preference(&self) -> u8 {
		Url::parse(&self.location)
			.ok()
			.and_then(|url| url.host_str()?.parse::<Ipv4Addr>().ok())
			.map_or(0, address_preference)
	}
}

fn address_preference(addr: Ipv4Addr) -> u8 {
	match addr.octets() {
		[127, ..] => 5,
		[192, 168, ..] => 4,
		[10, ..] => 3,
		[172, b, ..] if (16..32).contains(&b) => 2,
		[169, 254, ..] => 1,
		_ => 0,
	}
}

#[derive(Default, Debug)]
/// Nodes seen so far, by notification or search type
pub(super) struct NodeMemory(BTreeMap<String, BTreeSet<Node>>);
impl NodeMemory {
	/// Returns whether anything changed.
	pub(super) fn add(&mut self, node_type: &str, node: Node) -> bool {
		if node_type.is_empty() || node.uuid.is_empty() || node.location.is_empty() {
			return false;
		}
		self.0.entry(node_type.to_string()).or_default().insert(node)
	}

	/// Forgets every location known for `uuid` under `node_type`. Returns whether anything changed.
	pub(super) fn remove(&mut self, node_type: &str, uuid: &str) -> bool {
		let nodes = match self.0.get_mut(node_type) {
			Some(nodes) => nodes,
			None => return false,
		};

		let before = nodes.len();
		nodes.retain(|node| node.uuid != uuid);
		let changed = nodes.len() != before;

		if nodes.is_empty() {
			self.0.remove(node_type);
		}

		changed
	}

	/// One node per uuid, keeping the location most likely to be reachable from here.
	pub(super) fn search_results(&self, node_type: &str) -> Vec<Node> {
		let mut best = BTreeMap::<&str, &Node>::new();
		for node in self.0.get(node_type).into_iter().flatten() {
			match best.get(node.uuid.as_str()) {
				Some(current) if current.preference() >= node.preference() => {}
				_ => {
					best.insert(node.uuid.as_str(), node);
				}
			}
		}
		best.into_values().cloned().collect()
	}

	pub(super) fn clear(&mut self) {
		self.0.clear();
	}
}
