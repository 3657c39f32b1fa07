//! Parsing and building of SSDP datagrams

use super::errors::MessageError;
use crate::{SSDP_PORT, SSDP_V4_IP};
use std::collections::BTreeMap;

pub const NOTIFY_START_LINE: &str = "NOTIFY * HTTP/1.1";
pub const SEARCH_START_LINE: &str = "M-SEARCH * HTTP/1.1";
pub const RESPONSE_START_LINE: &str = "HTTP/1.1 200 OK";

pub const SSDP_ALL: &str = "ssdp:all";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
	NotifyAlive {
		notification_type: String,
		unique_service_name: String,
		location: String,
		max_age: Option<u32>,
	},
	NotifyByeBye {
		notification_type: String,
		unique_service_name: String,
	},
	Search {
		search_target: String,
		maximum_wait_sec: Option<u8>,
	},
	Response {
		search_target: String,
		unique_service_name: String,
		location: String,
	},
}

/// Parses an SSDP datagram. Header names are case-insensitive.
pub fn parse(datagram: &[u8]) -> Result<Message, MessageError> {
	let datagram = std::str::from_utf8(datagram).map_err(|_| MessageError::NotUtf8)?;

	let mut lines = datagram.lines();
	let start_line = lines.next().unwrap_or_default().trim();

	let headers = lines
		.filter_map(|line| line.split_once(':'))
		.map(|(key, value)| (key.trim().to_ascii_uppercase(), value.trim()))
		.collect::<BTreeMap<_, _>>();

	let header = |name: &'static str| headers.get(name).map(|value| value.to_string()).ok_or(MessageError::MissingHeader(name));

	match start_line {
		NOTIFY_START_LINE => match headers.get("NTS").copied() {
			Some("ssdp:alive") => Ok(Message::NotifyAlive {
				notification_type: header("NT")?,
				unique_service_name: header("USN")?,
				location: header("LOCATION")?,
				max_age: headers.get("CACHE-CONTROL").and_then(|value| parse_max_age(value)),
			}),

			Some("ssdp:byebye") => Ok(Message::NotifyByeBye {
				notification_type: header("NT")?,
				unique_service_name: header("USN")?,
			}),

			Some(nts) => Err(MessageError::UnrecognisedNotificationSubtype(nts.to_string())),
			None => Err(MessageError::MissingHeader("NTS")),
		},

		SEARCH_START_LINE => Ok(Message::Search {
			search_target: header("ST")?,
			maximum_wait_sec: headers.get("MX").and_then(|mx| mx.parse().ok()),
		}),

		RESPONSE_START_LINE => Ok(Message::Response {
			search_target: header("ST")?,
			unique_service_name: header("USN")?,
			location: header("LOCATION")?,
		}),

		_ => Err(MessageError::UnrecognisedStartLine(start_line.to_string())),
	}
}

fn parse_max_age(cache_control: &str) -> Option<u32> {
	cache_control.split(',').find_map(|directive| {
		let (key, value) = directive.split_once('=')?;
		if key.trim().eq_ignore_ascii_case("max-age") {
			value.trim().parse().ok()
		} else {
			None
		}
	})
}

/// `uuid:<uuid>::<type>`, or just `uuid:<uuid>` when the type is the device's own uuid
pub fn unique_service_name(uuid: &str, notification_type: &str) -> String {
	if notification_type.starts_with("uuid:") {
		format!("uuid:{uuid}")
	} else {
		format!("uuid:{uuid}::{notification_type}")
	}
}

pub fn build_alive(server: &str, notification_type: &str, unique_service_name: &str, location: &str, max_age: u32) -> String {
	format!(
		"{NOTIFY_START_LINE}\r\n\
		HOST: {SSDP_V4_IP}:{SSDP_PORT}\r\n\
		CACHE-CONTROL: max-age={max_age}\r\n\
		LOCATION: {location}\r\n\
		NT: {notification_type}\r\n\
		NTS: ssdp:alive\r\n\
		SERVER: {server}\r\n\
		USN: {unique_service_name}\r\n\
		\r\n"
	)
}

pub fn build_byebye(server: &str, notification_type: &str, unique_service_name: &str) -> String {
	format!(
		"{NOTIFY_START_LINE}\r\n\
		HOST: {SSDP_V4_IP}:{SSDP_PORT}\r\n\
		NT: {notification_type}\r\n\
		NTS: ssdp:byebye\r\n\
		SERVER: {server}\r\n\
		USN: {unique_service_name}\r\n\
		\r\n"
	)
}

pub fn build_response(server: &str, uuid: &str, search_target: &str, unique_service_name: &str, location: &str, max_age: u32) -> String {
	format!(
		"{RESPONSE_START_LINE}\r\n\
		CACHE-CONTROL: max-age={max_age}\r\n\
		EXT:\r\n\
		LOCATION: {location}\r\n\
		SERVER: {server}\r\n\
		S: uuid:{uuid}\r\n\
		ST: {search_target}\r\n\
		USN: {unique_service_name}\r\n\
		\r\n"
	)
}

pub fn build_search(search_target: &str, maximum_wait_sec: u8) -> String {
	format!(
		"{SEARCH_START_LINE}\r\n\
		HOST: {SSDP_V4_IP}:{SSDP_PORT}\r\n\
		MAN: \"ssdp:discover\"\r\n\
		MX: {maximum_wait_sec}\r\n\
		ST: {search_target}\r\n\
		\r\n"
	)
}
