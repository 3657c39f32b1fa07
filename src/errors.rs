//! Errors that are not specific to SSDP

use std::net::Ipv4Addr;

pub use crate::ssdp::errors::*;

#[derive(Debug, Error)]
/// An error occurred while setting up the UDP transport
pub enum SocketError {
	#[error("I/O error on interface {interface}: {source}")]
	/// An I/O error occurred while binding or configuring a socket for an interface
	Interface {
		interface: Ipv4Addr,
		#[source]
		source: std::io::Error,
	},

	#[error("I/O error: {0}")]
	/// An I/O error occurred
	IoError(#[from] std::io::Error),

	#[error("No usable IPv4 interfaces")]
	/// None of the requested interfaces could be bound
	NoInterfaces,
}

#[derive(Debug, Error)]
/// An error occurred while shutting down the background listener
pub enum ShutdownError {
	#[error("I/O error: {0}")]
	/// The listener stopped early because of an I/O error
	IoError(#[from] std::io::Error),

	#[error("The listener thread panicked")]
	/// The listener thread panicked
	ThreadJoinError(Box<dyn std::any::Any + Send + 'static>),
}
