#![cfg_attr(docsrs, feature(doc_cfg))]

//! A single-threaded cooperative [`MessageLoop`](message_loop::MessageLoop) with timers, and an
//! [SSDP](https://en.wikipedia.org/wiki/Simple_Service_Discovery_Protocol) announcer that runs on it.

use std::net::Ipv4Addr;

#[macro_use]
extern crate thiserror;

mod util;

pub mod errors;
pub mod message_loop;
pub mod ssdp;

#[cfg(feature = "socket")]
#[cfg_attr(docsrs, doc(cfg(feature = "socket")))]
pub mod net;

#[cfg(feature = "socket")]
#[cfg_attr(docsrs, doc(cfg(feature = "socket")))]
pub mod socket;

pub const SSDP_PORT: u16 = 1900;
pub const SSDP_V4_IP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

pub use message_loop::{MessageLoop, Timer};
