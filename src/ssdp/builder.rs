use super::{
	engine::{Engine, EngineConfig},
	errors::SsdpServerBuilderError,
	store::AnnounceStore,
	SsdpServer, Transport, PUBLISH_DELAY, PUBLISH_TIME,
};
use crate::{util::default_server_id, MessageLoop};
use std::{sync::Arc, time::Duration};

pub struct SsdpServerBuilder {
	uuid: Option<String>,
	server_id: Option<String>,
	publish_time: Duration,
	publish_delay: Duration,
	retransmits: u8,
	store: Option<Box<dyn AnnounceStore>>,
}
impl SsdpServerBuilder {
	pub fn new() -> Self {
		Self {
			uuid: None,
			server_id: None,
			publish_time: PUBLISH_TIME,
			publish_delay: PUBLISH_DELAY,
			retransmits: 1,
			store: None,
		}
	}

	/// The device uuid used in USNs, without the `uuid:` prefix. A random one is generated by default.
	pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
		self.uuid = Some(uuid.into());
		self
	}

	/// The `SERVER` header, conventionally `<os>/<version>, UPnP/1.0, <product>/<version>`.
	pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
		self.server_id = Some(server_id.into());
		self
	}

	/// How long announcements stay valid. Records are re-announced every half publish time.
	pub fn publish_time(mut self, publish_time: Duration) -> Self {
		self.publish_time = publish_time;
		self
	}

	/// How long after a publish the announcement pass runs, so that a burst of publishes is announced together.
	pub fn publish_delay(mut self, publish_delay: Duration) -> Self {
		self.publish_delay = publish_delay;
		self
	}

	/// How many times every datagram is sent, to make up for lost ones.
	pub fn retransmits(mut self, retransmits: u8) -> Self {
		self.retransmits = retransmits;
		self
	}

	/// Remembers announcement times across restarts.
	pub fn store(mut self, store: impl AnnounceStore + 'static) -> Self {
		self.store = Some(Box::new(store));
		self
	}

	/// Builds a bare [`Engine`] for callers that drive the protocol themselves.
	pub fn build_engine(self) -> Result<Engine, SsdpServerBuilderError> {
		self.into_parts().map(|(engine, _)| engine)
	}

	/// Builds a server that runs on `message_loop` and sends through `transport`.
	///
	/// Nothing is announced until [`SsdpServer::initialize`] is called.
	pub fn build(self, message_loop: &MessageLoop, transport: Arc<dyn Transport>) -> Result<SsdpServer, SsdpServerBuilderError> {
		let announce_interval = self.publish_time / 2;
		let (engine, publish_delay) = self.into_parts()?;
		Ok(SsdpServer::new(message_loop, engine, transport, announce_interval, publish_delay))
	}

	fn into_parts(self) -> Result<(Engine, Duration), SsdpServerBuilderError> {
		let SsdpServerBuilder {
			uuid,
			server_id,
			publish_time,
			publish_delay,
			retransmits,
			store,
		} = self;

		if publish_time < Duration::from_secs(2) {
			return Err(SsdpServerBuilderError::PublishTimeTooShort);
		}

		if retransmits == 0 {
			return Err(SsdpServerBuilderError::ZeroRetransmits);
		}

		let config = EngineConfig {
			uuid: uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
			server_id: server_id.unwrap_or_else(default_server_id),
			publish_time,
			retransmits,
		};

		Ok((Engine::new(config, store), publish_delay))
	}
}
impl Default for SsdpServerBuilder {
	fn default() -> Self {
		Self::new()
	}
}
