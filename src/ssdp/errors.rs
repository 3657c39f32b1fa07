#[derive(Debug, Error, PartialEq, Eq)]
/// An SSDP datagram could not be parsed
pub enum MessageError {
	#[error("Datagram is not valid UTF-8")]
	/// The datagram is not valid UTF-8
	NotUtf8,

	#[error("Unrecognised start line {0:?}")]
	/// The first line is not `NOTIFY`, `M-SEARCH` or a `200 OK` response
	UnrecognisedStartLine(String),

	#[error("Missing {0} header")]
	/// A header required by this kind of message is absent
	MissingHeader(&'static str),

	#[error("Unrecognised notification subtype {0:?}")]
	/// The NTS header of a `NOTIFY` is neither `ssdp:alive` nor `ssdp:byebye`
	UnrecognisedNotificationSubtype(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
/// An error occurred while building an [`SsdpServer`](super::SsdpServer)
pub enum SsdpServerBuilderError {
	#[error("The publish time must be at least 2 seconds")]
	/// The publish time must be at least 2 seconds, as announcements are repeated every half publish time
	PublishTimeTooShort,

	#[error("At least one transmission per message is required")]
	/// The retransmission count must be at least 1
	ZeroRetransmits,
}
