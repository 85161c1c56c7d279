use crate::wire::packets::ParseError;
use std::time::Duration;

/// The single error currency returned from the public API and the wire
/// codec.
///
/// Variant names follow the status taxonomy in the design this client is
/// modeled on. `NoMemory` has no Rust analogue (the global allocator aborts
/// the process on allocation failure rather than returning an error) and is
/// intentionally not represented here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// A parameter failed synchronous validation (empty/too-long topic or
	/// filter, zero-length client id where one is required, etc).
	#[error("bad parameter: {0}")]
	BadParameter(&'static str),

	/// The transport failed to connect, read, or write.
	#[error("network error: {0}")]
	NetworkError(#[source] std::io::Error),

	/// The runtime could not schedule the requested work (the actor task has
	/// already terminated).
	#[error("client task is no longer running")]
	Closed,

	/// A packet was received that violates the protocol (malformed fixed
	/// header, unsolicited ack, mismatched payload length, ...).
	#[error("bad response from server: {0}")]
	BadResponse(&'static str),

	/// The wire codec failed to parse an inbound packet.
	#[error("malformed packet: {0}")]
	Malformed(#[from] ParseError),

	/// The operation did not complete within its configured or supplied
	/// timeout.
	#[error("operation timed out after {0:?}")]
	Timeout(Duration),

	/// The Server rejected the operation. For CONNACK this is the non-zero
	/// return code; a SUBSCRIBE failing for one filter among several is not
	/// an error at all — the granted filters are still returned, and the
	/// refused ones are simply absent.
	#[error("server refused the request with code {0}")]
	ServerRefused(u8),

	/// A QoS >= 1 PUBLISH exhausted its retry budget without being
	/// acknowledged.
	#[error("publish retry budget exhausted")]
	RetryExhausted,
}

impl From<std::io::Error> for Error {
	#[inline]
	fn from(value: std::io::Error) -> Self {
		Self::NetworkError(value)
	}
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
	#[inline]
	fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
		Self::Closed
	}
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
	#[inline]
	fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
		Self::Closed
	}
}

impl From<crate::InvalidTopic> for Error {
	#[inline]
	fn from(_: crate::InvalidTopic) -> Self {
		Self::BadParameter("invalid topic")
	}
}

impl From<crate::InvalidFilter> for Error {
	#[inline]
	fn from(_: crate::InvalidFilter) -> Self {
		Self::BadParameter("invalid filter")
	}
}

pub type Result<T> = std::result::Result<T, Error>;
