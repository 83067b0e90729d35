//! Error taxonomy for the engine and for remote method handlers.

use std::fmt;
use std::io;

use rmpv::Value;

use crate::message::Malformed;
use crate::router::Arity;

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The main loop behind a socket is no longer running.
	#[error("service stopped")]
	ServiceStopped,
	/// The connection ended before the peer answered.
	#[error("connection closed before a response arrived")]
	ConnectionClosed,
	/// The inbound byte stream contains a malformed msgpack frame.
	#[error("decode failed: {0}")]
	Decode(String),
	/// A local value could not be converted into a msgpack value.
	#[error("serialization failed: {0}")]
	Serialize(String),
	/// A response result could not be converted into the requested type.
	#[error("deserialization failed: {0}")]
	Deserialize(String),
	/// A decoded frame is not a well-formed msgpack-rpc message.
	#[error("{0}")]
	Malformed(#[from] Malformed),
	/// The peer violated the msgpack-rpc protocol.
	#[error("protocol error: {0}")]
	Protocol(String),
	/// The peer answered the request with an error.
	#[error("remote error: {error}")]
	Remote {
		/// The `error` field of the response.
		error: Value,
		/// The `result` field accompanying the error, usually nil.
		result: Value,
	},
	/// Every msgid of this connection has been handed out.
	#[error("request ids exhausted on this connection")]
	IdsExhausted,
	/// Input/output errors from the underlying transport.
	#[error("{0}")]
	Io(#[from] io::Error),
}

impl Error {
	/// Returns true for errors after which the connection cannot continue.
	#[must_use]
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::Decode(_) | Self::Protocol(_) | Self::Io(_))
	}
}

/// Errno classification carried by handler errors.
///
/// Codes follow the Linux values so that peers written against other
/// msgpack-rpc stacks see familiar numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
	/// No method registered under the requested name.
	Enosys,
	/// Wrong parameter count or message shape.
	Einval,
	/// A request with the same msgid is already in flight.
	Ealready,
	/// Any other handler failure.
	Other,
}

impl Errno {
	/// Numeric code as placed on the wire.
	#[must_use]
	pub const fn code(self) -> i32 {
		match self {
			Self::Enosys => 38,
			Self::Einval => 22,
			Self::Ealready => 114,
			Self::Other => 0,
		}
	}
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.code())
	}
}

/// Failure produced while serving an inbound request or notification.
///
/// `message` is safe to show to any peer. `detail` holds internal context
/// (source error chains, argument counts) and only leaves the process when
/// error forwarding is enabled on the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[Errno {errno}] {message}")]
pub struct HandlerError {
	errno: Errno,
	message: String,
	detail: Option<String>,
}

impl HandlerError {
	/// Creates an application error with [`Errno::Other`].
	pub fn new(message: impl Into<String>) -> Self {
		Self::with_errno(Errno::Other, message)
	}

	/// Creates an error with an explicit classification.
	pub fn with_errno(errno: Errno, message: impl Into<String>) -> Self {
		Self {
			errno,
			message: message.into(),
			detail: None,
		}
	}

	/// Wraps an arbitrary error, keeping its source chain as detail.
	pub fn internal(err: &(dyn std::error::Error + 'static)) -> Self {
		let mut detail = err.to_string();
		let mut source = err.source();
		while let Some(cause) = source {
			detail.push_str("\ncaused by: ");
			detail.push_str(&cause.to_string());
			source = cause.source();
		}
		Self::new("unexpected error").detail(detail)
	}

	pub(crate) fn method_not_found(method: &str) -> Self {
		Self::with_errno(Errno::Enosys, format!("failed to find method: {method}"))
	}

	pub(crate) fn wrong_arity(method: &str, expected: Arity, got: usize) -> Self {
		Self::with_errno(Errno::Einval, format!("wrong number of arguments for {method}"))
			.detail(format!("expected {expected}, received {got}"))
	}

	pub(crate) fn already_in_flight(msgid: u32) -> Self {
		Self::with_errno(Errno::Ealready, format!("request with msgid '{msgid}' already exists"))
	}

	pub(crate) fn malformed_request(reason: &str) -> Self {
		Self::with_errno(Errno::Einval, "failed to unpack request").detail(reason)
	}

	pub(crate) fn panicked(method: &str) -> Self {
		Self::new(format!("unexpected error calling {method}")).detail("handler panicked")
	}

	/// Attaches internal detail.
	#[must_use]
	pub fn detail(mut self, detail: impl Into<String>) -> Self {
		self.detail = Some(detail.into());
		self
	}

	/// Errno classification.
	#[must_use]
	pub fn errno(&self) -> Errno {
		self.errno
	}

	/// Public message.
	#[must_use]
	pub fn message(&self) -> &str {
		&self.message
	}

	/// Internal detail, if any.
	#[must_use]
	pub fn detail_text(&self) -> Option<&str> {
		self.detail.as_deref()
	}

	/// Renders the `error` field of the response.
	#[must_use]
	pub fn to_wire(&self, forward: bool) -> Value {
		match (&self.detail, forward) {
			(Some(detail), true) => Value::from(format!("{self}\n{detail}")),
			_ => Value::from(self.to_string()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn forwarding_controls_detail() {
		let err = HandlerError::wrong_arity("echo", Arity::Exact(1), 3);
		assert_eq!(err.errno(), Errno::Einval);
		assert_eq!(err.to_wire(false), Value::from("[Errno 22] wrong number of arguments for echo"));
		assert_eq!(
			err.to_wire(true),
			Value::from("[Errno 22] wrong number of arguments for echo\nexpected 1, received 3")
		);
	}

	#[test]
	fn internal_keeps_source_chain() {
		let inner = io::Error::new(io::ErrorKind::NotFound, "cache miss");
		let err = HandlerError::internal(&inner);
		assert_eq!(err.errno(), Errno::Other);
		assert_eq!(err.message(), "unexpected error");
		assert_eq!(err.detail_text(), Some("cache miss"));
		assert_eq!(err.to_wire(false), Value::from("[Errno 0] unexpected error"));
	}

	#[test]
	fn fatal_classification() {
		assert!(Error::Decode("bad marker".into()).is_fatal());
		assert!(Error::Protocol("tag 7".into()).is_fatal());
		assert!(!Error::Serialize("u128".into()).is_fatal());
		assert!(!Error::ConnectionClosed.is_fatal());
	}
}
