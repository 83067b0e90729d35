//! msgpack-rpc message types and their tuple representation.
//!
//! ```text
//! Request:      [0, msgid, method, params]
//! Response:     [1, msgid, error, result]
//! Notification: [2, method, params]
//! ```

use std::fmt;

use rmpv::Value;

use crate::error::HandlerError;

/// Wire tag of a request.
pub const MSGTYPE_REQUEST: u8 = 0;
/// Wire tag of a response.
pub const MSGTYPE_RESPONSE: u8 = 1;
/// Wire tag of a notification.
pub const MSGTYPE_NOTIFICATION: u8 = 2;

/// A request expecting a response with the same `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
	/// Connection-local request identifier.
	pub id: u32,
	/// Remote method name.
	pub method: String,
	/// Positional parameters.
	pub params: Vec<Value>,
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
	/// Identifier of the request being answered.
	pub id: u32,
	/// Nil on success.
	pub error: Value,
	/// Nil on failure.
	pub result: Value,
}

impl Response {
	/// Builds a successful response.
	#[must_use]
	pub fn ok(id: u32, result: Value) -> Self {
		Self {
			id,
			error: Value::Nil,
			result,
		}
	}

	/// Builds an error response; `forward` selects whether internal detail is included.
	#[must_use]
	pub fn err(id: u32, error: &HandlerError, forward: bool) -> Self {
		Self {
			id,
			error: error.to_wire(forward),
			result: Value::Nil,
		}
	}

	pub(crate) fn from_result(id: u32, result: Result<Value, HandlerError>, forward: bool) -> Self {
		match result {
			Ok(value) => Self::ok(id, value),
			Err(err) => Self::err(id, &err, forward),
		}
	}

	/// Returns true when the peer reported an error.
	#[must_use]
	pub fn is_error(&self) -> bool {
		!self.error.is_nil()
	}
}

/// A one-way call; never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
	/// Remote method name.
	pub method: String,
	/// Positional parameters.
	pub params: Vec<Value>,
}

/// Any msgpack-rpc message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// `[0, msgid, method, params]`
	Request(Request),
	/// `[1, msgid, error, result]`
	Response(Response),
	/// `[2, method, params]`
	Notification(Notification),
}

/// Message kind as derived from the leading tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	/// Tag 0.
	Request,
	/// Tag 1.
	Response,
	/// Tag 2.
	Notification,
	/// Missing or unknown tag.
	Unknown,
}

impl fmt::Display for Kind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Request => "request",
			Self::Response => "response",
			Self::Notification => "notification",
			Self::Unknown => "unknown",
		})
	}
}

/// A decoded msgpack value that is not a valid message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {kind} message: {reason}")]
pub struct Malformed {
	/// Kind implied by the tag, if recognisable.
	pub kind: Kind,
	/// Request msgid, when it could still be read.
	pub msgid: Option<u32>,
	/// Human readable reason.
	pub reason: String,
}

impl Malformed {
	fn new(kind: Kind, msgid: Option<u32>, reason: impl Into<String>) -> Self {
		Self {
			kind,
			msgid,
			reason: reason.into(),
		}
	}
}

fn as_msgid(value: &Value) -> Option<u32> {
	value.as_u64().and_then(|id| u32::try_from(id).ok())
}

fn into_params(value: Value) -> Option<Vec<Value>> {
	match value {
		Value::Array(params) => Some(params),
		_ => None,
	}
}

fn into_method(value: Value) -> Option<String> {
	match value {
		Value::String(s) => s.into_str(),
		_ => None,
	}
}

impl Message {
	/// Kind of this message.
	#[must_use]
	pub fn kind(&self) -> Kind {
		match self {
			Self::Request(_) => Kind::Request,
			Self::Response(_) => Kind::Response,
			Self::Notification(_) => Kind::Notification,
		}
	}

	/// Builds the tuple representation.
	#[must_use]
	pub fn into_value(self) -> Value {
		match self {
			Self::Request(req) => Value::Array(vec![
				Value::from(MSGTYPE_REQUEST),
				Value::from(req.id),
				Value::from(req.method),
				Value::Array(req.params),
			]),
			Self::Response(resp) => Value::Array(vec![
				Value::from(MSGTYPE_RESPONSE),
				Value::from(resp.id),
				resp.error,
				resp.result,
			]),
			Self::Notification(notif) => Value::Array(vec![
				Value::from(MSGTYPE_NOTIFICATION),
				Value::from(notif.method),
				Value::Array(notif.params),
			]),
		}
	}

	/// Classifies a decoded value.
	///
	/// # Errors
	///
	/// Returns [`Malformed`] when the value is not an array, carries an
	/// unknown tag, or has the wrong arity or field types for its tag.
	pub fn from_value(value: Value) -> Result<Self, Malformed> {
		let Value::Array(items) = value else {
			return Err(Malformed::new(Kind::Unknown, None, "message is not an array"));
		};
		let tag = items.first().and_then(Value::as_u64);
		match tag {
			Some(t) if t == u64::from(MSGTYPE_REQUEST) => Self::request_from(items),
			Some(t) if t == u64::from(MSGTYPE_RESPONSE) => Self::response_from(items),
			Some(t) if t == u64::from(MSGTYPE_NOTIFICATION) => Self::notification_from(items),
			_ => Err(Malformed::new(
				Kind::Unknown,
				None,
				format!("unknown message type {}", items.first().unwrap_or(&Value::Nil)),
			)),
		}
	}

	fn request_from(items: Vec<Value>) -> Result<Self, Malformed> {
		let msgid = items.get(1).and_then(as_msgid);
		let len = items.len();
		let Ok([_, id, method, params]) = <[Value; 4]>::try_from(items) else {
			return Err(Malformed::new(
				Kind::Request,
				msgid,
				format!("incorrect message length, expected 4, received {len}"),
			));
		};
		let id = as_msgid(&id).ok_or_else(|| Malformed::new(Kind::Request, None, "msgid is not a u32"))?;
		let method = into_method(method).ok_or_else(|| Malformed::new(Kind::Request, Some(id), "method is not a string"))?;
		let params = into_params(params).ok_or_else(|| Malformed::new(Kind::Request, Some(id), "params is not an array"))?;
		Ok(Self::Request(Request { id, method, params }))
	}

	fn response_from(items: Vec<Value>) -> Result<Self, Malformed> {
		let len = items.len();
		let Ok([_, id, error, result]) = <[Value; 4]>::try_from(items) else {
			return Err(Malformed::new(
				Kind::Response,
				None,
				format!("incorrect message length, expected 4, received {len}"),
			));
		};
		let id = as_msgid(&id).ok_or_else(|| Malformed::new(Kind::Response, None, "msgid is not a u32"))?;
		Ok(Self::Response(Response { id, error, result }))
	}

	fn notification_from(items: Vec<Value>) -> Result<Self, Malformed> {
		let len = items.len();
		let Ok([_, method, params]) = <[Value; 3]>::try_from(items) else {
			return Err(Malformed::new(
				Kind::Notification,
				None,
				format!("incorrect message length, expected 3, received {len}"),
			));
		};
		let method = into_method(method).ok_or_else(|| Malformed::new(Kind::Notification, None, "method is not a string"))?;
		let params = into_params(params).ok_or_else(|| Malformed::new(Kind::Notification, None, "params is not an array"))?;
		Ok(Self::Notification(Notification { method, params }))
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn arr(items: Vec<Value>) -> Value {
		Value::Array(items)
	}

	#[test]
	fn request_tuple_shape() {
		let msg = Message::Request(Request {
			id: 1,
			method: "echo".into(),
			params: vec![Value::from("HELLO")],
		});
		let value = msg.clone().into_value();
		assert_eq!(
			value,
			arr(vec![0.into(), 1.into(), "echo".into(), arr(vec!["HELLO".into()])])
		);
		assert_eq!(Message::from_value(value), Ok(msg));
	}

	#[test]
	fn error_response_keeps_result_metadata() {
		let value = arr(vec![1.into(), 9.into(), "boom".into(), 42.into()]);
		let Ok(Message::Response(resp)) = Message::from_value(value) else {
			panic!("expected response");
		};
		assert!(resp.is_error());
		assert_eq!(resp.result, Value::from(42));
	}

	#[test]
	fn short_request_keeps_msgid() {
		let err = Message::from_value(arr(vec![0.into(), 7.into(), "echo".into()])).unwrap_err();
		assert_eq!(err.kind, Kind::Request);
		assert_eq!(err.msgid, Some(7));
	}

	#[test]
	fn unknown_tag_is_rejected() {
		let err = Message::from_value(arr(vec![5.into(), "x".into()])).unwrap_err();
		assert_eq!(err.kind, Kind::Unknown);
		let err = Message::from_value(Value::from("not a tuple")).unwrap_err();
		assert_eq!(err.kind, Kind::Unknown);
	}

	#[test]
	fn notification_params_must_be_array() {
		let err = Message::from_value(arr(vec![2.into(), "log".into(), "text".into()])).unwrap_err();
		assert_eq!(err.kind, Kind::Notification);
	}

	#[test]
	fn msgid_beyond_u32_is_malformed() {
		let err = Message::from_value(arr(vec![
			0.into(),
			Value::from(u64::from(u32::MAX) + 1),
			"echo".into(),
			arr(vec![]),
		]))
		.unwrap_err();
		assert_eq!(err.msgid, None);
	}
}
