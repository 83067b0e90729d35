//! Handle for talking to the peer through a running [`MainLoop`](crate::MainLoop).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use rmpv::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::ser::{Impossible, SerializeSeq, SerializeTuple, SerializeTupleStruct};
use tokio::sync::{mpsc, oneshot};

use crate::config::Fallback;
use crate::message::{Message, Notification};
use crate::pending::Completion;
use crate::{Error, Result};

/// Events consumed by the main loop.
pub(crate) enum MainLoopEvent {
	/// A request that still needs a msgid.
	OutgoingRequest {
		method: String,
		params: Vec<Value>,
		completion: Completion,
	},
	/// A message to write as-is.
	Outgoing(Message),
	/// Stop the loop.
	Close,
}

/// Cloneable sender half of a connection.
///
/// Every clone talks to the same main loop. Once the loop has stopped all
/// operations fail with [`Error::ServiceStopped`].
#[derive(Clone)]
pub struct PeerSocket {
	tx: mpsc::UnboundedSender<MainLoopEvent>,
	fallback: Option<Fallback>,
}

impl fmt::Debug for PeerSocket {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PeerSocket").field("closed", &self.is_closed()).finish_non_exhaustive()
	}
}

impl PeerSocket {
	pub(crate) fn new(tx: mpsc::UnboundedSender<MainLoopEvent>, fallback: Option<Fallback>) -> Self {
		Self { tx, fallback }
	}

	/// Creates a socket whose loop is already gone.
	#[must_use]
	pub fn new_closed() -> Self {
		let (tx, _) = mpsc::unbounded_channel();
		Self { tx, fallback: None }
	}

	/// Returns true once the main loop has stopped.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	fn send(&self, event: MainLoopEvent) -> Result<()> {
		self.tx.send(event).map_err(|_| Error::ServiceStopped)
	}

	/// Issues a request and returns its completion handle without waiting.
	///
	/// The request is queued immediately; the msgid is assigned by the main
	/// loop in issue order. `params` must serialise to an array (a tuple or
	/// a `Vec`); `()` means no parameters and any other value is sent as the
	/// single parameter.
	pub fn call(&self, method: impl Into<String>, params: impl Serialize) -> ResponseFuture {
		let params = match to_params(&params, self.fallback.as_ref()) {
			Ok(params) => params,
			Err(err) => return ResponseFuture::failed(err),
		};
		let (completion, rx) = oneshot::channel();
		let event = MainLoopEvent::OutgoingRequest {
			method: method.into(),
			params,
			completion,
		};
		match self.send(event) {
			Ok(()) => ResponseFuture::waiting(rx),
			Err(err) => ResponseFuture::failed(err),
		}
	}

	/// Sends a request and converts the result.
	///
	/// # Errors
	///
	/// - [`Error::Serialize`] if `params` cannot be converted.
	/// - [`Error::Remote`] if the peer answered with an error.
	/// - [`Error::ConnectionClosed`] if the connection ended first.
	/// - [`Error::Deserialize`] if the result does not fit `R`.
	pub async fn request<R: DeserializeOwned>(&self, method: impl Into<String>, params: impl Serialize) -> Result<R> {
		let value = self.call(method, params).await?;
		rmpv::ext::from_value(value).map_err(|e| Error::Deserialize(e.to_string()))
	}

	/// Sends a notification.
	///
	/// # Errors
	///
	/// Fails locally if `params` cannot be converted or the loop has stopped.
	pub fn notify(&self, method: impl Into<String>, params: impl Serialize) -> Result<()> {
		let params = to_params(&params, self.fallback.as_ref())?;
		self.send(MainLoopEvent::Outgoing(Message::Notification(Notification {
			method: method.into(),
			params,
		})))
	}

	/// Asks the main loop to close the connection. Calling it again is a no-op.
	pub fn close(&self) {
		let _ = self.send(MainLoopEvent::Close);
	}
}

/// Converts serialisable parameters into a positional list.
///
/// A tuple or sequence is converted element by element, so the fallback
/// replaces only the elements that fail and the parameter count is kept.
pub(crate) fn to_params(params: &impl Serialize, fallback: Option<&Fallback>) -> Result<Vec<Value>> {
	match params.serialize(Positional { fallback }) {
		Ok(items) => Ok(items),
		Err(ParamsError::Element(msg)) => Err(Error::Serialize(msg)),
		Err(ParamsError::NotPositional | ParamsError::Custom(_)) => Ok(match to_value(params, fallback).map_err(Error::Serialize)? {
			Value::Array(items) => items,
			Value::Nil => Vec::new(),
			other => vec![other],
		}),
	}
}

fn to_value(value: &(impl Serialize + ?Sized), fallback: Option<&Fallback>) -> std::result::Result<Value, String> {
	rmpv::ext::to_value(value).or_else(|err| {
		let msg = err.to_string();
		fallback.and_then(|f| f(&msg)).ok_or(msg)
	})
}

#[derive(Debug, thiserror::Error)]
enum ParamsError {
	#[error("not a positional parameter list")]
	NotPositional,
	#[error("{0}")]
	Element(String),
	#[error("{0}")]
	Custom(String),
}

impl serde::ser::Error for ParamsError {
	fn custom<T: fmt::Display>(msg: T) -> Self {
		Self::Custom(msg.to_string())
	}
}

/// Serializer that splits a top-level tuple or sequence into its elements.
struct Positional<'a> {
	fallback: Option<&'a Fallback>,
}

/// Elements collected by [`Positional`].
struct Elements<'a> {
	items: Vec<Value>,
	fallback: Option<&'a Fallback>,
}

impl<'a> Positional<'a> {
	fn collect(self, len: Option<usize>) -> Elements<'a> {
		Elements {
			items: Vec::with_capacity(len.unwrap_or_default()),
			fallback: self.fallback,
		}
	}
}

impl Elements<'_> {
	fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), ParamsError> {
		let value = to_value(value, self.fallback).map_err(ParamsError::Element)?;
		self.items.push(value);
		Ok(())
	}
}

macro_rules! not_positional {
	($($method:ident($ty:ty)),* $(,)?) => {
		$(fn $method(self, _: $ty) -> std::result::Result<Self::Ok, Self::Error> {
			Err(ParamsError::NotPositional)
		})*
	};
}

impl<'a> serde::Serializer for Positional<'a> {
	type Ok = Vec<Value>;
	type Error = ParamsError;
	type SerializeSeq = Elements<'a>;
	type SerializeTuple = Elements<'a>;
	type SerializeTupleStruct = Elements<'a>;
	type SerializeTupleVariant = Impossible<Vec<Value>, ParamsError>;
	type SerializeMap = Impossible<Vec<Value>, ParamsError>;
	type SerializeStruct = Impossible<Vec<Value>, ParamsError>;
	type SerializeStructVariant = Impossible<Vec<Value>, ParamsError>;

	not_positional! {
		serialize_bool(bool),
		serialize_i8(i8),
		serialize_i16(i16),
		serialize_i32(i32),
		serialize_i64(i64),
		serialize_u8(u8),
		serialize_u16(u16),
		serialize_u32(u32),
		serialize_u64(u64),
		serialize_f32(f32),
		serialize_f64(f64),
		serialize_char(char),
		serialize_str(&str),
		serialize_bytes(&[u8]),
		serialize_unit_struct(&'static str),
	}

	fn serialize_none(self) -> std::result::Result<Self::Ok, Self::Error> {
		Ok(Vec::new())
	}

	fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> std::result::Result<Self::Ok, Self::Error> {
		value.serialize(self)
	}

	fn serialize_unit(self) -> std::result::Result<Self::Ok, Self::Error> {
		Ok(Vec::new())
	}

	fn serialize_unit_variant(
		self,
		_name: &'static str,
		_index: u32,
		_variant: &'static str,
	) -> std::result::Result<Self::Ok, Self::Error> {
		Err(ParamsError::NotPositional)
	}

	fn serialize_newtype_struct<T: Serialize + ?Sized>(
		self,
		_name: &'static str,
		_value: &T,
	) -> std::result::Result<Self::Ok, Self::Error> {
		Err(ParamsError::NotPositional)
	}

	fn serialize_newtype_variant<T: Serialize + ?Sized>(
		self,
		_name: &'static str,
		_index: u32,
		_variant: &'static str,
		_value: &T,
	) -> std::result::Result<Self::Ok, Self::Error> {
		Err(ParamsError::NotPositional)
	}

	fn serialize_seq(self, len: Option<usize>) -> std::result::Result<Self::SerializeSeq, Self::Error> {
		Ok(self.collect(len))
	}

	fn serialize_tuple(self, len: usize) -> std::result::Result<Self::SerializeTuple, Self::Error> {
		Ok(self.collect(Some(len)))
	}

	fn serialize_tuple_struct(
		self,
		_name: &'static str,
		len: usize,
	) -> std::result::Result<Self::SerializeTupleStruct, Self::Error> {
		Ok(self.collect(Some(len)))
	}

	fn serialize_tuple_variant(
		self,
		_name: &'static str,
		_index: u32,
		_variant: &'static str,
		_len: usize,
	) -> std::result::Result<Self::SerializeTupleVariant, Self::Error> {
		Err(ParamsError::NotPositional)
	}

	fn serialize_map(self, _len: Option<usize>) -> std::result::Result<Self::SerializeMap, Self::Error> {
		Err(ParamsError::NotPositional)
	}

	fn serialize_struct(
		self,
		_name: &'static str,
		_len: usize,
	) -> std::result::Result<Self::SerializeStruct, Self::Error> {
		Err(ParamsError::NotPositional)
	}

	fn serialize_struct_variant(
		self,
		_name: &'static str,
		_index: u32,
		_variant: &'static str,
		_len: usize,
	) -> std::result::Result<Self::SerializeStructVariant, Self::Error> {
		Err(ParamsError::NotPositional)
	}
}

impl SerializeSeq for Elements<'_> {
	type Ok = Vec<Value>;
	type Error = ParamsError;

	fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), ParamsError> {
		self.push(value)
	}

	fn end(self) -> std::result::Result<Vec<Value>, ParamsError> {
		Ok(self.items)
	}
}

impl SerializeTuple for Elements<'_> {
	type Ok = Vec<Value>;
	type Error = ParamsError;

	fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), ParamsError> {
		self.push(value)
	}

	fn end(self) -> std::result::Result<Vec<Value>, ParamsError> {
		Ok(self.items)
	}
}

impl SerializeTupleStruct for Elements<'_> {
	type Ok = Vec<Value>;
	type Error = ParamsError;

	fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), ParamsError> {
		self.push(value)
	}

	fn end(self) -> std::result::Result<Vec<Value>, ParamsError> {
		Ok(self.items)
	}
}

/// Completion handle returned by [`PeerSocket::call`].
#[must_use = "the response is lost unless the future is awaited"]
pub struct ResponseFuture {
	state: ResponseState,
}

enum ResponseState {
	Waiting(oneshot::Receiver<Result<Value>>),
	Failed(Option<Error>),
}

impl ResponseFuture {
	fn waiting(rx: oneshot::Receiver<Result<Value>>) -> Self {
		Self {
			state: ResponseState::Waiting(rx),
		}
	}

	fn failed(err: Error) -> Self {
		Self {
			state: ResponseState::Failed(Some(err)),
		}
	}
}

impl Future for ResponseFuture {
	type Output = Result<Value>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match &mut self.state {
			ResponseState::Waiting(rx) => match Pin::new(rx).poll(cx) {
				Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
				// The loop dropped the completion without resolving it.
				Poll::Ready(Err(_closed)) => Poll::Ready(Err(Error::ConnectionClosed)),
				Poll::Pending => Poll::Pending,
			},
			ResponseState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(Error::ConnectionClosed))),
		}
	}
}

#[cfg(test)]
mod tests;
