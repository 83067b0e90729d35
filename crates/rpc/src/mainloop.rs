//! Connection main loop driving one msgpack-rpc peer.

use std::future::{Future, poll_fn};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use pin_project_lite::pin_project;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tower_service::Service;
use tracing::{debug, error, trace, warn};

use crate::codec::MessageCodec;
use crate::config::ConnectionConfig;
use crate::error::HandlerError;
use crate::idle::IdleTimer;
use crate::message::{Kind, Malformed, Message, Request, Response};
use crate::pending::{InflightSet, PendingTable};
use crate::router::Call;
use crate::socket::{MainLoopEvent, PeerSocket};
use crate::{Error, Result};

const READ_CHUNK: usize = 8 * 1024;

/// Why a main loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	/// The peer closed its write half.
	Eof,
	/// No inbound bytes within the configured idle timeout.
	IdleTimeout,
	/// [`PeerSocket::close`] was called.
	Closed,
}

/// Main loop for one connection.
///
/// Inbound messages are classified in arrival order. Requests and
/// notifications are handed to the service and run as tasks, so a slow
/// handler never blocks reading; responses are written in completion order.
pub struct MainLoop<S> {
	service: S,
	rx: mpsc::UnboundedReceiver<MainLoopEvent>,
	/// False once every [`PeerSocket`] clone has been dropped.
	rx_open: bool,
	codec: MessageCodec,
	pending: PendingTable,
	inflight: InflightSet,
	tasks: JoinSet<Completed>,
	idle: IdleTimer,
	forward_errors: bool,
}

/// A finished handler invocation.
struct Completed {
	msgid: Option<u32>,
	method: String,
	result: Result<Value, HandlerError>,
}

type Flow = ControlFlow<Result<CloseReason>, Vec<Message>>;

impl<S> MainLoop<S>
where
	S: Service<Call, Response = Value, Error = HandlerError>,
	S::Future: Send + 'static,
{
	/// Creates a main loop and the socket used to talk to its peer.
	///
	/// `builder` receives a socket clone so handlers can call back into the
	/// peer over the same connection.
	#[must_use]
	pub fn new(builder: impl FnOnce(PeerSocket) -> S, config: &ConnectionConfig) -> (Self, PeerSocket) {
		let (tx, rx) = mpsc::unbounded_channel();
		let socket = PeerSocket::new(tx, config.fallback.clone());
		let this = Self {
			service: builder(socket.clone()),
			rx,
			rx_open: true,
			codec: MessageCodec::new(config.strict_utf8),
			pending: PendingTable::new(),
			inflight: InflightSet::default(),
			tasks: JoinSet::new(),
			idle: IdleTimer::new(config.idle_timeout),
			forward_errors: config.forward_errors,
		};
		(this, socket)
	}

	/// Reference to the wrapped service.
	#[must_use]
	pub fn service(&self) -> &S {
		&self.service
	}

	/// Drives the connection until it closes.
	///
	/// On return every outstanding outbound request has been failed with
	/// [`Error::ConnectionClosed`], and handlers still running are detached:
	/// their responses are never written.
	///
	/// # Errors
	///
	/// - `Error::Io` when `input` or `output` fails.
	/// - `Error::Decode` when the peer sends a malformed msgpack frame.
	/// - `Error::Protocol` when the peer sends an unknown or unparseable message.
	pub async fn run(mut self, mut input: impl AsyncRead + Unpin, mut output: impl AsyncWrite + Unpin) -> Result<CloseReason> {
		let mut buf = BytesMut::with_capacity(READ_CHUNK);
		self.idle.touch();
		trace!(idle = ?self.idle.state(), "main loop started");

		let ret = 'run: loop {
			buf.reserve(READ_CHUNK);
			let ctl: Flow = tokio::select! {
				biased;

				Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
					Ok(done) => ControlFlow::Continue(self.finish(done)),
					Err(e) => {
						error!(error = %e, "handler task was cancelled");
						ControlFlow::Continue(Vec::new())
					}
				},

				event = self.rx.recv(), if self.rx_open => match event {
					Some(event) => self.dispatch_event(event),
					None => {
						self.rx_open = false;
						ControlFlow::Continue(Vec::new())
					}
				},

				read = input.read_buf(&mut buf) => match read {
					Ok(0) => ControlFlow::Break(Ok(CloseReason::Eof)),
					Ok(_) => {
						let chunk = buf.split();
						match self.on_bytes_received(&chunk).await {
							Ok(out) => ControlFlow::Continue(out),
							Err(err) => ControlFlow::Break(Err(err)),
						}
					}
					Err(err) => ControlFlow::Break(Err(err.into())),
				},

				() = self.idle.expired() => ControlFlow::Break(Ok(CloseReason::IdleTimeout)),
			};

			let outgoing = match ctl {
				ControlFlow::Continue(out) => out,
				ControlFlow::Break(ret) => break ret,
			};
			if outgoing.is_empty() {
				continue;
			}
			for msg in outgoing {
				if let Err(err) = self.write_message(&mut output, msg).await {
					break 'run Err(err);
				}
			}
			if let Err(err) = output.flush().await {
				break 'run Err(err.into());
			}
		};

		self.shutdown(&ret);
		let _ = output.shutdown().await;
		ret
	}

	/// Feeds inbound bytes and dispatches every complete message.
	///
	/// Returns the messages to write immediately (protocol-level error
	/// responses); handler responses are produced later as tasks finish.
	async fn on_bytes_received(&mut self, bytes: &[u8]) -> Result<Vec<Message>> {
		self.idle.touch();
		self.codec.feed(bytes);
		let mut out = Vec::new();
		while let Some(decoded) = self.codec.next_message() {
			match decoded {
				Ok(msg) => self.dispatch_message(msg, &mut out).await,
				Err(Error::Malformed(malformed)) => self.on_malformed(malformed, &mut out)?,
				Err(err) => return Err(err),
			}
		}
		Ok(out)
	}

	/// Routes one inbound message.
	async fn dispatch_message(&mut self, msg: Message, out: &mut Vec<Message>) {
		match msg {
			Message::Request(Request { id, method, params }) => {
				if !self.inflight.begin(id) {
					warn!(msgid = id, method = %method, "request msgid already in flight");
					out.push(Message::Response(Response::err(
						id,
						&HandlerError::already_in_flight(id),
						self.forward_errors,
					)));
					return;
				}
				if let Err(err) = poll_fn(|cx| self.service.poll_ready(cx)).await {
					self.inflight.end(id);
					out.push(Message::Response(Response::err(id, &err, self.forward_errors)));
					return;
				}
				self.spawn_call(Call {
					msgid: Some(id),
					method,
					params,
				});
			}
			Message::Response(resp) => {
				let id = resp.id;
				if !self.pending.complete(resp) {
					warn!(msgid = id, "discarding response with no outstanding request");
				}
			}
			Message::Notification(notif) => {
				if let Err(err) = poll_fn(|cx| self.service.poll_ready(cx)).await {
					warn!(method = %notif.method, error = %err, "notification dropped");
					return;
				}
				self.spawn_call(Call {
					msgid: None,
					method: notif.method,
					params: notif.params,
				});
			}
		}
	}

	fn spawn_call(&mut self, call: Call) {
		let msgid = call.msgid;
		let method = call.method.clone();
		let fut = self.service.call(call);
		self.tasks.spawn(HandlerFuture {
			fut,
			msgid,
			method: Some(method),
		});
	}

	fn on_malformed(&mut self, malformed: Malformed, out: &mut Vec<Message>) -> Result<()> {
		match (malformed.kind, malformed.msgid) {
			(Kind::Request, Some(id)) => {
				warn!(msgid = id, reason = %malformed.reason, "malformed request");
				let err = HandlerError::malformed_request(&malformed.reason);
				out.push(Message::Response(Response::err(id, &err, self.forward_errors)));
				Ok(())
			}
			(Kind::Notification, _) => {
				warn!(reason = %malformed.reason, "dropping malformed notification");
				Ok(())
			}
			_ => Err(Error::Protocol(malformed.to_string())),
		}
	}

	/// Turns a finished handler into a response, if one is owed.
	fn finish(&mut self, done: Completed) -> Vec<Message> {
		let Some(id) = done.msgid else {
			match done.result {
				Ok(_) => debug!(method = %done.method, "notification handled"),
				Err(err) => warn!(method = %done.method, error = %err, "notification handler failed"),
			}
			return Vec::new();
		};
		self.inflight.end(id);
		if let Err(err) = &done.result {
			debug!(msgid = id, method = %done.method, error = %err, "request handler failed");
		}
		vec![Message::Response(Response::from_result(id, done.result, self.forward_errors))]
	}

	/// Routes an event from a [`PeerSocket`].
	fn dispatch_event(&mut self, event: MainLoopEvent) -> Flow {
		match event {
			MainLoopEvent::OutgoingRequest {
				method,
				params,
				completion,
			} => match self.pending.register(completion) {
				Some(id) => {
					trace!(msgid = id, method = %method, outstanding = self.pending.len(), "sending request");
					ControlFlow::Continue(vec![Message::Request(Request { id, method, params })])
				}
				None => {
					error!(method = %method, "msgid space exhausted");
					ControlFlow::Continue(Vec::new())
				}
			},
			MainLoopEvent::Outgoing(msg) => ControlFlow::Continue(vec![msg]),
			MainLoopEvent::Close => ControlFlow::Break(Ok(CloseReason::Closed)),
		}
	}

	async fn write_message(&mut self, output: &mut (impl AsyncWrite + Unpin), msg: Message) -> Result<()> {
		let request_id = match &msg {
			Message::Request(req) => Some(req.id),
			_ => None,
		};
		let bytes = match self.codec.encode(msg) {
			Ok(bytes) => bytes,
			Err(err) => {
				match request_id {
					Some(id) => self.pending.fail(id, err),
					None => warn!(error = %err, "dropping message that failed to encode"),
				}
				return Ok(());
			}
		};
		output.write_all(&bytes).await?;
		Ok(())
	}

	/// Fails outstanding requests and detaches running handlers.
	fn shutdown(&mut self, ret: &Result<CloseReason>) {
		self.rx.close();
		let mut failed = self.pending.fail_all();
		while let Ok(event) = self.rx.try_recv() {
			if let MainLoopEvent::OutgoingRequest { completion, .. } = event {
				let _ = completion.send(Err(Error::ConnectionClosed));
				failed += 1;
			}
		}
		let abandoned = self.inflight.len();
		self.inflight.clear();
		self.tasks.detach_all();

		match ret {
			Ok(reason) => debug!(?reason, failed, abandoned, "connection closed"),
			Err(err) => warn!(error = %err, failed, abandoned, "connection failed"),
		}
	}
}

pin_project! {
	struct HandlerFuture<Fut> {
		#[pin]
		fut: Fut,
		msgid: Option<u32>,
		method: Option<String>,
	}
}

impl<Fut> Future for HandlerFuture<Fut>
where
	Fut: Future<Output = Result<Value, HandlerError>>,
{
	type Output = Completed;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();
		let fut = this.fut;
		let result = match panic::catch_unwind(AssertUnwindSafe(|| fut.poll(cx))) {
			Ok(Poll::Pending) => return Poll::Pending,
			Ok(Poll::Ready(result)) => result,
			Err(_) => {
				let method = this.method.as_deref().unwrap_or_default();
				error!(method, "handler panicked");
				Err(HandlerError::panicked(method))
			}
		};
		Poll::Ready(Completed {
			msgid: *this.msgid,
			method: this.method.take().unwrap_or_default(),
			result,
		})
	}
}

#[cfg(test)]
mod tests;
