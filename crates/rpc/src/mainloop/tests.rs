use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::*;
use crate::Arity;
use crate::message::Notification;
use crate::router::Router;

#[derive(Default)]
struct State {
	release: Notify,
	notified: AtomicUsize,
}

fn router(state: Arc<State>) -> Router<Arc<State>> {
	let mut router = Router::new(state);
	router
		.method("echo", Arity::Exact(1), |_, mut params| async move { Ok::<_, HandlerError>(params.remove(0)) })
		.method("gated", Arity::Any, |state: Arc<State>, _| async move {
			state.release.notified().await;
			Ok::<_, HandlerError>(Value::from("released"))
		})
		.method("log", Arity::Any, |state: Arc<State>, _| async move {
			state.notified.fetch_add(1, Ordering::SeqCst);
			Ok::<_, HandlerError>(Value::Nil)
		})
		.method("explode", Arity::Any, |_, _| async move {
			if true {
				panic!("handler bug");
			}
			Ok::<_, HandlerError>(Value::Nil)
		});
	router
}

/// Raw peer speaking bytes to a main loop.
struct Peer {
	read: ReadHalf<DuplexStream>,
	write: WriteHalf<DuplexStream>,
	codec: MessageCodec,
}

impl Peer {
	async fn send(&mut self, msg: Message) {
		let bytes = self.codec.encode(msg).unwrap();
		self.send_raw(&bytes).await;
	}

	async fn send_raw(&mut self, bytes: &[u8]) {
		self.write.write_all(bytes).await.unwrap();
	}

	async fn recv(&mut self) -> Message {
		loop {
			if let Some(msg) = self.codec.next_message() {
				return msg.unwrap();
			}
			let mut buf = [0u8; 1024];
			let n = self.read.read(&mut buf).await.unwrap();
			assert_ne!(n, 0, "main loop closed the connection");
			self.codec.feed(&buf[..n]);
		}
	}

	async fn recv_response(&mut self) -> Response {
		match self.recv().await {
			Message::Response(resp) => resp,
			other => panic!("expected response, got {other:?}"),
		}
	}
}

fn spawn(config: ConnectionConfig) -> (Peer, PeerSocket, Arc<State>, JoinHandle<Result<CloseReason>>) {
	let state = Arc::new(State::default());
	let (ours, theirs) = duplex(64 * 1024);
	let builder_state = Arc::clone(&state);
	let (main_loop, socket) = MainLoop::new(|_| router(builder_state), &config);
	let (input, output) = split(ours);
	let task = tokio::spawn(main_loop.run(input, output));
	let (read, write) = split(theirs);
	let peer = Peer {
		read,
		write,
		codec: MessageCodec::default(),
	};
	(peer, socket, state, task)
}

fn request(id: u32, method: &str, params: Vec<Value>) -> Message {
	Message::Request(Request {
		id,
		method: method.into(),
		params,
	})
}

fn error_text(resp: &Response) -> &str {
	resp.error.as_str().unwrap_or_default()
}

#[tokio::test]
async fn echo_request() {
	let (mut peer, _socket, _, _task) = spawn(ConnectionConfig::server());
	peer.send(request(1, "echo", vec!["HELLO".into()])).await;
	assert_eq!(peer.recv_response().await, Response::ok(1, Value::from("HELLO")));
}

#[tokio::test]
async fn unknown_method_and_wrong_arity() {
	let (mut peer, _socket, _, _task) = spawn(ConnectionConfig::server());
	peer.send(request(1, "missing", vec![])).await;
	let resp = peer.recv_response().await;
	assert_eq!(resp.result, Value::Nil);
	assert_eq!(error_text(&resp), "[Errno 38] failed to find method: missing");

	peer.send(request(2, "echo", vec![1.into(), 2.into()])).await;
	let resp = peer.recv_response().await;
	assert_eq!(
		error_text(&resp),
		"[Errno 22] wrong number of arguments for echo\nexpected 1, received 2"
	);
}

#[tokio::test]
async fn client_role_hides_detail() {
	let (mut peer, _socket, _, _task) = spawn(ConnectionConfig::client());
	peer.send(request(2, "echo", vec![])).await;
	let resp = peer.recv_response().await;
	assert_eq!(error_text(&resp), "[Errno 22] wrong number of arguments for echo");
}

#[tokio::test]
async fn duplicate_msgid_is_rejected_while_in_flight() {
	let (mut peer, _socket, state, _task) = spawn(ConnectionConfig::server());
	peer.send(request(5, "gated", vec![])).await;
	peer.send(request(5, "gated", vec![])).await;

	let resp = peer.recv_response().await;
	assert_eq!(resp.id, 5);
	assert!(error_text(&resp).starts_with("[Errno 114]"));

	state.release.notify_one();
	assert_eq!(peer.recv_response().await, Response::ok(5, Value::from("released")));

	// The id is free again once answered.
	peer.send(request(5, "echo", vec!["again".into()])).await;
	assert_eq!(peer.recv_response().await, Response::ok(5, Value::from("again")));
}

#[tokio::test]
async fn slow_handler_does_not_block_later_requests() {
	let (mut peer, _socket, state, _task) = spawn(ConnectionConfig::server());
	peer.send(request(1, "gated", vec![])).await;
	peer.send(request(2, "echo", vec!["fast".into()])).await;
	assert_eq!(peer.recv_response().await.id, 2);
	state.release.notify_one();
	assert_eq!(peer.recv_response().await.id, 1);
}

#[tokio::test]
async fn notifications_are_never_answered() {
	let (mut peer, _socket, state, _task) = spawn(ConnectionConfig::server());
	peer.send(Message::Notification(Notification {
		method: "log".into(),
		params: vec!["x".into()],
	}))
	.await;
	peer.send(Message::Notification(Notification {
		method: "missing".into(),
		params: vec![],
	}))
	.await;
	peer.send(request(3, "echo", vec!["after".into()])).await;
	assert_eq!(peer.recv_response().await, Response::ok(3, Value::from("after")));
	assert_eq!(state.notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_request_gets_einval() {
	let (mut peer, _socket, _, _task) = spawn(ConnectionConfig::server());
	let short = Value::Array(vec![0.into(), 9.into(), "echo".into()]);
	let mut bytes = Vec::new();
	rmpv::encode::write_value(&mut bytes, &short).unwrap();
	peer.send_raw(&bytes).await;

	let resp = peer.recv_response().await;
	assert_eq!(resp.id, 9);
	assert!(error_text(&resp).starts_with("[Errno 22] failed to unpack request"));

	peer.send(request(10, "echo", vec!["still up".into()])).await;
	assert_eq!(peer.recv_response().await.id, 10);
}

#[tokio::test]
async fn unknown_message_type_is_fatal() {
	let (mut peer, _socket, _, task) = spawn(ConnectionConfig::server());
	let bogus = Value::Array(vec![7.into(), "what".into()]);
	let mut bytes = Vec::new();
	rmpv::encode::write_value(&mut bytes, &bogus).unwrap();
	peer.send_raw(&bytes).await;
	assert!(matches!(task.await.unwrap(), Err(Error::Protocol(_))));
}

#[tokio::test]
async fn undecodable_bytes_are_fatal() {
	let (mut peer, _socket, _, task) = spawn(ConnectionConfig::server());
	peer.send_raw(&[0xc1]).await;
	assert!(matches!(task.await.unwrap(), Err(Error::Decode(_))));
}

#[tokio::test]
async fn unroutable_response_is_discarded() {
	let (mut peer, _socket, _, _task) = spawn(ConnectionConfig::server());
	peer.send(Message::Response(Response::ok(77, "stray".into()))).await;
	peer.send(request(1, "echo", vec!["ok".into()])).await;
	assert_eq!(peer.recv_response().await.id, 1);
}

#[tokio::test]
async fn handler_panic_becomes_error_response() {
	let (mut peer, _socket, _, _task) = spawn(ConnectionConfig::server());
	peer.send(request(4, "explode", vec![])).await;
	let resp = peer.recv_response().await;
	assert_eq!(resp.id, 4);
	assert!(error_text(&resp).starts_with("[Errno 0] unexpected error calling explode"));
}

#[tokio::test]
async fn outbound_requests_use_increasing_msgids() {
	let (mut peer, socket, _, _task) = spawn(ConnectionConfig::client());
	let first = socket.call("ping", ());
	let second = socket.call("ping", ("x",));

	let Message::Request(a) = peer.recv().await else { panic!("expected request") };
	let Message::Request(b) = peer.recv().await else { panic!("expected request") };
	assert_eq!((a.id, b.id), (1, 2));
	assert_eq!(b.params, vec![Value::from("x")]);

	// Answer out of order.
	peer.send(Message::Response(Response::ok(2, "two".into()))).await;
	peer.send(Message::Response(Response {
		id: 1,
		error: "nope".into(),
		result: Value::Nil,
	}))
	.await;
	assert_eq!(second.await.unwrap(), Value::from("two"));
	assert!(matches!(first.await, Err(Error::Remote { error, .. }) if error == Value::from("nope")));
}

#[tokio::test]
async fn eof_fails_outstanding_requests() {
	let (mut peer, socket, _, task) = spawn(ConnectionConfig::client());
	let calls: Vec<_> = (0..5).map(|i| socket.call("echo", (i,))).collect();
	for _ in 0..5 {
		assert_eq!(peer.recv().await.kind(), Kind::Request);
	}
	drop(peer);

	assert_eq!(task.await.unwrap().unwrap(), CloseReason::Eof);
	for call in calls {
		assert!(matches!(call.await, Err(Error::ConnectionClosed)));
	}
	assert!(socket.is_closed());
	assert!(matches!(socket.notify("log", ()), Err(Error::ServiceStopped)));
}

#[tokio::test]
async fn close_is_idempotent() {
	let (_peer, socket, _, task) = spawn(ConnectionConfig::client());
	let pending = socket.call("echo", ("x",));
	socket.close();
	socket.close();
	assert_eq!(task.await.unwrap().unwrap(), CloseReason::Closed);
	assert!(matches!(pending.await, Err(Error::ConnectionClosed)));
	socket.close();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn idle_timeout_closes_quiet_connection() {
	let start = Instant::now();
	let (mut peer, _socket, _, task) = spawn(ConnectionConfig::server().idle_timeout(Duration::from_secs(5)));

	tokio::time::sleep(Duration::from_secs(3)).await;
	peer.send(request(1, "echo", vec!["keepalive".into()])).await;
	assert_eq!(peer.recv_response().await.id, 1);

	assert_eq!(task.await.unwrap().unwrap(), CloseReason::IdleTimeout);
	assert_eq!(start.elapsed(), Duration::from_secs(8));
}
