//! Outbound connection that reconnects with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_service::Service;

use crate::config::{ConnectionConfig, ReconnectConfig};
use crate::error::HandlerError;
use crate::mainloop::MainLoop;
use crate::router::Call;
use crate::server::ConnectionStats;
use crate::socket::PeerSocket;
use crate::{Error, Result};

/// Retry delay generator.
///
/// Each failed attempt multiplies the delay by `factor` up to `max_delay`,
/// then spreads it uniformly by `±jitter` of its value. A successful
/// connection calls [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
	config: ReconnectConfig,
	delay: Duration,
	retries: u32,
}

impl Backoff {
	/// Creates a backoff at its initial delay.
	#[must_use]
	pub fn new(config: ReconnectConfig) -> Self {
		Self {
			delay: config.initial_delay,
			config,
			retries: 0,
		}
	}

	/// Delay before the next attempt, or `None` once `max_retries` is spent.
	pub fn next_delay(&mut self) -> Option<Duration> {
		self.retries = self.retries.saturating_add(1);
		if self.config.max_retries.is_some_and(|max| self.retries > max) {
			return None;
		}
		let grown = self.delay.as_secs_f64() * self.config.factor;
		self.delay = Duration::from_secs_f64(grown.min(self.config.max_delay.as_secs_f64()));

		if self.config.jitter <= 0.0 {
			return Some(self.delay);
		}
		let spread = self.config.jitter * (2.0 * rand::random::<f64>() - 1.0);
		let jittered = self.delay.as_secs_f64() * (1.0 + spread);
		Some(Duration::from_secs_f64(jittered.clamp(0.0, self.config.max_delay.as_secs_f64())))
	}

	/// Consecutive failed attempts since the last reset.
	#[must_use]
	pub fn retries(&self) -> u32 {
		self.retries
	}

	/// Returns to the initial delay and clears the retry count.
	pub fn reset(&mut self) {
		self.delay = self.config.initial_delay;
		self.retries = 0;
	}
}

/// Connection state published by a [`ReconnectingClient`].
#[derive(Debug, Clone)]
pub enum ConnectionState {
	/// Waiting for a connection attempt or its backoff.
	Connecting,
	/// Connected; the socket talks to the live connection.
	Connected(PeerSocket),
	/// No further attempts will be made.
	Stopped,
}

/// Client that keeps one connection to `addr` alive.
///
/// Requests issued on a connection that is lost fail with
/// [`Error::ConnectionClosed`]; they are not replayed on the next one.
#[derive(Debug)]
pub struct ReconnectingClient {
	state: watch::Receiver<ConnectionState>,
	shutdown: CancellationToken,
	stats: Arc<ConnectionStats>,
}

impl ReconnectingClient {
	/// Starts connecting in the background.
	///
	/// `builder` is called once per established connection to create the
	/// service that answers the server's calls.
	pub fn spawn<F, S>(addr: impl Into<String>, builder: F, config: ConnectionConfig, reconnect: ReconnectConfig) -> Self
	where
		F: FnMut(PeerSocket) -> S + Send + 'static,
		S: Service<Call, Response = Value, Error = HandlerError> + Send + 'static,
		S::Future: Send + 'static,
	{
		let (state_tx, state) = watch::channel(ConnectionState::Connecting);
		let shutdown = CancellationToken::new();
		let stats = Arc::new(ConnectionStats::default());

		let supervisor = Supervisor {
			addr: addr.into(),
			builder,
			config,
			backoff: Backoff::new(reconnect),
			state: state_tx,
			shutdown: shutdown.clone(),
			stats: Arc::clone(&stats),
		};
		tokio::spawn(supervisor.run());

		Self { state, shutdown, stats }
	}

	/// Waits for a live connection.
	///
	/// # Errors
	///
	/// Returns [`Error::ServiceStopped`] once the client has stopped.
	pub async fn socket(&self) -> Result<PeerSocket> {
		let mut rx = self.state.clone();
		let state = rx
			.wait_for(|state| match state {
				ConnectionState::Connected(socket) => !socket.is_closed(),
				ConnectionState::Stopped => true,
				ConnectionState::Connecting => false,
			})
			.await
			.map_err(|_| Error::ServiceStopped)?;
		match &*state {
			ConnectionState::Connected(socket) => Ok(socket.clone()),
			_ => Err(Error::ServiceStopped),
		}
	}

	/// Sends a request on the current connection, waiting for one if needed.
	///
	/// # Errors
	///
	/// See [`PeerSocket::request`]; additionally [`Error::ServiceStopped`]
	/// once the client has stopped.
	pub async fn request<R: DeserializeOwned>(
		&self,
		method: impl Into<String>,
		params: impl Serialize,
	) -> Result<R> {
		self.socket().await?.request(method, params).await
	}

	/// Sends a notification on the current connection, waiting for one if needed.
	///
	/// # Errors
	///
	/// See [`PeerSocket::notify`].
	pub async fn notify(&self, method: impl Into<String>, params: impl Serialize) -> Result<()> {
		self.socket().await?.notify(method, params)
	}

	/// Watches connection state changes.
	#[must_use]
	pub fn state(&self) -> watch::Receiver<ConnectionState> {
		self.state.clone()
	}

	/// Connection counters of this client.
	#[must_use]
	pub fn stats(&self) -> &Arc<ConnectionStats> {
		&self.stats
	}

	/// Stops reconnecting and closes the current connection.
	pub fn shutdown(&self) {
		self.shutdown.cancel();
	}

	/// Waits until the client has stopped.
	pub async fn stopped(&self) {
		let mut rx = self.state.clone();
		let _ = rx.wait_for(|state| matches!(state, ConnectionState::Stopped)).await;
	}
}

impl Drop for ReconnectingClient {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

struct Supervisor<F> {
	addr: String,
	builder: F,
	config: ConnectionConfig,
	backoff: Backoff,
	state: watch::Sender<ConnectionState>,
	shutdown: CancellationToken,
	stats: Arc<ConnectionStats>,
}

impl<F, S> Supervisor<F>
where
	F: FnMut(PeerSocket) -> S + Send + 'static,
	S: Service<Call, Response = Value, Error = HandlerError> + Send + 'static,
	S::Future: Send + 'static,
{
	async fn run(mut self) {
		loop {
			self.state.send_replace(ConnectionState::Connecting);
			let connected = tokio::select! {
				() = self.shutdown.cancelled() => break,
				res = TcpStream::connect(self.addr.as_str()) => res,
			};

			match connected {
				Ok(stream) => {
					self.backoff.reset();
					self.drive(stream).await;
				}
				Err(e) => {
					tracing::warn!(addr = %self.addr, error = %e, retries = self.backoff.retries(), "connect failed");
				}
			}

			if self.shutdown.is_cancelled() {
				break;
			}
			let Some(delay) = self.backoff.next_delay() else {
				tracing::warn!(addr = %self.addr, retries = self.backoff.retries(), "giving up reconnecting");
				break;
			};
			tracing::debug!(addr = %self.addr, ?delay, "reconnecting");
			tokio::select! {
				() = self.shutdown.cancelled() => break,
				() = tokio::time::sleep(delay) => {}
			}
		}
		self.state.send_replace(ConnectionState::Stopped);
	}

	/// Runs one connection until it ends.
	async fn drive(&mut self, stream: TcpStream) {
		let _ = stream.set_nodelay(true);
		let _guard = self.stats.open();
		let (main_loop, socket) = MainLoop::new(&mut self.builder, &self.config);
		tracing::info!(addr = %self.addr, "connected");
		self.state.send_replace(ConnectionState::Connected(socket.clone()));

		let (input, output) = stream.into_split();
		let run = main_loop.run(input, output);
		tokio::pin!(run);
		let ret = tokio::select! {
			ret = &mut run => ret,
			() = self.shutdown.cancelled() => {
				socket.close();
				run.await
			}
		};
		match ret {
			Ok(reason) => tracing::info!(addr = %self.addr, ?reason, "connection lost"),
			Err(e) => tracing::warn!(addr = %self.addr, error = %e, "connection failed"),
		}
	}
}
