//! Accept loop running one [`MainLoop`] per inbound connection.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rmpv::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_service::Service;

use crate::config::ConnectionConfig;
use crate::error::HandlerError;
use crate::mainloop::{CloseReason, MainLoop};
use crate::router::Call;
use crate::socket::PeerSocket;
use crate::Result;

/// Pause after a failed `accept`, so a persistent error such as running out
/// of file descriptors does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connection counters shared between a factory and its connections.
#[derive(Debug, Default)]
pub struct ConnectionStats {
	live: AtomicUsize,
	total: AtomicU64,
}

impl ConnectionStats {
	/// Connections currently running.
	#[must_use]
	pub fn live(&self) -> usize {
		self.live.load(Ordering::Acquire)
	}

	/// Connections established since creation.
	#[must_use]
	pub fn total(&self) -> u64 {
		self.total.load(Ordering::Relaxed)
	}

	/// Counts a new connection until the returned guard drops.
	pub(crate) fn open(self: &Arc<Self>) -> ConnectionGuard {
		self.total.fetch_add(1, Ordering::Relaxed);
		self.live.fetch_add(1, Ordering::AcqRel);
		ConnectionGuard(Arc::clone(self))
	}
}

pub(crate) struct ConnectionGuard(Arc<ConnectionStats>);

impl Drop for ConnectionGuard {
	fn drop(&mut self) {
		self.0.live.fetch_sub(1, Ordering::AcqRel);
	}
}

/// msgpack-rpc server.
///
/// `make_service` is called once per accepted connection with that
/// connection's [`PeerSocket`], so handlers can call back into the client.
pub struct Server<F> {
	make_service: Arc<F>,
	config: ConnectionConfig,
	stats: Arc<ConnectionStats>,
}

impl<F, S> Server<F>
where
	F: Fn(PeerSocket) -> S + Send + Sync + 'static,
	S: Service<Call, Response = Value, Error = HandlerError> + Send + 'static,
	S::Future: Send + 'static,
{
	/// Creates a server with [`ConnectionConfig::server`] settings.
	pub fn new(make_service: F) -> Self {
		Self {
			make_service: Arc::new(make_service),
			config: ConnectionConfig::server(),
			stats: Arc::default(),
		}
	}

	/// Replaces the per-connection settings.
	#[must_use]
	pub fn with_config(mut self, config: ConnectionConfig) -> Self {
		self.config = config;
		self
	}

	/// Shares connection counters with the caller.
	#[must_use]
	pub fn with_stats(mut self, stats: Arc<ConnectionStats>) -> Self {
		self.stats = stats;
		self
	}

	/// Connection counters of this server.
	#[must_use]
	pub fn stats(&self) -> &Arc<ConnectionStats> {
		&self.stats
	}

	/// Accepts connections until `shutdown` is cancelled.
	///
	/// Cancelling also closes every open connection.
	///
	/// # Errors
	///
	/// Currently never fails; accept errors are logged and the loop continues.
	pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
		if let Ok(addr) = listener.local_addr() {
			tracing::info!(%addr, "msgpack-rpc server listening");
		}

		loop {
			tokio::select! {
				() = shutdown.cancelled() => {
					tracing::info!(live = self.stats.live(), "msgpack-rpc server shutting down");
					break;
				}
				res = listener.accept() => match res {
					Ok((stream, peer)) => {
						let _ = stream.set_nodelay(true);
						let conn = self.connection(shutdown.child_token());
						tokio::spawn(async move {
							match conn.run(stream).await {
								Ok(reason) => tracing::debug!(%peer, ?reason, "connection closed"),
								Err(e) => tracing::warn!(%peer, error = %e, "connection error"),
							}
						});
					}
					Err(e) => {
						tracing::error!(error = %e, "failed to accept connection");
						if !pause_after_accept_error(&shutdown).await {
							tracing::info!(live = self.stats.live(), "msgpack-rpc server shutting down");
							break;
						}
					}
				},
			}
		}

		Ok(())
	}

	/// Serves a single already-established connection.
	///
	/// # Errors
	///
	/// Returns the connection-fatal error that ended the main loop.
	pub async fn serve_connection<IO>(&self, io: IO, shutdown: CancellationToken) -> Result<CloseReason>
	where
		IO: AsyncRead + AsyncWrite + Send + 'static,
	{
		self.connection(shutdown).run(io).await
	}

	fn connection(&self, shutdown: CancellationToken) -> Connection<F> {
		Connection {
			make_service: Arc::clone(&self.make_service),
			config: self.config.clone(),
			guard: self.stats.open(),
			shutdown,
		}
	}
}

/// Waits [`ACCEPT_RETRY_DELAY`]; false if `shutdown` fired first.
async fn pause_after_accept_error(shutdown: &CancellationToken) -> bool {
	tokio::select! {
		() = shutdown.cancelled() => false,
		() = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
	}
}

/// One accepted connection, counted from accept until its loop returns.
struct Connection<F> {
	make_service: Arc<F>,
	config: ConnectionConfig,
	guard: ConnectionGuard,
	shutdown: CancellationToken,
}

impl<F, S> Connection<F>
where
	F: Fn(PeerSocket) -> S + Send + Sync + 'static,
	S: Service<Call, Response = Value, Error = HandlerError> + Send + 'static,
	S::Future: Send + 'static,
{
	async fn run<IO>(self, io: IO) -> Result<CloseReason>
	where
		IO: AsyncRead + AsyncWrite,
	{
		let _guard = self.guard;
		let (main_loop, socket) = MainLoop::new(|socket| (self.make_service)(socket), &self.config);
		let (input, output) = tokio::io::split(io);
		let run = main_loop.run(input, output);
		tokio::pin!(run);

		tokio::select! {
			ret = &mut run => ret,
			() = self.shutdown.cancelled() => {
				socket.close();
				run.await
			}
		}
	}
}
