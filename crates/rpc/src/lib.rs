//! msgpack-rpc protocol engine.
//!
//! This crate speaks msgpack-rpc over any byte stream:
//! * `MessageCodec`: incremental msgpack decoding into typed messages
//! * `MainLoop`: per-connection engine correlating requests and responses
//! * `Router`: method-name dispatch for inbound calls
//! * `Server` / `ReconnectingClient`: TCP connection factories
//!
//! ```no_run
//! use mprpc::{Arity, HandlerError, Router, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> std::io::Result<()> {
//! let server = Server::new(|_peer| {
//! 	let mut router = Router::new(());
//! 	router.method("echo", Arity::Exact(1), |(), mut params| async move {
//! 		Ok::<_, HandlerError>(params.remove(0))
//! 	});
//! 	router
//! });
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:18800").await?;
//! server.serve(listener, CancellationToken::new()).await
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
mod idle;
pub mod mainloop;
pub mod message;
mod pending;
pub mod router;
pub mod server;
pub mod socket;

pub use client::{Backoff, ConnectionState, ReconnectingClient};
pub use codec::MessageCodec;
pub use config::{ConnectionConfig, Fallback, ReconnectConfig};
pub use error::{Errno, Error, HandlerError, Result};
pub use mainloop::{CloseReason, MainLoop};
pub use message::{Kind, Malformed, Message, Notification, Request, Response};
pub use rmpv::Value;
pub use router::{Arity, Call, Router};
pub use server::{ConnectionStats, Server};
pub use socket::{PeerSocket, ResponseFuture};
