//! mprpc demo binary.
//!
//! - `serve`: echo/bounce server
//! - `bench`: fires concurrent requests at a server and reports throughput
//! - `call`: one request from the command line

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mprpc::{ConnectionConfig, ReconnectConfig, ReconnectingClient, Router, Server, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod bench;
mod config;
mod handlers;
mod store;

use crate::bench::BenchMethod;
use crate::config::ServeConfig;
use crate::handlers::EchoState;
use crate::store::MemoryStore;

pub(crate) const DEFAULT_ADDR: &str = "127.0.0.1:8007";

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "mprpc-echo")]
#[command(about = "msgpack-rpc echo server and load generator")]
struct Args {
	/// Verbose logging
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Serve `echo` and `bounce`
	Serve {
		/// Settings file
		#[arg(short, long, value_name = "PATH")]
		config: Option<PathBuf>,

		/// Listen address, overrides the settings file
		#[arg(short, long)]
		addr: Option<String>,

		/// Close connections idle for this many seconds
		#[arg(long, value_name = "SECS")]
		idle_timeout: Option<f64>,

		/// Send only generic error messages to clients
		#[arg(long)]
		no_forward_errors: bool,

		/// Record `bounce` calls in memory
		#[arg(long)]
		store: bool,
	},
	/// Issue concurrent requests and report throughput
	Bench {
		#[arg(short, long, default_value = DEFAULT_ADDR)]
		addr: String,

		#[arg(short = 'n', long, default_value_t = 3000)]
		iterations: usize,

		#[arg(short, long, value_enum, default_value_t = BenchMethod::Echo)]
		method: BenchMethod,
	},
	/// Send one request with string parameters
	Call {
		#[arg(short, long, default_value = DEFAULT_ADDR)]
		addr: String,

		method: String,

		params: Vec<String>,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let subscriber = tracing_subscriber::fmt()
		.with_max_level(if args.verbose {
			tracing::Level::DEBUG
		} else {
			tracing::Level::INFO
		})
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;

	match args.command {
		Command::Serve {
			config,
			addr,
			idle_timeout,
			no_forward_errors,
			store,
		} => {
			let mut cfg = match config {
				Some(path) => ServeConfig::load(&path)?,
				None => ServeConfig::default(),
			};
			if let Some(addr) = addr {
				cfg.addr = addr;
			}
			if let Some(secs) = idle_timeout {
				let timeout = Duration::try_from_secs_f64(secs).context("invalid --idle-timeout")?;
				cfg.connection.idle_timeout = Some(timeout);
			}
			if no_forward_errors {
				cfg.connection.forward_errors = false;
			}
			cfg.store |= store;
			serve(cfg).await
		}
		Command::Bench {
			addr,
			iterations,
			method,
		} => {
			let client = connect(addr);
			let socket = client.socket().await?;
			let report = bench::run(&socket, method, iterations).await?;
			println!("Completed {} iterations in: {:?}", report.iterations, report.elapsed);
			println!("Average requests/s: {:.0}", report.per_second());
			client.shutdown();
			Ok(())
		}
		Command::Call { addr, method, params } => {
			let client = connect(addr);
			let reply: Value = client.request(method, &params).await?;
			println!("{reply}");
			client.shutdown();
			Ok(())
		}
	}
}

async fn serve(cfg: ServeConfig) -> anyhow::Result<()> {
	let store = cfg.store.then(|| Arc::new(MemoryStore::default()));
	let state = match &store {
		Some(store) => {
			info!("recording bounce calls in memory");
			EchoState::with_store(store.clone())
		}
		None => EchoState::default(),
	};
	let router = handlers::router(state);
	let server = Server::new(move |_peer| Router::clone(&router)).with_config(cfg.connection);

	let listener = tokio::net::TcpListener::bind(&cfg.addr)
		.await
		.with_context(|| format!("binding {}", cfg.addr))?;

	let shutdown = CancellationToken::new();
	let on_signal = shutdown.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			on_signal.cancel();
		}
	});

	server.serve(listener, shutdown).await?;
	info!(
		total = server.stats().total(),
		stored = ?store.as_ref().map(|s| s.len()),
		"server stopped"
	);
	Ok(())
}

fn connect(addr: String) -> ReconnectingClient {
	let reconnect = ReconnectConfig {
		max_retries: Some(3),
		..ReconnectConfig::default()
	};
	ReconnectingClient::spawn(addr, |_| Router::new(()), ConnectionConfig::client(), reconnect)
}
