//! Concurrent load generator.

use std::time::Instant;

use anyhow::{Context, bail};
use futures::future::join_all;
use mprpc::{PeerSocket, Value};
use rand::Rng;
use tracing::info;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Remote method exercised by the benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BenchMethod {
	Echo,
	Bounce,
}

/// Outcome of one benchmark run.
#[derive(Debug)]
pub struct Report {
	pub iterations: usize,
	pub elapsed: std::time::Duration,
}

impl Report {
	pub fn per_second(&self) -> f64 {
		self.iterations as f64 / self.elapsed.as_secs_f64()
	}
}

fn word(rng: &mut impl Rng, len: usize) -> String {
	(0..len).map(|_| char::from(ALPHABET[rng.random_range(0..ALPHABET.len())])).collect()
}

fn payloads(method: BenchMethod, iterations: usize) -> Vec<Vec<Value>> {
	let mut rng = rand::rng();
	(0..iterations)
		.map(|_| {
			let key = Value::from(format!("TXM_{}", word(&mut rng, 25)));
			match method {
				BenchMethod::Echo => vec![key],
				BenchMethod::Bounce => vec![key, word(&mut rng, 16).into(), word(&mut rng, 128).into()],
			}
		})
		.collect()
}

/// Issues `iterations` requests at once and checks every reply.
pub async fn run(socket: &PeerSocket, method: BenchMethod, iterations: usize) -> anyhow::Result<Report> {
	let items = payloads(method, iterations);
	let name = match method {
		BenchMethod::Echo => "echo",
		BenchMethod::Bounce => "bounce",
	};

	let start = Instant::now();
	let replies = join_all(items.iter().map(|params| socket.call(name, params))).await;
	let elapsed = start.elapsed();

	for (params, reply) in items.into_iter().zip(replies) {
		let reply = reply.with_context(|| format!("{name} request failed"))?;
		let expected = match method {
			BenchMethod::Echo => params.into_iter().next().unwrap_or(Value::Nil),
			BenchMethod::Bounce => Value::Array(params),
		};
		if reply != expected {
			bail!("{name} returned {reply}, expected {expected}");
		}
	}

	let report = Report { iterations, elapsed };
	info!(iterations, ?elapsed, per_second = report.per_second(), "benchmark complete");
	Ok(report)
}
