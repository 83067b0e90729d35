//! Inbound idle timeout.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Observable state of an [`IdleTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleState {
	/// No timeout configured.
	Disabled,
	/// The connection closes at this instant unless bytes arrive first.
	Armed(Instant),
}

/// Deadline that moves forward on every inbound read.
#[derive(Debug)]
pub(crate) struct IdleTimer {
	timeout: Option<Duration>,
	deadline: Option<Instant>,
}

impl IdleTimer {
	pub fn new(timeout: Option<Duration>) -> Self {
		Self {
			timeout,
			deadline: timeout.map(|t| Instant::now() + t),
		}
	}

	/// Pushes the deadline out by the full timeout.
	pub fn touch(&mut self) {
		if let Some(timeout) = self.timeout {
			self.deadline = Some(Instant::now() + timeout);
		}
	}

	pub fn state(&self) -> IdleState {
		match self.deadline {
			Some(deadline) => IdleState::Armed(deadline),
			None => IdleState::Disabled,
		}
	}

	/// Completes once the current deadline passes; never completes when disabled.
	///
	/// The future captures the deadline at creation, so callers re-create it
	/// after each [`touch`](Self::touch).
	pub fn expired(&self) -> impl Future<Output = ()> + use<> {
		let deadline = self.deadline;
		async move {
			match deadline {
				Some(deadline) => sleep_until(deadline).await,
				None => std::future::pending().await,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn expires_after_timeout() {
		let timer = IdleTimer::new(Some(Duration::from_secs(5)));
		let start = Instant::now();
		timer.expired().await;
		assert_eq!(start.elapsed(), Duration::from_secs(5));
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn touch_extends_deadline() {
		let mut timer = IdleTimer::new(Some(Duration::from_secs(5)));
		let IdleState::Armed(first) = timer.state() else {
			panic!("timer should be armed");
		};
		tokio::time::advance(Duration::from_secs(3)).await;
		timer.touch();
		let IdleState::Armed(second) = timer.state() else {
			panic!("timer should be armed");
		};
		assert_eq!(second - first, Duration::from_secs(3));

		let expired = timer.expired();
		tokio::pin!(expired);
		assert!(tokio::time::timeout(Duration::from_secs(4), &mut expired).await.is_err());
		assert!(tokio::time::timeout(Duration::from_secs(2), &mut expired).await.is_ok());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn disabled_never_fires() {
		let timer = IdleTimer::new(None);
		assert_eq!(timer.state(), IdleState::Disabled);
		assert!(tokio::time::timeout(Duration::from_secs(3600), timer.expired()).await.is_err());
	}
}
