//! Connection and reconnect settings.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use serde::Deserialize;

/// Conversion applied when a local value cannot be serialised.
///
/// Receives the serialisation error message and may return a replacement
/// value; returning `None` keeps the original error.
pub type Fallback = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;

/// Per-connection settings.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
	/// Close the connection after this long without inbound bytes.
	#[serde(with = "opt_secs")]
	pub idle_timeout: Option<Duration>,
	/// Put full error detail into error responses.
	pub forward_errors: bool,
	/// Treat strings that are not valid UTF-8 as decode errors.
	pub strict_utf8: bool,
	/// Replacement for values that fail to serialise.
	#[serde(skip)]
	pub fallback: Option<Fallback>,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			idle_timeout: None,
			forward_errors: false,
			strict_utf8: true,
			fallback: None,
		}
	}
}

impl fmt::Debug for ConnectionConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionConfig")
			.field("idle_timeout", &self.idle_timeout)
			.field("forward_errors", &self.forward_errors)
			.field("strict_utf8", &self.strict_utf8)
			.field("fallback", &self.fallback.as_ref().map(|_| "<fn>"))
			.finish()
	}
}

impl ConnectionConfig {
	/// Defaults for accepted connections: errors are forwarded.
	#[must_use]
	pub fn server() -> Self {
		Self {
			forward_errors: true,
			..Self::default()
		}
	}

	/// Defaults for outbound connections: only generic error messages are sent.
	#[must_use]
	pub fn client() -> Self {
		Self::default()
	}

	/// Sets the idle timeout.
	#[must_use]
	pub fn idle_timeout(mut self, timeout: Duration) -> Self {
		self.idle_timeout = Some(timeout);
		self
	}

	/// Enables or disables error forwarding.
	#[must_use]
	pub fn forward_errors(mut self, forward: bool) -> Self {
		self.forward_errors = forward;
		self
	}

	/// Enables or disables strict UTF-8 decoding.
	#[must_use]
	pub fn strict_utf8(mut self, strict: bool) -> Self {
		self.strict_utf8 = strict;
		self
	}

	/// Installs a fallback conversion.
	#[must_use]
	pub fn fallback(mut self, fallback: impl Fn(&str) -> Option<Value> + Send + Sync + 'static) -> Self {
		self.fallback = Some(Arc::new(fallback));
		self
	}
}

/// Reconnect backoff settings for [`ReconnectingClient`](crate::ReconnectingClient).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
	/// Delay base after a successful connection.
	#[serde(with = "secs")]
	pub initial_delay: Duration,
	/// Upper bound for any delay.
	#[serde(with = "secs")]
	pub max_delay: Duration,
	/// Multiplier applied per failed attempt.
	pub factor: f64,
	/// Relative spread applied to each delay, `0.0` disables jitter.
	pub jitter: f64,
	/// Give up after this many consecutive failures.
	pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
	fn default() -> Self {
		Self {
			initial_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(12),
			factor: std::f64::consts::E,
			jitter: 0.119_626_565_582,
			max_retries: None,
		}
	}
}

mod secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let secs = f64::deserialize(d)?;
		Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
	}
}

mod opt_secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		Option::<f64>::deserialize(d)?
			.map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
			.transpose()
	}
}
