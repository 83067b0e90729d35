//! TOML configuration for `mprpc-echo serve`.

use std::path::Path;

use anyhow::Context;
use mprpc::ConnectionConfig;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Server settings file.
///
/// The `[connection]` table starts from the server role defaults, so
/// errors are forwarded unless it says otherwise.
///
/// ```toml
/// addr = "127.0.0.1:8007"
/// store = true
///
/// [connection]
/// idle_timeout = 30.0
/// forward_errors = true
/// ```
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServeConfig {
	pub addr: String,
	/// Record `bounce` calls in an in-memory store.
	pub store: bool,
	#[serde(deserialize_with = "server_connection")]
	pub connection: ConnectionConfig,
}

impl Default for ServeConfig {
	fn default() -> Self {
		Self {
			addr: crate::DEFAULT_ADDR.to_owned(),
			store: false,
			connection: ConnectionConfig::server(),
		}
	}
}

impl ServeConfig {
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
		Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
	}

	fn parse(text: &str) -> anyhow::Result<Self> {
		Ok(toml::from_str(text)?)
	}
}

/// Reads a `[connection]` table on top of [`ConnectionConfig::server`].
fn server_connection<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ConnectionConfig, D::Error> {
	let mut table = toml::Table::deserialize(deserializer)?;
	table
		.entry("forward_errors")
		.or_insert(toml::Value::Boolean(ConnectionConfig::server().forward_errors));
	toml::Value::Table(table).try_into().map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn empty_file_uses_server_defaults() {
		let cfg = ServeConfig::parse("").unwrap();
		assert_eq!(cfg.addr, crate::DEFAULT_ADDR);
		assert!(!cfg.store);
		assert!(cfg.connection.forward_errors);
	}

	#[test]
	fn connection_table_overrides() {
		let cfg = ServeConfig::parse(
			r#"
addr = "0.0.0.0:9000"
store = true

[connection]
idle_timeout = 2.5
forward_errors = false
"#,
		)
		.unwrap();
		assert_eq!(cfg.addr, "0.0.0.0:9000");
		assert!(cfg.store);
		assert_eq!(cfg.connection.idle_timeout, Some(Duration::from_millis(2500)));
		assert!(!cfg.connection.forward_errors);
		assert!(cfg.connection.strict_utf8);
	}

	#[test]
	fn connection_table_keeps_server_defaults() {
		let cfg = ServeConfig::parse("[connection]\nidle_timeout = 5.0\n").unwrap();
		assert_eq!(cfg.connection.idle_timeout, Some(Duration::from_secs(5)));
		assert!(cfg.connection.forward_errors);
	}

	#[test]
	fn unknown_keys_are_rejected() {
		assert!(ServeConfig::parse("idle = 3").is_err());
		assert!(ServeConfig::parse("[connection]\nidle = 3").is_err());
	}
}
