//! Remote methods served by the demo.

use std::sync::Arc;

use mprpc::{Arity, HandlerError, Router, Value};
use tracing::debug;

use crate::store::BounceStore;

/// Shared state of every connection.
#[derive(Clone, Default)]
pub struct EchoState {
	store: Option<Arc<dyn BounceStore>>,
}

impl EchoState {
	pub fn with_store(store: Arc<dyn BounceStore>) -> Self {
		Self { store: Some(store) }
	}
}

/// Builds the method table.
///
/// - `echo(value)` returns `value`.
/// - `bounce(one, two, three)` records `"two:three"` under `one` when a store
///   is configured and returns the three arguments.
pub fn router(state: EchoState) -> Router<EchoState> {
	let mut router = Router::new(state);
	router
		.method_with_id("echo", Arity::Exact(1), |_, msgid, mut params| async move {
			debug!(?msgid, "echo");
			Ok::<_, HandlerError>(params.remove(0))
		})
		.method("bounce", Arity::Exact(3), |state: EchoState, params| async move {
			if let Some(store) = &state.store {
				let key = params[0]
					.as_str()
					.ok_or_else(|| HandlerError::new("bounce key must be a string"))?;
				store.set(key, format!("{}:{}", Text(&params[1]), Text(&params[2])));
			}
			Ok::<_, HandlerError>(Value::Array(params))
		});
	router
}

/// Renders strings without quotes and everything else as msgpack display.
struct Text<'a>(&'a Value);

impl std::fmt::Display for Text<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self.0.as_str() {
			Some(s) => f.write_str(s),
			None => write!(f, "{}", self.0),
		}
	}
}
