//! Side-effect sink for the `bounce` method.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Key/value sink written by `bounce`.
pub trait BounceStore: Send + Sync {
	/// Stores `value` under `key`, replacing any previous value.
	fn set(&self, key: &str, value: String);
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
	#[cfg(test)]
	pub fn get(&self, key: &str) -> Option<String> {
		self.entries.lock().get(key).cloned()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}
}

impl BounceStore for MemoryStore {
	fn set(&self, key: &str, value: String) {
		self.entries.lock().insert(key.to_owned(), value);
	}
}
