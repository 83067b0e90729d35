//! Bookkeeping for requests in both directions on one connection.

use std::collections::{HashMap, HashSet};

use rmpv::Value;
use tokio::sync::oneshot;

use crate::message::Response;
use crate::{Error, Result};

/// Completion handle for an outbound request.
pub(crate) type Completion = oneshot::Sender<Result<Value>>;

/// Outbound requests awaiting a response, keyed by msgid.
///
/// Ids start at 1 and increase by one per request. The counter never wraps:
/// once `u32::MAX` has been handed out, further requests fail with
/// [`Error::IdsExhausted`].
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
	last_id: u32,
	outgoing: HashMap<u32, Completion>,
}

impl PendingTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Assigns the next msgid and records `completion` under it.
	///
	/// When ids are exhausted the completion is failed immediately and
	/// `None` is returned.
	pub fn register(&mut self, completion: Completion) -> Option<u32> {
		let Some(id) = self.last_id.checked_add(1) else {
			let _ = completion.send(Err(Error::IdsExhausted));
			return None;
		};
		self.last_id = id;
		let prev = self.outgoing.insert(id, completion);
		debug_assert!(prev.is_none(), "msgid {id} reused while outstanding");
		Some(id)
	}

	/// Resolves the pending request matching `resp`.
	///
	/// Returns false if no request with that msgid is outstanding.
	pub fn complete(&mut self, resp: Response) -> bool {
		let Some(tx) = self.outgoing.remove(&resp.id) else {
			return false;
		};
		let outcome = if resp.is_error() {
			Err(Error::Remote {
				error: resp.error,
				result: resp.result,
			})
		} else {
			Ok(resp.result)
		};
		// The caller may have stopped waiting.
		let _ = tx.send(outcome);
		true
	}

	/// Fails a single outstanding request.
	pub fn fail(&mut self, id: u32, err: Error) {
		if let Some(tx) = self.outgoing.remove(&id) {
			let _ = tx.send(Err(err));
		}
	}

	/// Fails every outstanding request with [`Error::ConnectionClosed`].
	///
	/// Each completion is taken out of the table before it is resolved, so a
	/// second call resolves nothing.
	pub fn fail_all(&mut self) -> usize {
		let drained: Vec<_> = self.outgoing.drain().collect();
		let count = drained.len();
		for (_, tx) in drained {
			let _ = tx.send(Err(Error::ConnectionClosed));
		}
		count
	}

	pub fn len(&self) -> usize {
		self.outgoing.len()
	}
}

/// Msgids of inbound requests whose handler has not finished yet.
#[derive(Debug, Default)]
pub(crate) struct InflightSet {
	ids: HashSet<u32>,
}

impl InflightSet {
	/// Returns false if `id` is already in flight.
	pub fn begin(&mut self, id: u32) -> bool {
		self.ids.insert(id)
	}

	pub fn end(&mut self, id: u32) {
		self.ids.remove(&id);
	}

	pub fn len(&self) -> usize {
		self.ids.len()
	}

	pub fn clear(&mut self) {
		self.ids.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_start_at_one_and_increase() {
		let mut table = PendingTable::new();
		let ids: Vec<_> = (0..3).map(|_| table.register(oneshot::channel().0).unwrap()).collect();
		assert_eq!(ids, [1, 2, 3]);
		assert_eq!(table.len(), 3);
	}

	#[tokio::test]
	async fn exhausted_ids_fail_fast() {
		let mut table = PendingTable {
			last_id: u32::MAX - 1,
			outgoing: HashMap::new(),
		};
		let (tx, _rx) = oneshot::channel();
		assert_eq!(table.register(tx), Some(u32::MAX));

		let (tx, rx) = oneshot::channel();
		assert_eq!(table.register(tx), None);
		assert!(matches!(rx.await, Ok(Err(Error::IdsExhausted))));
	}

	#[tokio::test]
	async fn responses_route_by_msgid() {
		let mut table = PendingTable::new();
		let (tx1, rx1) = oneshot::channel();
		let (tx2, rx2) = oneshot::channel();
		let id1 = table.register(tx1).unwrap();
		let id2 = table.register(tx2).unwrap();

		assert!(table.complete(Response::ok(id2, Value::from("second"))));
		assert!(table.complete(Response {
			id: id1,
			error: Value::from("boom"),
			result: Value::from(7),
		}));

		assert_eq!(rx2.await.unwrap().unwrap(), Value::from("second"));
		match rx1.await.unwrap() {
			Err(Error::Remote { error, result }) => {
				assert_eq!(error, Value::from("boom"));
				assert_eq!(result, Value::from(7));
			}
			other => panic!("unexpected outcome: {other:?}"),
		}
	}

	#[test]
	fn unroutable_response_is_reported() {
		let mut table = PendingTable::new();
		assert!(!table.complete(Response::ok(99, Value::Nil)));
	}

	#[tokio::test]
	async fn fail_all_resolves_each_completion_once() {
		let mut table = PendingTable::new();
		let receivers: Vec<_> = (0..5)
			.map(|_| {
				let (tx, rx) = oneshot::channel();
				table.register(tx).unwrap();
				rx
			})
			.collect();

		assert_eq!(table.fail_all(), 5);
		assert_eq!(table.fail_all(), 0);
		for rx in receivers {
			assert!(matches!(rx.await, Ok(Err(Error::ConnectionClosed))));
		}
	}

	#[test]
	fn duplicate_inflight_id_is_rejected() {
		let mut inflight = InflightSet::default();
		assert!(inflight.begin(4));
		assert!(!inflight.begin(4));
		inflight.end(4);
		assert!(inflight.begin(4));
		assert_eq!(inflight.len(), 1);
	}
}
