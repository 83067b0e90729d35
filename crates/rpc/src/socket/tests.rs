use std::sync::Arc;

use serde::ser::{Error as _, Serializer};

use super::*;

struct Unrepresentable;

impl Serialize for Unrepresentable {
	fn serialize<S: Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
		Err(S::Error::custom("no msgpack form"))
	}
}

#[tokio::test]
async fn closed_socket() {
	let socket = PeerSocket::new_closed();
	assert!(socket.is_closed());
	assert!(matches!(socket.notify("log", ("x",)), Err(Error::ServiceStopped)));
	assert!(matches!(socket.call("echo", ("x",)).await, Err(Error::ServiceStopped)));
	assert!(matches!(socket.request::<String>("echo", ("x",)).await, Err(Error::ServiceStopped)));
	socket.close();
	socket.close();
}

#[test]
fn params_shapes() {
	assert_eq!(to_params(&("a", 1), None).unwrap(), vec![Value::from("a"), Value::from(1)]);
	assert_eq!(to_params(&(), None).unwrap(), Vec::<Value>::new());
	assert_eq!(to_params(&"single", None).unwrap(), vec![Value::from("single")]);
	assert_eq!(to_params(&vec![Value::Nil], None).unwrap(), vec![Value::Nil]);
}

#[test]
fn serialize_error_without_fallback() {
	assert!(matches!(to_params(&(Unrepresentable,), None), Err(Error::Serialize(_))));
}

#[test]
fn fallback_replaces_unrepresentable_params() {
	let fallback: Fallback = Arc::new(|msg: &str| msg.contains("no msgpack form").then(|| Value::from("<unrepresentable>")));
	let params = to_params(&(Unrepresentable,), Some(&fallback)).unwrap();
	assert_eq!(params, vec![Value::from("<unrepresentable>")]);

	let refuse: Fallback = Arc::new(|_: &str| None);
	assert!(matches!(to_params(&(Unrepresentable,), Some(&refuse)), Err(Error::Serialize(_))));
}

#[test]
fn fallback_keeps_parameter_count() {
	let fallback: Fallback = Arc::new(|_: &str| Some(Value::from("<x>")));
	let params = to_params(&("a", Unrepresentable), Some(&fallback)).unwrap();
	assert_eq!(params, vec![Value::from("a"), Value::from("<x>")]);

	// A failing nested value replaces its top-level parameter only.
	let params = to_params(&("a", (1, Unrepresentable), 3), Some(&fallback)).unwrap();
	assert_eq!(params, vec![Value::from("a"), Value::from("<x>"), Value::from(3)]);

	// A bare value is a single parameter either way.
	assert_eq!(to_params(&Unrepresentable, Some(&fallback)).unwrap(), vec![Value::from("<x>")]);
	assert!(matches!(to_params(&("a", Unrepresentable), None), Err(Error::Serialize(_))));
}

#[test]
fn optional_params() {
	assert_eq!(to_params(&None::<(u8,)>, None).unwrap(), Vec::<Value>::new());
	assert_eq!(to_params(&Some((1, 2)), None).unwrap(), vec![Value::from(1), Value::from(2)]);
}

#[tokio::test]
async fn serialize_error_fails_only_the_caller() {
	let (tx, mut rx) = mpsc::unbounded_channel();
	let socket = PeerSocket::new(tx, None);
	assert!(matches!(socket.call("echo", (Unrepresentable,)).await, Err(Error::Serialize(_))));
	assert!(matches!(socket.notify("log", (Unrepresentable,)), Err(Error::Serialize(_))));
	assert!(rx.try_recv().is_err());
}
