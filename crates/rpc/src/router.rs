//! Method-name dispatch for inbound requests and notifications.
//!
//! A [`Router`] is the explicit mapping from method name to handler that the
//! main loop dispatches into. Each handler declares its [`Arity`] and whether
//! it wants the request msgid at registration time.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use rmpv::Value;
use tower_service::Service;

use crate::error::HandlerError;

/// An inbound call handed to the service by the main loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
	/// Request msgid; `None` for notifications.
	pub msgid: Option<u32>,
	/// Method name.
	pub method: String,
	/// Positional parameters.
	pub params: Vec<Value>,
}

impl Call {
	/// Returns true if no response will be written for this call.
	#[must_use]
	pub fn is_notification(&self) -> bool {
		self.msgid.is_none()
	}
}

/// Accepted positional parameter counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
	/// Exactly `n` parameters.
	Exact(usize),
	/// Between `min` and `max` parameters, inclusive.
	Range(usize, usize),
	/// At least `n` parameters.
	AtLeast(usize),
	/// Any number of parameters.
	Any,
}

impl Arity {
	/// Returns true if `n` parameters are accepted.
	#[must_use]
	pub fn accepts(self, n: usize) -> bool {
		match self {
			Self::Exact(m) => n == m,
			Self::Range(min, max) => (min..=max).contains(&n),
			Self::AtLeast(min) => n >= min,
			Self::Any => true,
		}
	}
}

impl fmt::Display for Arity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Exact(n) => write!(f, "{n}"),
			Self::Range(min, max) => write!(f, "{min} to {max}"),
			Self::AtLeast(n) => write!(f, "at least {n}"),
			Self::Any => f.write_str("any number"),
		}
	}
}

type BoxHandler<St> = Box<dyn Fn(St, Option<u32>, Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

struct Entry<St> {
	arity: Arity,
	wants_msgid: bool,
	handler: BoxHandler<St>,
}

/// Remote method table over a shared state `St`.
///
/// `St` is cloned into each handler invocation, so it is usually an `Arc`.
pub struct Router<St> {
	state: St,
	methods: Arc<HashMap<String, Entry<St>>>,
}

impl<St: Clone> Clone for Router<St> {
	fn clone(&self) -> Self {
		Self {
			state: self.state.clone(),
			methods: Arc::clone(&self.methods),
		}
	}
}

impl<St> fmt::Debug for Router<St> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut names: Vec<_> = self.methods.keys().collect();
		names.sort();
		f.debug_struct("Router").field("methods", &names).finish_non_exhaustive()
	}
}

impl<St> Router<St>
where
	St: Clone + Send + Sync + 'static,
{
	/// Creates an empty router.
	#[must_use]
	pub fn new(state: St) -> Self {
		Self {
			state,
			methods: Arc::new(HashMap::new()),
		}
	}

	fn insert(&mut self, name: &str, entry: Entry<St>) -> &mut Self {
		let methods = Arc::get_mut(&mut self.methods).expect("router is not shared while registering methods");
		if methods.insert(name.to_owned(), entry).is_some() {
			tracing::warn!(method = name, "replacing previously registered method");
		}
		self
	}

	/// Registers a handler receiving the positional parameters.
	///
	/// # Panics
	///
	/// Panics if the router has already been cloned.
	pub fn method<F, Fut>(&mut self, name: &str, arity: Arity, handler: F) -> &mut Self
	where
		F: Fn(St, Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
	{
		self.insert(
			name,
			Entry {
				arity,
				wants_msgid: false,
				handler: Box::new(move |state, _, params| handler(state, params).boxed()),
			},
		)
	}

	/// Registers a handler that also receives the request msgid.
	///
	/// The msgid is `None` when the method is invoked as a notification.
	///
	/// # Panics
	///
	/// Panics if the router has already been cloned.
	pub fn method_with_id<F, Fut>(&mut self, name: &str, arity: Arity, handler: F) -> &mut Self
	where
		F: Fn(St, Option<u32>, Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
	{
		self.insert(
			name,
			Entry {
				arity,
				wants_msgid: true,
				handler: Box::new(move |state, msgid, params| handler(state, msgid, params).boxed()),
			},
		)
	}

	/// Returns true if `name` is registered.
	#[must_use]
	pub fn contains(&self, name: &str) -> bool {
		self.methods.contains_key(name)
	}

	/// Returns true if the handler for `name` declared the msgid capability.
	#[must_use]
	pub fn wants_msgid(&self, name: &str) -> Option<bool> {
		self.methods.get(name).map(|e| e.wants_msgid)
	}
}

impl<St> Service<Call> for Router<St>
where
	St: Clone + Send + Sync + 'static,
{
	type Response = Value;
	type Error = HandlerError;
	type Future = BoxFuture<'static, Result<Value, HandlerError>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, call: Call) -> Self::Future {
		let Some(entry) = self.methods.get(&call.method) else {
			let err = HandlerError::method_not_found(&call.method);
			return futures::future::ready(Err(err)).boxed();
		};
		if !entry.arity.accepts(call.params.len()) {
			let err = HandlerError::wrong_arity(&call.method, entry.arity, call.params.len());
			return futures::future::ready(Err(err)).boxed();
		}
		let msgid = if entry.wants_msgid { call.msgid } else { None };
		(entry.handler)(self.state.clone(), msgid, call.params)
	}
}
