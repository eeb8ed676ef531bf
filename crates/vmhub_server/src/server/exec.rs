#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{error, trace};

type OwnerTask<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

/// Single-owner executor binding one piece of mutable state to a FIFO of
/// tasks. Tasks may be submitted from any task or thread; they run one at a
/// time, in submission order, with exclusive access to the state. All
/// cross-resource coordination in the server is expressed as chains of
/// dispatches between owners; the state behind an `Owner` is never guarded
/// by a lock.
pub struct Owner<S> {
	name: &'static str,
	tx: mpsc::UnboundedSender<OwnerTask<S>>,
}

impl<S> Clone for Owner<S> {
	fn clone(&self) -> Self {
		Self {
			name: self.name,
			tx: self.tx.clone(),
		}
	}
}

impl<S: Send + 'static> Owner<S> {
	/// Spawn the consumer task for `state`.
	pub fn spawn(name: &'static str, mut state: S) -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel::<OwnerTask<S>>();

		tokio::spawn(async move {
			while let Some(task) = rx.recv().await {
				// A panicking task must not take the owner (and every queued
				// task behind it) down with it.
				if let Err(panic) = AssertUnwindSafe(task(&mut state)).catch_unwind().await {
					let what = panic
						.downcast_ref::<&str>()
						.map(|s| (*s).to_string())
						.or_else(|| panic.downcast_ref::<String>().cloned())
						.unwrap_or_else(|| "non-string panic payload".to_string());
					error!(owner = name, panic = %what, "task panicked; owner continues");
					metrics::counter!("vmhub_server_owner_task_panics_total").increment(1);
				}
			}
			trace!(owner = name, "owner drained");
		});

		Self { name, tx }
	}

	/// Enqueue a task with exclusive access to the state.
	pub fn dispatch(&self, f: impl FnOnce(&mut S) + Send + 'static) {
		self.dispatch_async(move |state| {
			f(state);
			std::future::ready(()).boxed()
		});
	}

	/// Enqueue a task that may await (a DB hop, a timer). The owner still
	/// runs tasks strictly one at a time; an await inside a task delays
	/// every task queued behind it.
	pub fn dispatch_async<F>(&self, f: F)
	where
		F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
	{
		if self.tx.send(Box::new(f)).is_err() {
			trace!(owner = self.name, "dispatch to stopped owner dropped");
		}
	}

	/// Run a task and await its result from the calling context. Each call
	/// is one observable suspension boundary; the world may have changed by
	/// the time the result arrives, so callers re-validate what they learn.
	pub async fn query<R, F>(&self, f: F) -> Option<R>
	where
		R: Send + 'static,
		F: FnOnce(&mut S) -> R + Send + 'static,
	{
		let (tx, rx) = tokio::sync::oneshot::channel();
		self.dispatch(move |state| {
			let _ = tx.send(f(state));
		});
		rx.await.ok()
	}

	/// Produce a single-use callback that hops a value back onto this
	/// owner. Used when another owner finishes a piece of work whose result
	/// belongs to this owner's state.
	pub fn wrap<T, F>(&self, f: F) -> impl FnOnce(T) + Send + 'static
	where
		T: Send + 'static,
		F: FnOnce(&mut S, T) + Send + 'static,
	{
		let owner = self.clone();
		move |value: T| {
			owner.dispatch(move |state| f(state, value));
		}
	}
}
