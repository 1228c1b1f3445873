mod reason;

pub use reason::Reason;

use crate::err::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cancellation context carried through every public async operation.
///
/// A context is cheap to clone; clones share the cancellation flag. Deadline
/// and cancellation are checked at each suspension point (adapter I/O, cache
/// fills, the pre-compaction yield and beam-search vector fetches); all other
/// code runs to completion without observing the context.
#[derive(Clone, Debug)]
pub struct Context {
	// An optional deadline.
	deadline: Option<Instant>,
	// Whether or not this context is cancelled.
	cancelled: Arc<AtomicBool>,
}

impl Default for Context {
	fn default() -> Self {
		Self::background()
	}
}

impl Context {
	/// Create an empty background context.
	pub fn background() -> Self {
		Self {
			deadline: None,
			cancelled: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Create a child context, inheriting the parent deadline.
	pub fn child(&self) -> Self {
		Self {
			deadline: self.deadline,
			cancelled: self.cancelled.clone(),
		}
	}

	/// Create a context which expires after the given timeout.
	pub fn with_timeout(timeout: Duration) -> Self {
		Self {
			deadline: Instant::now().checked_add(timeout),
			cancelled: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Add a deadline to this context, keeping the earlier one if a deadline
	/// is already set.
	pub fn with_deadline(mut self, deadline: Instant) -> Self {
		self.deadline = match self.deadline {
			Some(d) => Some(d.min(deadline)),
			None => Some(deadline),
		};
		self
	}

	/// Cancel this context and every clone of it.
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::Relaxed);
	}

	/// Check why the context is done, if it is.
	pub fn done(&self) -> Option<Reason> {
		if self.cancelled.load(Ordering::Relaxed) {
			return Some(Reason::Cancelled);
		}
		if let Some(deadline) = self.deadline {
			if deadline <= Instant::now() {
				return Some(Reason::Timedout);
			}
		}
		None
	}

	/// Fail if the context is cancelled or past its deadline.
	pub fn check(&self) -> Result<(), Error> {
		match self.done() {
			Some(Reason::Cancelled) => Err(Error::Cancelled),
			Some(Reason::Timedout) => Err(Error::Timedout),
			None => Ok(()),
		}
	}

	/// The time remaining until the deadline, capped at the given default.
	pub fn remaining(&self, default: Duration) -> Duration {
		match self.deadline {
			Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(default),
			None => default,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn background_is_never_done() {
		let ctx = Context::background();
		assert!(ctx.done().is_none());
		assert!(ctx.check().is_ok());
	}

	#[test]
	fn cancellation_is_shared_with_clones() {
		let ctx = Context::background();
		let child = ctx.child();
		ctx.cancel();
		assert_eq!(child.done(), Some(Reason::Cancelled));
		assert!(matches!(child.check(), Err(Error::Cancelled)));
	}

	#[test]
	fn an_elapsed_deadline_times_out() {
		let ctx = Context::background().with_deadline(Instant::now());
		assert_eq!(ctx.done(), Some(Reason::Timedout));
		assert!(matches!(ctx.check(), Err(Error::Timedout)));
	}
}
