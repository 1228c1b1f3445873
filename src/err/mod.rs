use thiserror::Error;
use uuid::Uuid;

/// The semantic class of a failure, independent of the concrete variant.
///
/// Callers branch on the kind: transient failures are retried with backoff,
/// conflicts and permanent failures abort the containing operation, and
/// overloaded / cancelled outcomes are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// The requested record or path has no value.
	NotFound,
	/// A concurrent mutation was detected or an invariant would be violated.
	Conflict,
	/// An I/O or timeout failure that may succeed on retry.
	Transient,
	/// Corruption, invariant violation or misconfiguration. Never retried.
	Permanent,
	/// A queue or rate limit was exceeded; the caller should back off.
	Overloaded,
	/// The operation was aborted at a suspension point.
	Cancelled,
}

/// The error type of every fallible operation in the engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The request was aborted through its cancellation context
	#[error("The request was cancelled")]
	Cancelled,

	/// The request did not complete before its deadline
	#[error("The request did not complete before its deadline")]
	Timedout,

	/// Too many callers are queued for the cache
	#[error("The engine is overloaded: {queued} callers are already queued")]
	Overloaded {
		queued: usize,
	},

	/// There was no blob stored under the given path
	#[error("There was no blob stored at '{0}'")]
	BlobNotFound(String),

	/// A noun with the given id already exists
	#[error("The noun '{0}' already exists; mutate it with an update")]
	NounAlreadyExists(String),

	/// A relationship referenced a noun which does not exist
	#[error("The {side} noun '{id}' of the relationship does not exist")]
	VerbEndpointMissing {
		side: &'static str,
		id: String,
	},

	/// A parallel relationship must differ from the existing ones
	#[error(
		"A relationship between '{rel_source}' and '{target}' with the same kind, weight and metadata already exists"
	)]
	VerbNotDistinct {
		rel_source: String,
		target: String,
	},

	/// A vector did not match the dimensionality of the index
	#[error("The vector has {found} dimensions where {expected} were expected")]
	VectorDimension {
		expected: usize,
		found: usize,
	},

	/// The dense integer id space is exhausted
	#[error("The entity integer id space of 2^32 ids is exhausted")]
	IdSpaceExhausted,

	/// A persisted structure failed its checksum verification
	#[error("Checksum mismatch while reading {what} (failure id {failure})")]
	ChecksumMismatch {
		what: String,
		failure: Uuid,
	},

	/// A persisted structure could not be interpreted
	#[error("Corrupted {component}: {message} (failure id {failure})")]
	Corrupted {
		component: &'static str,
		message: String,
		failure: Uuid,
	},

	/// Retries on a transient failure were exhausted
	#[error("Gave up after {attempts} attempts: {last} (history: {history:?})")]
	RetriesExhausted {
		attempts: u32,
		last: Box<Error>,
		history: Vec<String>,
	},

	/// There was an invalid argument to an engine call
	#[error("Invalid argument '{name}': {message}")]
	InvalidArgument {
		name: &'static str,
		message: String,
	},

	/// The engine is missing a collaborator or setting the call requires
	#[error("The engine is misconfigured: {0}")]
	Misconfiguration(String),

	/// The requested capability is not available on this engine
	#[error("Unsupported: {0}")]
	Unsupported(String),

	/// A value could not be encoded into its binary container
	#[error("Encoding error: {0}")]
	Encode(String),

	/// A value could not be decoded from its binary container
	#[error("Decoding error: {0}")]
	Decode(String),

	/// A filesystem or network I/O call failed
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// The underlying object store reported a failure
	#[error("Object store error: {0}")]
	ObjectStore(object_store::Error),

	/// The supplied storage location could not be parsed
	#[error("Invalid storage url '{url}': {message}")]
	InvalidUrl {
		url: String,
		message: String,
	},

	/// The internals produced an unreachable state
	#[error("Unreachable: {0}")]
	Unreachable(&'static str),
}

impl Error {
	/// Map this failure onto its semantic class.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Cancelled => ErrorKind::Cancelled,
			Self::Timedout => ErrorKind::Transient,
			Self::Overloaded {
				..
			} => ErrorKind::Overloaded,
			Self::BlobNotFound(_) => ErrorKind::NotFound,
			Self::NounAlreadyExists(_)
			| Self::VerbEndpointMissing {
				..
			}
			| Self::VerbNotDistinct {
				..
			} => ErrorKind::Conflict,
			Self::Io(_) => ErrorKind::Transient,
			Self::ObjectStore(e) => match e {
				object_store::Error::NotFound {
					..
				} => ErrorKind::NotFound,
				object_store::Error::AlreadyExists {
					..
				} => ErrorKind::Conflict,
				_ => ErrorKind::Transient,
			},
			_ => ErrorKind::Permanent,
		}
	}

	/// Whether this failure is worth retrying.
	pub fn is_transient(&self) -> bool {
		self.kind() == ErrorKind::Transient
	}

	/// Build a corruption error carrying a fresh opaque failure id. The id is
	/// logged together with the full context so the failure can be retrieved
	/// out of band.
	pub fn corrupted(component: &'static str, message: impl Into<String>) -> Self {
		let failure = Uuid::new_v4();
		let message = message.into();
		error!("Corrupted {component}: {message} (failure id {failure})");
		Self::Corrupted {
			component,
			message,
			failure,
		}
	}

	/// Build a checksum-mismatch error carrying a fresh opaque failure id.
	pub fn checksum(what: impl Into<String>) -> Self {
		let failure = Uuid::new_v4();
		let what = what.into();
		error!("Checksum mismatch while reading {what} (failure id {failure})");
		Self::ChecksumMismatch {
			what,
			failure,
		}
	}
}

impl From<object_store::Error> for Error {
	fn from(e: object_store::Error) -> Self {
		Self::ObjectStore(e)
	}
}

impl From<rmp_serde::encode::Error> for Error {
	fn from(e: rmp_serde::encode::Error) -> Self {
		Self::Encode(e.to_string())
	}
}

impl From<rmp_serde::decode::Error> for Error {
	fn from(e: rmp_serde::decode::Error) -> Self {
		Self::Decode(e.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kinds_follow_the_taxonomy() {
		assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
		assert_eq!(Error::Timedout.kind(), ErrorKind::Transient);
		assert_eq!(
			Error::Overloaded {
				queued: 9
			}
			.kind(),
			ErrorKind::Overloaded
		);
		assert_eq!(Error::BlobNotFound("noun/x".into()).kind(), ErrorKind::NotFound);
		assert_eq!(
			Error::VerbEndpointMissing {
				side: "source",
				id: "a".into()
			}
			.kind(),
			ErrorKind::Conflict
		);
		assert_eq!(
			Error::VectorDimension {
				expected: 384,
				found: 3
			}
			.kind(),
			ErrorKind::Permanent
		);
		assert_eq!(Error::checksum("sstable 7").kind(), ErrorKind::Permanent);
		assert_eq!(Error::IdSpaceExhausted.kind(), ErrorKind::Permanent);
	}
}
