use std::fmt;

/// Why a context stopped being usable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reason {
	Timedout,
	Cancelled,
}

impl fmt::Display for Reason {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Reason::Timedout => write!(f, "The request deadline has passed"),
			Reason::Cancelled => write!(f, "The request was cancelled"),
		}
	}
}
