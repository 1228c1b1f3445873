use crate::val::{Metadata, NounKind, VerbKind, Vector};
use serde::{Deserialize, Serialize};

/// A noun: an entity with an embedding vector and a kind tag.
///
/// The metadata object lives in its own record so that the vector can be
/// fetched without dragging the metadata along, and vice versa.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Noun {
	pub id: String,
	pub kind: NounKind,
	pub vector: Vector,
	/// Unix milliseconds.
	pub created_at: i64,
}

/// A verb: a typed, weighted relationship between two nouns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verb {
	pub id: String,
	pub source: String,
	pub target: String,
	pub kind: VerbKind,
	/// Edge weight in [0, 1].
	pub weight: f64,
	/// Optional confidence in [0, 1].
	pub confidence: Option<f64>,
	/// Unix milliseconds.
	pub created_at: i64,
}

impl Verb {
	/// Whether this verb is indistinguishable from another one between the
	/// same endpoints. Parallel edges must differ in kind, weight or
	/// metadata.
	pub fn duplicates(&self, other: &Verb, own_meta: &Metadata, other_meta: &Metadata) -> bool {
		self.source == other.source
			&& self.target == other.target
			&& self.kind == other.kind
			&& self.weight == other.weight
			&& own_meta == other_meta
	}
}
