use crate::ctx::Context;
use crate::err::Error;
use crate::idx::hnsw::{HnswIndex, HnswParams};
use crate::idx::ids::NounInt;
use crate::obs::Store;
use crate::val::{NounKind, SharedVector, Vector};
use hashbrown::HashMap;
use roaring::RoaringBitmap;

/// The kind-aware vector index: either a single graph over every noun, or
/// one graph per noun kind.
///
/// Partitioning bounds the size of each graph and lets a single-kind query
/// touch only its own partition; a multi-kind query fans out over the
/// relevant partitions and merges the sub-results by distance.
pub struct KindHnsw {
	partitioned: bool,
	params: HnswParams,
	indexes: HashMap<Option<NounKind>, HnswIndex>,
}

impl KindHnsw {
	pub fn new(params: &HnswParams, partitioned: bool) -> Self {
		Self {
			partitioned,
			params: params.clone(),
			indexes: HashMap::default(),
		}
	}

	fn slot(&self, kind: NounKind) -> Option<NounKind> {
		if self.partitioned {
			Some(kind)
		} else {
			None
		}
	}

	pub fn insert(
		&mut self,
		kind: NounKind,
		noun: NounInt,
		vector: SharedVector,
	) -> Result<(), Error> {
		let slot = self.slot(kind);
		let index =
			self.indexes.entry(slot).or_insert_with(|| HnswIndex::new(&self.params));
		index.insert(noun, vector)
	}

	pub fn remove(&mut self, kind: NounKind, noun: NounInt) -> bool {
		let slot = self.slot(kind);
		match self.indexes.get_mut(&slot) {
			Some(index) => index.remove(noun),
			None => false,
		}
	}

	pub fn get_vector(&self, kind: NounKind, noun: NounInt) -> Option<&SharedVector> {
		self.indexes.get(&self.slot(kind))?.get_vector(noun)
	}

	/// Total indexed nouns across every partition.
	pub fn len(&self) -> usize {
		self.indexes.values().map(HnswIndex::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Search the index, optionally restricted to a set of kinds and to a
	/// candidate bitmap. Sub-results merge by distance, ties by noun id.
	pub fn search(
		&self,
		q: &Vector,
		k: usize,
		ef: usize,
		kinds: Option<&[NounKind]>,
		candidates: Option<&RoaringBitmap>,
	) -> Vec<(f64, NounInt)> {
		let slots: Vec<Option<NounKind>> = match (self.partitioned, kinds) {
			(false, _) => vec![None],
			(true, Some(kinds)) => kinds.iter().map(|k| Some(*k)).collect(),
			(true, None) => self.indexes.keys().copied().collect(),
		};
		let mut merged = Vec::new();
		for slot in slots {
			if let Some(index) = self.indexes.get(&slot) {
				let res = match candidates {
					Some(bitmap) => index.knn_search_filtered(q, k, ef, bitmap),
					None => index.knn_search(q, k, ef),
				};
				merged.extend(res);
			}
		}
		merged.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
		merged.truncate(k);
		merged
	}

	pub async fn save(&mut self, store: &Store, ctx: &Context) -> Result<(), Error> {
		for (slot, index) in self.indexes.iter_mut() {
			index.save(store, ctx, *slot).await?;
		}
		Ok(())
	}

	/// Restore every persisted partition.
	pub async fn load(
		store: &Store,
		ctx: &Context,
		params: &HnswParams,
		partitioned: bool,
	) -> Result<Self, Error> {
		let mut kinds = Self::new(params, partitioned);
		if partitioned {
			for kind in NounKind::ALL {
				let index = HnswIndex::load(store, ctx, Some(kind), params).await?;
				if !index.is_empty() {
					kinds.indexes.insert(Some(kind), index);
				}
			}
		} else {
			let index = HnswIndex::load(store, ctx, None, params).await?;
			if !index.is_empty() {
				kinds.indexes.insert(None, index);
			}
		}
		Ok(kinds)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::val::Distance;
	use rand::prelude::SmallRng;
	use rand::{Rng, SeedableRng};

	fn vec_at(rng: &mut SmallRng, center: f32) -> SharedVector {
		Vector::new((0..4).map(|_| center + rng.gen_range(-0.01f32..0.01f32)).collect()).into()
	}

	#[test]
	fn single_kind_queries_stay_in_their_partition() {
		let params = HnswParams::new(4, Distance::Euclidean, 8);
		let mut kinds = KindHnsw::new(&params, true);
		let mut rng = SmallRng::seed_from_u64(3);
		// People cluster at 0.0, documents at 1.0
		for noun in 0..20u32 {
			kinds.insert(NounKind::Person, noun, vec_at(&mut rng, 0.0)).unwrap();
		}
		for noun in 20..40u32 {
			kinds.insert(NounKind::Document, noun, vec_at(&mut rng, 1.0)).unwrap();
		}
		let q = Vector::new(vec![0.0; 4]);
		// Documents are far from the query, yet a document-only search must
		// return documents
		let res = kinds.search(&q, 5, 50, Some(&[NounKind::Document]), None);
		assert_eq!(res.len(), 5);
		assert!(res.iter().all(|(_, n)| *n >= 20));
	}

	#[test]
	fn multi_kind_queries_merge_by_distance() {
		let params = HnswParams::new(4, Distance::Euclidean, 8);
		let mut kinds = KindHnsw::new(&params, true);
		let mut rng = SmallRng::seed_from_u64(4);
		for noun in 0..10u32 {
			kinds.insert(NounKind::Person, noun, vec_at(&mut rng, 0.0)).unwrap();
		}
		for noun in 10..20u32 {
			kinds.insert(NounKind::Document, noun, vec_at(&mut rng, 1.0)).unwrap();
		}
		let q = Vector::new(vec![0.0; 4]);
		let res = kinds.search(&q, 15, 50, None, None);
		assert_eq!(res.len(), 15);
		// The near cluster comes first
		assert!(res[..10].iter().all(|(_, n)| *n < 10));
		for pair in res.windows(2) {
			assert!(pair[0].0 <= pair[1].0);
		}
	}
}
