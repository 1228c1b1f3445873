use crate::cnf;
use crate::err::Error;
use crate::idx::bloom::Bloom;
use crate::val::Scalar;
use bytes::Bytes;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The (min, max, count, has-nulls) summary of a chunk's value domain,
/// used to skip chunks without fetching them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneMap {
	pub min: Scalar,
	pub max: Scalar,
	/// Distinct values in the chunk.
	pub count: u32,
	pub has_nulls: bool,
}

impl ZoneMap {
	pub fn covers(&self, value: &Scalar) -> bool {
		if value.is_null() {
			self.has_nulls
		} else {
			*value >= self.min && *value <= self.max
		}
	}

	/// Whether [lo, hi] intersects this zone. Unbounded ends always match.
	pub fn intersects(&self, lo: Option<&Scalar>, hi: Option<&Scalar>) -> bool {
		if let Some(lo) = lo {
			if self.max < *lo {
				return false;
			}
		}
		if let Some(hi) = hi {
			if self.min > *hi {
				return false;
			}
		}
		true
	}
}

/// The stable byte form of a value, probed against chunk bloom filters.
pub(super) fn scalar_key(value: &Scalar) -> Vec<u8> {
	// Display forms collide across types ("1" vs 1); tag with the variant
	let mut key = vec![match value {
		Scalar::Null => 0u8,
		Scalar::Bool(_) => 1,
		Scalar::Int(_) => 2,
		Scalar::Float(_) => 3,
		Scalar::Str(_) => 4,
	}];
	key.extend_from_slice(value.to_string().as_bytes());
	key
}

/// One chunk body: the posting lists of a contiguous slice of a field's
/// value domain.
#[derive(Debug)]
pub(super) struct Chunk {
	pub(super) chunk_id: u64,
	pub(super) entries: BTreeMap<Scalar, RoaringBitmap>,
}

#[derive(Serialize, Deserialize)]
struct ChunkState {
	version: u16,
	chunk_id: u64,
	field: String,
	/// value → roaring bitmap in the portable serialisation.
	entries: Vec<(Scalar, Vec<u8>)>,
	/// Unix milliseconds.
	last_updated: i64,
}

impl Chunk {
	pub(super) fn new(chunk_id: u64) -> Self {
		Self {
			chunk_id,
			entries: BTreeMap::new(),
		}
	}

	pub(super) fn insert(&mut self, value: &Scalar, noun: u32) -> bool {
		self.entries.entry(value.clone()).or_default().insert(noun)
	}

	/// Remove a posting, dropping the value when its list empties.
	pub(super) fn remove(&mut self, value: &Scalar, noun: u32) -> bool {
		let Some(bitmap) = self.entries.get_mut(value) else {
			return false;
		};
		let removed = bitmap.remove(noun);
		if bitmap.is_empty() {
			self.entries.remove(value);
		}
		removed
	}

	/// Distinct values in the chunk.
	pub(super) fn distinct(&self) -> usize {
		self.entries.len()
	}

	pub(super) fn zone(&self) -> ZoneMap {
		let has_nulls = self.entries.contains_key(&Scalar::Null);
		let mut non_null = self.entries.keys().filter(|k| !k.is_null());
		let min = non_null.next().cloned().unwrap_or(Scalar::Null);
		let max = self.entries.keys().filter(|k| !k.is_null()).next_back().cloned().unwrap_or(Scalar::Null);
		ZoneMap {
			min,
			max,
			count: self.entries.len() as u32,
			has_nulls,
		}
	}

	pub(super) fn bloom(&self) -> Bloom {
		let mut bloom = Bloom::new(self.entries.len().max(1), cnf::BLOOM_TARGET_FPR);
		for value in self.entries.keys() {
			bloom.insert(&scalar_key(value));
		}
		bloom
	}

	pub(super) fn encode(&self, field: &str) -> Result<Bytes, Error> {
		let mut entries = Vec::with_capacity(self.entries.len());
		for (value, bitmap) in &self.entries {
			let mut bytes = Vec::with_capacity(bitmap.serialized_size());
			bitmap.serialize_into(&mut bytes).map_err(|e| Error::Encode(e.to_string()))?;
			entries.push((value.clone(), bytes));
		}
		let state = ChunkState {
			version: 1,
			chunk_id: self.chunk_id,
			field: field.to_owned(),
			entries,
			last_updated: chrono::Utc::now().timestamp_millis(),
		};
		Ok(Bytes::from(rmp_serde::to_vec_named(&state)?))
	}

	pub(super) fn decode(data: &[u8]) -> Result<Self, Error> {
		let state: ChunkState = rmp_serde::from_slice(data)?;
		let mut entries = BTreeMap::new();
		for (value, bytes) in state.entries {
			let bitmap = RoaringBitmap::deserialize_from(&bytes[..])
				.map_err(|e| Error::corrupted("metadata chunk", e.to_string()))?;
			entries.insert(value, bitmap);
		}
		Ok(Self {
			chunk_id: state.chunk_id,
			entries,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zone_maps_summarise_the_value_domain() {
		let mut chunk = Chunk::new(1);
		chunk.insert(&Scalar::Int(5), 1);
		chunk.insert(&Scalar::Int(9), 2);
		chunk.insert(&Scalar::Null, 3);
		let zone = chunk.zone();
		assert_eq!(zone.min, Scalar::Int(5));
		assert_eq!(zone.max, Scalar::Int(9));
		assert_eq!(zone.count, 3);
		assert!(zone.has_nulls);
		assert!(zone.covers(&Scalar::Int(7)));
		assert!(zone.covers(&Scalar::Null));
		assert!(!zone.covers(&Scalar::Int(10)));
		assert!(zone.intersects(Some(&Scalar::Int(9)), None));
		assert!(!zone.intersects(Some(&Scalar::Int(10)), None));
		assert!(!zone.intersects(None, Some(&Scalar::Int(4))));
	}

	#[test]
	fn chunks_round_trip_with_portable_bitmaps() {
		let mut chunk = Chunk::new(7);
		for noun in 0..100u32 {
			chunk.insert(&Scalar::from("x"), noun);
		}
		chunk.insert(&Scalar::Float(2.5), 3);
		let encoded = chunk.encode("org").unwrap();
		let decoded = Chunk::decode(&encoded).unwrap();
		assert_eq!(decoded.chunk_id, 7);
		assert_eq!(decoded.entries, chunk.entries);
	}

	#[test]
	fn removal_drops_empty_posting_lists() {
		let mut chunk = Chunk::new(1);
		chunk.insert(&Scalar::Int(1), 10);
		assert!(chunk.remove(&Scalar::Int(1), 10));
		assert!(!chunk.remove(&Scalar::Int(1), 10));
		assert_eq!(chunk.distinct(), 0);
	}

	#[test]
	fn bloom_probes_follow_value_identity() {
		let mut chunk = Chunk::new(1);
		chunk.insert(&Scalar::Int(1), 1);
		chunk.insert(&Scalar::from("1"), 2);
		let bloom = chunk.bloom();
		assert!(bloom.might_contain(&scalar_key(&Scalar::Int(1))));
		assert!(bloom.might_contain(&scalar_key(&Scalar::from("1"))));
		// The int and string forms of "1" are distinct keys
		assert_ne!(scalar_key(&Scalar::Int(1)), scalar_key(&Scalar::from("1")));
	}
}
