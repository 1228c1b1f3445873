//! The chunked metadata index: for every indexed field, a sparse directory
//! of chunk descriptors (zone map + bloom filter) over chunk bodies mapping
//! values to roaring-bitmap posting lists of noun integers. Equality and
//! range predicates resolve to bitmaps; conjunctions intersect them, and the
//! result is the pre-filter of a filtered vector search.

mod chunk;

pub use chunk::ZoneMap;

use crate::cache::CacheManager;
use crate::cnf;
use crate::ctx::Context;
use crate::err::Error;
use crate::idx::bloom::Bloom;
use crate::idx::ftype::FieldTypes;
use crate::idx::ids::NounInt;
use crate::idx::meta::chunk::{scalar_key, Chunk};
use crate::obs::{paths, Store};
use crate::val::{Metadata, Scalar, Value};
use async_recursion::async_recursion;
use hashbrown::{HashMap, HashSet};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A structured predicate over indexed metadata fields.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
	/// field = value
	Eq(String, Scalar),
	/// field ∈ [lo, hi], both ends inclusive when present.
	Range {
		field: String,
		lo: Option<Scalar>,
		hi: Option<Scalar>,
	},
	And(Vec<Filter>),
	Or(Vec<Filter>),
}

/// A chunk descriptor held in a field's sparse directory.
struct ChunkDescriptor {
	chunk_id: u64,
	zone: ZoneMap,
	bloom: Bloom,
}

#[derive(Serialize, Deserialize)]
struct DescriptorState {
	chunk_id: u64,
	zone: ZoneMap,
	bloom: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SparseState {
	version: u16,
	field: String,
	next_chunk_id: u64,
	descriptors: Vec<DescriptorState>,
}

/// One field's sparse index plus its loaded chunk bodies.
struct FieldIndex {
	field: String,
	next_chunk_id: u64,
	/// Sorted by zone minimum; the routing order.
	descriptors: Vec<ChunkDescriptor>,
	chunks: HashMap<u64, Chunk>,
	dirty_chunks: HashSet<u64>,
	deleted_chunks: Vec<u64>,
	dir_dirty: bool,
}

impl FieldIndex {
	fn new(field: &str) -> Self {
		Self {
			field: field.to_owned(),
			next_chunk_id: 0,
			descriptors: Vec::new(),
			chunks: HashMap::default(),
			dirty_chunks: HashSet::default(),
			deleted_chunks: Vec::new(),
			dir_dirty: false,
		}
	}

	/// The position of the chunk a value routes to: the last descriptor
	/// whose zone minimum does not exceed the value.
	fn route(&self, value: &Scalar) -> Option<usize> {
		if self.descriptors.is_empty() {
			return None;
		}
		let idx = self.descriptors.partition_point(|d| d.zone.min <= *value);
		Some(idx.saturating_sub(1))
	}

	fn sort_descriptors(&mut self) {
		self.descriptors.sort_by(|a, b| a.zone.min.cmp(&b.zone.min));
	}
}

/// The metadata index across every indexed field. A single writer mutates
/// it; readers query concurrently through a shared reference.
pub struct MetadataIndex {
	store: Arc<Store>,
	cache: Arc<CacheManager>,
	fields: HashMap<String, FieldIndex>,
	ftypes: FieldTypes,
}

impl MetadataIndex {
	/// Restore the sparse directories and field-type records. Chunk bodies
	/// load lazily.
	pub async fn open(
		store: Arc<Store>,
		cache: Arc<CacheManager>,
		ctx: &Context,
	) -> Result<Self, Error> {
		let mut fields = HashMap::default();
		for path in store.list_prefix(ctx, "sparse").await? {
			let Some(state) = store.get_record::<SparseState>(ctx, &path).await? else {
				continue;
			};
			let mut index = FieldIndex::new(&state.field);
			index.next_chunk_id = state.next_chunk_id;
			for desc in state.descriptors {
				index.descriptors.push(ChunkDescriptor {
					chunk_id: desc.chunk_id,
					zone: desc.zone,
					bloom: Bloom::decode(&desc.bloom)?,
				});
			}
			index.sort_descriptors();
			fields.insert(state.field, index);
		}
		let ftypes = FieldTypes::open(&store, ctx).await?;
		Ok(Self {
			store,
			cache,
			fields,
			ftypes,
		})
	}

	/// The inferred type record of a field, if one exists.
	pub fn field_type(&self, field: &str) -> Option<&crate::idx::ftype::FieldTypeRecord> {
		self.ftypes.get(field)
	}

	/// How many chunks exist across all fields.
	pub fn chunk_count(&self) -> usize {
		self.fields.values().map(|f| f.descriptors.len()).sum()
	}

	/// Index every leaf of a noun's metadata.
	pub async fn insert_metadata(
		&mut self,
		ctx: &Context,
		noun: NounInt,
		metadata: &Metadata,
	) -> Result<(), Error> {
		let now = chrono::Utc::now().timestamp_millis();
		for (field, value) in metadata {
			self.ftypes.observe(field, value, now);
			let mut leaves = Vec::new();
			value.leaves(field, &mut leaves);
			for (path, scalar) in leaves {
				self.insert_one(ctx, &path, scalar, noun).await?;
			}
		}
		Ok(())
	}

	/// Remove every leaf of a noun's metadata from the index.
	pub async fn remove_metadata(
		&mut self,
		ctx: &Context,
		noun: NounInt,
		metadata: &Metadata,
	) -> Result<(), Error> {
		for (field, value) in metadata {
			let mut leaves = Vec::new();
			value.leaves(field, &mut leaves);
			for (path, scalar) in leaves {
				self.remove_one(ctx, &path, scalar, noun).await?;
			}
		}
		Ok(())
	}

	async fn insert_one(
		&mut self,
		ctx: &Context,
		field: &str,
		value: &Scalar,
		noun: NounInt,
	) -> Result<(), Error> {
		let index = self.fields.entry(field.to_owned()).or_insert_with(|| FieldIndex::new(field));
		let chunk_id = match index.route(value) {
			Some(pos) => index.descriptors[pos].chunk_id,
			None => {
				// First chunk of the field
				let chunk_id = index.next_chunk_id;
				index.next_chunk_id += 1;
				let chunk = Chunk::new(chunk_id);
				index.descriptors.push(ChunkDescriptor {
					chunk_id,
					zone: chunk.zone(),
					bloom: chunk.bloom(),
				});
				index.chunks.insert(chunk_id, chunk);
				index.dir_dirty = true;
				chunk_id
			}
		};
		Self::load_chunk(&self.cache, index, field, chunk_id, ctx).await?;
		let chunk = index.chunks.get_mut(&chunk_id).ok_or(Error::Unreachable("insert_one"))?;
		chunk.insert(value, noun);
		index.dirty_chunks.insert(chunk_id);
		if chunk.distinct() > *cnf::CHUNK_SPLIT_THRESHOLD {
			Self::split_chunk(index, chunk_id);
		}
		Ok(())
	}

	async fn remove_one(
		&mut self,
		ctx: &Context,
		field: &str,
		value: &Scalar,
		noun: NounInt,
	) -> Result<(), Error> {
		let Some(index) = self.fields.get_mut(field) else {
			return Ok(());
		};
		let Some(pos) = index.route(value) else {
			return Ok(());
		};
		let chunk_id = index.descriptors[pos].chunk_id;
		Self::load_chunk(&self.cache, index, field, chunk_id, ctx).await?;
		let chunk = index.chunks.get_mut(&chunk_id).ok_or(Error::Unreachable("remove_one"))?;
		if chunk.remove(value, noun) {
			index.dirty_chunks.insert(chunk_id);
			let distinct = chunk.distinct();
			if distinct < *cnf::CHUNK_MERGE_THRESHOLD && index.descriptors.len() > 1 {
				Self::maybe_merge(&self.cache, index, field, pos, ctx).await?;
			}
		}
		Ok(())
	}

	/// Ensure a chunk body is resident, fetching it through the cache.
	async fn load_chunk(
		cache: &CacheManager,
		index: &mut FieldIndex,
		field: &str,
		chunk_id: u64,
		ctx: &Context,
	) -> Result<(), Error> {
		if index.chunks.contains_key(&chunk_id) {
			return Ok(());
		}
		let chunk = match cache.get(ctx, &paths::chunk(field, chunk_id)).await? {
			Some(bytes) => Chunk::decode(&bytes)?,
			None => Chunk::new(chunk_id),
		};
		index.chunks.insert(chunk_id, chunk);
		Ok(())
	}

	/// Split an over-full chunk at its median value into two fresh chunks.
	/// Chunk ids are monotonic; the replaced id is never reused.
	fn split_chunk(index: &mut FieldIndex, chunk_id: u64) {
		let Some(chunk) = index.chunks.remove(&chunk_id) else {
			return;
		};
		let mut entries: Vec<(Scalar, roaring::RoaringBitmap)> = chunk.entries.into_iter().collect();
		let mid = entries.len() / 2;
		let right_entries = entries.split_off(mid);

		let left_id = index.next_chunk_id;
		let right_id = index.next_chunk_id + 1;
		index.next_chunk_id += 2;

		let mut left = Chunk::new(left_id);
		left.entries = entries.into_iter().collect();
		let mut right = Chunk::new(right_id);
		right.entries = right_entries.into_iter().collect();

		debug!(
			"Splitting chunk {chunk_id} of field '{}' into {left_id} ({} values) and {right_id} ({} values)",
			index.field,
			left.distinct(),
			right.distinct()
		);

		index.descriptors.retain(|d| d.chunk_id != chunk_id);
		for chunk in [&left, &right] {
			index.descriptors.push(ChunkDescriptor {
				chunk_id: chunk.chunk_id,
				zone: chunk.zone(),
				bloom: chunk.bloom(),
			});
		}
		index.sort_descriptors();

		index.dirty_chunks.remove(&chunk_id);
		index.dirty_chunks.insert(left_id);
		index.dirty_chunks.insert(right_id);
		index.deleted_chunks.push(chunk_id);
		index.chunks.insert(left_id, left);
		index.chunks.insert(right_id, right);
		index.dir_dirty = true;
	}

	/// Merge a shrunken chunk with an adjacent one when their combined
	/// distinct count stays below the merge threshold.
	async fn maybe_merge(
		cache: &CacheManager,
		index: &mut FieldIndex,
		field: &str,
		pos: usize,
		ctx: &Context,
	) -> Result<(), Error> {
		let mut neighbours = Vec::new();
		if pos + 1 < index.descriptors.len() {
			neighbours.push(pos + 1);
		}
		if pos > 0 {
			neighbours.push(pos - 1);
		}
		let a_id = index.descriptors[pos].chunk_id;
		let mut partner = None;
		for other_pos in neighbours {
			let b_id = index.descriptors[other_pos].chunk_id;
			Self::load_chunk(cache, index, field, b_id, ctx).await?;
			let combined = index.chunks[&a_id].distinct() + index.chunks[&b_id].distinct();
			if combined < *cnf::CHUNK_MERGE_THRESHOLD {
				partner = Some(b_id);
				break;
			}
		}
		let Some(b_id) = partner else {
			return Ok(());
		};
		let a = index.chunks.remove(&a_id).ok_or(Error::Unreachable("maybe_merge"))?;
		let b = index.chunks.remove(&b_id).ok_or(Error::Unreachable("maybe_merge"))?;
		let merged_id = index.next_chunk_id;
		index.next_chunk_id += 1;
		let mut merged = Chunk::new(merged_id);
		merged.entries = a.entries;
		for (value, bitmap) in b.entries {
			match merged.entries.entry(value) {
				std::collections::btree_map::Entry::Occupied(mut e) => {
					*e.get_mut() |= bitmap;
				}
				std::collections::btree_map::Entry::Vacant(e) => {
					e.insert(bitmap);
				}
			}
		}
		debug!(
			"Merging chunks {a_id} and {b_id} of field '{}' into {merged_id} ({} values)",
			index.field,
			merged.distinct()
		);
		index.descriptors.retain(|d| d.chunk_id != a_id && d.chunk_id != b_id);
		index.descriptors.push(ChunkDescriptor {
			chunk_id: merged_id,
			zone: merged.zone(),
			bloom: merged.bloom(),
		});
		index.sort_descriptors();
		index.dirty_chunks.remove(&a_id);
		index.dirty_chunks.remove(&b_id);
		index.dirty_chunks.insert(merged_id);
		index.deleted_chunks.push(a_id);
		index.deleted_chunks.push(b_id);
		index.chunks.insert(merged_id, merged);
		index.dir_dirty = true;
		Ok(())
	}

	/// Evaluate a predicate to the exact bitmap of matching nouns.
	#[async_recursion]
	pub async fn query(&self, ctx: &Context, filter: &Filter) -> Result<RoaringBitmap, Error> {
		ctx.check()?;
		match filter {
			Filter::Eq(field, value) => self.query_eq(ctx, field, value).await,
			Filter::Range {
				field,
				lo,
				hi,
			} => self.query_range(ctx, field, lo.as_ref(), hi.as_ref()).await,
			Filter::And(filters) => {
				let mut out: Option<RoaringBitmap> = None;
				for f in filters {
					let bitmap = self.query(ctx, f).await?;
					out = Some(match out {
						Some(acc) => acc & bitmap,
						None => bitmap,
					});
					// An empty intersection cannot recover
					if out.as_ref().map(|b| b.is_empty()).unwrap_or(false) {
						break;
					}
				}
				Ok(out.unwrap_or_default())
			}
			Filter::Or(filters) => {
				let mut out = RoaringBitmap::new();
				for f in filters {
					out |= self.query(ctx, f).await?;
				}
				Ok(out)
			}
		}
	}

	async fn query_eq(
		&self,
		ctx: &Context,
		field: &str,
		value: &Scalar,
	) -> Result<RoaringBitmap, Error> {
		let mut out = RoaringBitmap::new();
		let Some(index) = self.fields.get(field) else {
			return Ok(out);
		};
		let key = scalar_key(value);
		for desc in &index.descriptors {
			// A loaded chunk is newer than its descriptor; probe it directly
			if let Some(chunk) = index.chunks.get(&desc.chunk_id) {
				if let Some(bitmap) = chunk.entries.get(value) {
					out |= bitmap;
				}
				continue;
			}
			if !desc.zone.covers(value) || !desc.bloom.might_contain(&key) {
				continue;
			}
			if let Some(bytes) = self.cache.get(ctx, &paths::chunk(field, desc.chunk_id)).await? {
				let chunk = Chunk::decode(&bytes)?;
				if let Some(bitmap) = chunk.entries.get(value) {
					out |= bitmap;
				}
			}
		}
		Ok(out)
	}

	async fn query_range(
		&self,
		ctx: &Context,
		field: &str,
		lo: Option<&Scalar>,
		hi: Option<&Scalar>,
	) -> Result<RoaringBitmap, Error> {
		let mut out = RoaringBitmap::new();
		let Some(index) = self.fields.get(field) else {
			return Ok(out);
		};
		for desc in &index.descriptors {
			let chunk;
			let resident = match index.chunks.get(&desc.chunk_id) {
				Some(c) => c,
				None => {
					if !desc.zone.intersects(lo, hi) {
						continue;
					}
					match self.cache.get(ctx, &paths::chunk(field, desc.chunk_id)).await? {
						Some(bytes) => {
							chunk = Chunk::decode(&bytes)?;
							&chunk
						}
						None => continue,
					}
				}
			};
			for (value, bitmap) in &resident.entries {
				// Nulls never match a range predicate
				if value.is_null() {
					continue;
				}
				if let Some(lo) = lo {
					if value < lo {
						continue;
					}
				}
				if let Some(hi) = hi {
					if value > hi {
						continue;
					}
				}
				out |= bitmap;
			}
		}
		Ok(out)
	}

	/// Persist dirty chunks, then the directories, then drop replaced chunk
	/// bodies. The directory write is the publication point.
	pub async fn flush(&mut self, ctx: &Context) -> Result<(), Error> {
		for index in self.fields.values_mut() {
			if index.dirty_chunks.is_empty() && !index.dir_dirty && index.deleted_chunks.is_empty()
			{
				continue;
			}
			// Refresh the descriptors of every dirty chunk
			for chunk_id in &index.dirty_chunks {
				if let Some(chunk) = index.chunks.get(chunk_id) {
					if let Some(desc) =
						index.descriptors.iter_mut().find(|d| d.chunk_id == *chunk_id)
					{
						desc.zone = chunk.zone();
						desc.bloom = chunk.bloom();
					}
				}
			}
			index.sort_descriptors();
			for chunk_id in std::mem::take(&mut index.dirty_chunks) {
				if let Some(chunk) = index.chunks.get(&chunk_id) {
					let bytes = chunk.encode(&index.field)?;
					self.cache.set(ctx, &paths::chunk(&index.field, chunk_id), bytes).await?;
				}
			}
			let state = SparseState {
				version: 1,
				field: index.field.clone(),
				next_chunk_id: index.next_chunk_id,
				descriptors: index
					.descriptors
					.iter()
					.map(|d| DescriptorState {
						chunk_id: d.chunk_id,
						zone: d.zone.clone(),
						bloom: d.bloom.encode().to_vec(),
					})
					.collect(),
			};
			self.store.save_record(ctx, &paths::sparse(&index.field), &state).await?;
			index.dir_dirty = false;
			for chunk_id in std::mem::take(&mut index.deleted_chunks) {
				self.cache.delete(ctx, &paths::chunk(&index.field, chunk_id)).await?;
			}
		}
		self.ftypes.save(&self.store, ctx).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::CacheOptions;

	async fn new_index() -> (MetadataIndex, Context) {
		let store = Arc::new(Store::open("memory:").unwrap());
		let cache = Arc::new(CacheManager::new(store.clone(), CacheOptions::default()).unwrap());
		let ctx = Context::background();
		(MetadataIndex::open(store, cache, &ctx).await.unwrap(), ctx)
	}

	fn meta(pairs: Vec<(&str, Value)>) -> Metadata {
		pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
	}

	#[tokio::test]
	async fn equality_queries_are_exact() {
		let (mut index, ctx) = new_index().await;
		for noun in 0..500u32 {
			let org = if noun % 2 == 0 {
				"X"
			} else {
				"Y"
			};
			index
				.insert_metadata(&ctx, noun, &meta(vec![("org", Value::from(org))]))
				.await
				.unwrap();
		}
		let x = index.query(&ctx, &Filter::Eq("org".into(), Scalar::from("X"))).await.unwrap();
		assert_eq!(x.len(), 250);
		assert!(x.iter().all(|n| n % 2 == 0));
		let none =
			index.query(&ctx, &Filter::Eq("org".into(), Scalar::from("Z"))).await.unwrap();
		assert!(none.is_empty());
	}

	#[tokio::test]
	async fn range_queries_union_in_range_values() {
		let (mut index, ctx) = new_index().await;
		for noun in 0..200u32 {
			index
				.insert_metadata(
					&ctx,
					noun,
					&meta(vec![("age", Value::from(noun as i64))]),
				)
				.await
				.unwrap();
		}
		let bitmap = index
			.query(
				&ctx,
				&Filter::Range {
					field: "age".into(),
					lo: Some(Scalar::Int(10)),
					hi: Some(Scalar::Int(19)),
				},
			)
			.await
			.unwrap();
		assert_eq!(bitmap.len(), 10);
		assert!(bitmap.iter().all(|n| (10..20).contains(&n)));
	}

	#[tokio::test]
	async fn conjunctions_intersect_exactly() {
		let (mut index, ctx) = new_index().await;
		for noun in 0..100u32 {
			index
				.insert_metadata(
					&ctx,
					noun,
					&meta(vec![
						("org", Value::from(if noun < 50 { "X" } else { "Y" })),
						("age", Value::from(noun as i64)),
					]),
				)
				.await
				.unwrap();
		}
		let bitmap = index
			.query(
				&ctx,
				&Filter::And(vec![
					Filter::Eq("org".into(), Scalar::from("X")),
					Filter::Range {
						field: "age".into(),
						lo: Some(Scalar::Int(40)),
						hi: None,
					},
				]),
			)
			.await
			.unwrap();
		let expected: Vec<u32> = (40..50).collect();
		assert_eq!(bitmap.iter().collect::<Vec<u32>>(), expected);
	}

	#[tokio::test]
	async fn chunks_split_past_the_threshold() {
		let (mut index, ctx) = new_index().await;
		// 200 distinct values in one field forces splits
		for noun in 0..200u32 {
			index
				.insert_metadata(&ctx, noun, &meta(vec![("n", Value::from(noun as i64))]))
				.await
				.unwrap();
		}
		assert!(index.chunk_count() > 1, "expected splits, got 1 chunk");
		let field = index.fields.get("n").unwrap();
		for desc in &field.descriptors {
			let chunk = &field.chunks[&desc.chunk_id];
			assert!(chunk.distinct() <= *cnf::CHUNK_SPLIT_THRESHOLD);
		}
		// Every value is still reachable
		for noun in [0u32, 99, 199] {
			let bitmap = index
				.query(&ctx, &Filter::Eq("n".into(), Scalar::Int(noun as i64)))
				.await
				.unwrap();
			assert_eq!(bitmap.iter().collect::<Vec<u32>>(), vec![noun]);
		}
	}

	#[tokio::test]
	async fn removal_keeps_queries_exact_and_merges_small_chunks() {
		let (mut index, ctx) = new_index().await;
		let docs: Vec<Metadata> =
			(0..200u32).map(|n| meta(vec![("n", Value::from(n as i64))])).collect();
		for (noun, m) in docs.iter().enumerate() {
			index.insert_metadata(&ctx, noun as u32, m).await.unwrap();
		}
		let chunks_before = index.chunk_count();
		for (noun, m) in docs.iter().enumerate().skip(5) {
			index.remove_metadata(&ctx, noun as u32, m).await.unwrap();
		}
		let bitmap = index
			.query(
				&ctx,
				&Filter::Range {
					field: "n".into(),
					lo: None,
					hi: None,
				},
			)
			.await
			.unwrap();
		assert_eq!(bitmap.len(), 5);
		assert!(index.chunk_count() < chunks_before, "small chunks never merged");
	}

	#[tokio::test]
	async fn state_survives_flush_and_reopen() {
		let store = Arc::new(Store::open("memory:").unwrap());
		let cache = Arc::new(CacheManager::new(store.clone(), CacheOptions::default()).unwrap());
		let ctx = Context::background();
		{
			let mut index = MetadataIndex::open(store.clone(), cache.clone(), &ctx).await.unwrap();
			for noun in 0..150u32 {
				index
					.insert_metadata(
						&ctx,
						noun,
						&meta(vec![
							("n", Value::from(noun as i64)),
							("org", Value::from("X")),
						]),
					)
					.await
					.unwrap();
			}
			index.flush(&ctx).await.unwrap();
		}
		let cache = Arc::new(CacheManager::new(store.clone(), CacheOptions::default()).unwrap());
		let index = MetadataIndex::open(store, cache, &ctx).await.unwrap();
		let bitmap =
			index.query(&ctx, &Filter::Eq("org".into(), Scalar::from("X"))).await.unwrap();
		assert_eq!(bitmap.len(), 150);
		let ranged = index
			.query(
				&ctx,
				&Filter::Range {
					field: "n".into(),
					lo: Some(Scalar::Int(100)),
					hi: None,
				},
			)
			.await
			.unwrap();
		assert_eq!(ranged.len(), 50);
	}

	#[tokio::test]
	async fn nested_objects_and_arrays_index_their_leaves() {
		let (mut index, ctx) = new_index().await;
		let m = meta(vec![(
			"profile",
			Value::Object(map! {
				"city".to_owned() => Value::from("Berlin"),
				"tags".to_owned() => Value::Array(vec![Scalar::from("a"), Scalar::from("b")]),
			}),
		)]);
		index.insert_metadata(&ctx, 7, &m).await.unwrap();
		let city = index
			.query(&ctx, &Filter::Eq("profile.city".into(), Scalar::from("Berlin")))
			.await
			.unwrap();
		assert_eq!(city.iter().collect::<Vec<u32>>(), vec![7]);
		let tag = index
			.query(&ctx, &Filter::Eq("profile.tags".into(), Scalar::from("b")))
			.await
			.unwrap();
		assert_eq!(tag.iter().collect::<Vec<u32>>(), vec![7]);
	}
}
