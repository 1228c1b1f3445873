//! The engine: the per-instance context object owning the storage adapter,
//! the cache, the id mapper, the adjacency tree, the metadata index and the
//! vector index, and exposing the in-process API. There are no process-wide
//! singletons; everything an engine touches hangs off its own instance.

use crate::cache::{CacheManager, CacheOptions, CacheStats};
use crate::ctx::Context;
use crate::err::Error;
use crate::graph::{Exclusions, GraphQuery, PageRankOptions, PathOptions};
use crate::idx::hnsw::{HnswParams, KindHnsw};
use crate::idx::ids::{NounIds, NounInt};
use crate::idx::meta::{Filter, MetadataIndex};
use crate::lsm::{LsmOptions, LsmTree};
use crate::obs::{paths, Store};
use crate::txn::{Operation, Transaction};
use crate::val::{Distance, Metadata, Noun, NounKind, Vector, Verb, VerbKind};
use async_trait::async_trait;
use dashmap::DashMap;
use roaring::RoaringBitmap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// The external collaborator turning text into vectors. Embedding models
/// live outside the engine; only this interface is known here.
#[async_trait]
pub trait Embedder: Send + Sync {
	fn dimension(&self) -> usize;
	async fn embed(&self, text: &str) -> Result<Vector, Error>;
}

/// Construction-time configuration of one engine instance.
#[derive(Clone)]
pub struct EngineConfig {
	/// Storage location: `memory:`, `file:///path`, or an object-store URL.
	pub location: String,
	/// Vector index parameters, including the engine dimensionality.
	pub hnsw: HnswParams,
	/// Default beam width of searches which do not specify one.
	pub ef_search: usize,
	/// One vector index per noun kind instead of a single shared one.
	pub partition_by_kind: bool,
	pub read_only: bool,
	/// Memory budget the cache tuner sizes the hot tier within.
	pub memory_budget: Option<usize>,
	/// Directory of the warm cache tier; in-memory when unset.
	pub warm_dir: Option<PathBuf>,
	pub lsm: LsmOptions,
	pub embedder: Option<Arc<dyn Embedder>>,
}

impl EngineConfig {
	pub fn new(location: &str, dimension: usize) -> Self {
		Self {
			location: location.to_owned(),
			hnsw: HnswParams::new(
				dimension,
				Distance::Cosine,
				crate::cnf::HNSW_DEFAULT_M as usize,
			),
			ef_search: crate::cnf::HNSW_DEFAULT_EF_SEARCH as usize,
			partition_by_kind: false,
			read_only: false,
			memory_budget: None,
			warm_dir: None,
			lsm: LsmOptions::default(),
			embedder: None,
		}
	}

	pub fn dimension(&self) -> usize {
		self.hnsw.dimension
	}
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self::new("memory:", 384)
	}
}

/// A noun to insert.
#[derive(Clone, Debug, Default)]
pub struct NounInput {
	/// Generated (UUID v4) when absent.
	pub id: Option<String>,
	pub kind: NounKind,
	pub vector: Vec<f32>,
	pub metadata: Metadata,
}

/// A partial update of an existing noun.
#[derive(Clone, Debug, Default)]
pub struct NounPatch {
	pub vector: Option<Vec<f32>>,
	/// Keys merge over the existing metadata.
	pub metadata: Option<Metadata>,
}

/// A verb to insert.
#[derive(Clone, Debug)]
pub struct VerbInput {
	pub id: Option<String>,
	pub source: String,
	pub target: String,
	pub kind: VerbKind,
	/// In [0, 1].
	pub weight: f64,
	pub confidence: Option<f64>,
	pub metadata: Metadata,
}

/// A materialised noun.
#[derive(Clone, Debug, PartialEq)]
pub struct NounRecord {
	pub id: String,
	pub kind: NounKind,
	pub vector: Vector,
	pub metadata: Metadata,
	pub created_at: i64,
}

/// A materialised verb.
#[derive(Clone, Debug, PartialEq)]
pub struct VerbRecord {
	pub id: String,
	pub source: String,
	pub target: String,
	pub kind: VerbKind,
	pub weight: f64,
	pub confidence: Option<f64>,
	pub metadata: Metadata,
	pub created_at: i64,
}

/// What to search for.
#[derive(Clone, Debug)]
pub enum Query {
	Vector(Vec<f32>),
	/// Requires an [`Embedder`] on the engine.
	Text(String),
}

/// A search request.
#[derive(Clone, Debug)]
pub struct SearchRequest {
	pub query: Query,
	/// Structured pre-filter; only matching nouns are returned.
	pub filter: Option<Filter>,
	pub k: usize,
	/// Beam width override.
	pub ef: Option<usize>,
	/// Restrict to these noun kinds.
	pub kinds: Option<Vec<NounKind>>,
}

impl SearchRequest {
	pub fn vector(vector: Vec<f32>, k: usize) -> Self {
		Self {
			query: Query::Vector(vector),
			filter: None,
			k,
			ef: None,
			kinds: None,
		}
	}

	pub fn with_filter(mut self, filter: Filter) -> Self {
		self.filter = Some(filter);
		self
	}

	pub fn with_kinds(mut self, kinds: Vec<NounKind>) -> Self {
		self.kinds = Some(kinds);
		self
	}
}

/// One ranked search hit.
#[derive(Clone, Debug)]
pub struct SearchResult {
	pub id: String,
	pub kind: NounKind,
	pub distance: f64,
	pub metadata: Metadata,
}

/// Engine-wide counters.
#[derive(Clone, Debug, Default)]
pub struct Stats {
	pub nouns: u64,
	pub relationships: u64,
	pub sstables_per_level: BTreeMap<u8, usize>,
	pub cache: CacheStats,
	pub indexed_vectors: usize,
	pub metadata_chunks: usize,
	pub excluded_edges: usize,
}

pub(crate) struct EngineInner {
	pub(crate) config: EngineConfig,
	pub(crate) store: Arc<Store>,
	pub(crate) cache: Arc<CacheManager>,
	pub(crate) ids: Mutex<NounIds>,
	pub(crate) lsm: LsmTree,
	pub(crate) meta: RwLock<MetadataIndex>,
	pub(crate) hnsw: RwLock<KindHnsw>,
	pub(crate) exclusions: RwLock<Exclusions>,
	id_locks: DashMap<String, Arc<Mutex<()>>>,
	nouns: AtomicU64,
	verbs: AtomicU64,
}

impl EngineInner {
	/// The dense integer of a noun id, assigned on first reference.
	pub(crate) async fn noun_int(&self, id: &str) -> Result<NounInt, Error> {
		self.ids.lock().await.get_or_assign(id)
	}

	/// The ids of the verbs leaving a noun.
	pub(crate) async fn verb_src(&self, ctx: &Context, source: &str) -> Result<Vec<String>, Error> {
		match self.cache.get(ctx, &paths::verb_src(source)).await? {
			Some(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
			None => Ok(Vec::new()),
		}
	}

	/// Whether any verb still connects the pair.
	pub(crate) async fn pair_has_verbs(
		&self,
		ctx: &Context,
		source: &str,
		target: &str,
	) -> Result<bool, Error> {
		for verb_id in self.verb_src(ctx, source).await? {
			if let Some(bytes) = self.cache.get(ctx, &paths::verb(&verb_id)).await? {
				let verb: Verb = rmp_serde::from_slice(&bytes)?;
				if verb.target == target {
					return Ok(true);
				}
			}
		}
		Ok(false)
	}

	/// Re-derive the visibility of a (source, target) edge from the verbs
	/// that exist between the pair. Idempotent; a failed persist leaves the
	/// in-memory set untouched.
	pub(crate) async fn sync_edge(
		&self,
		ctx: &Context,
		source: &str,
		target: &str,
	) -> Result<(), Error> {
		let present = self.pair_has_verbs(ctx, source, target).await?;
		let mut exclusions = self.exclusions.write().await;
		let was_excluded = exclusions.is_excluded(source, target);
		if present {
			exclusions.unexclude(source, target);
		} else {
			exclusions.exclude(source, target);
		}
		if let Err(e) = exclusions.save(&self.store, ctx).await {
			if was_excluded {
				exclusions.exclude(source, target);
			} else {
				exclusions.unexclude(source, target);
			}
			return Err(e);
		}
		Ok(())
	}

	/// Serialise writers on the same noun id.
	async fn lock_id(&self, id: &str) -> tokio::sync::OwnedMutexGuard<()> {
		let lock = self
			.id_locks
			.entry(id.to_owned())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone();
		lock.lock_owned().await
	}

	fn ensure_writable(&self) -> Result<(), Error> {
		if self.config.read_only {
			Err(Error::Misconfiguration("the engine is read-only".to_owned()))
		} else {
			Ok(())
		}
	}

	async fn get_noun(&self, ctx: &Context, id: &str) -> Result<Option<Noun>, Error> {
		match self.cache.get(ctx, &paths::noun(id)).await? {
			Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
			None => Ok(None),
		}
	}

	async fn get_noun_metadata(&self, ctx: &Context, id: &str) -> Result<Option<Metadata>, Error> {
		match self.cache.get(ctx, &paths::noun_meta(id)).await? {
			Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
			None => Ok(None),
		}
	}
}

/// An embeddable vector-and-graph database engine.
///
/// Cloning is cheap; clones share the instance.
#[derive(Clone)]
pub struct Engine {
	pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
	/// Open an engine over the configured storage location, restoring every
	/// persisted index.
	pub async fn open(config: EngineConfig) -> Result<Self, Error> {
		let ctx = Context::background();
		let store = Arc::new(Store::open(&config.location)?);
		let cache = Arc::new(CacheManager::new(
			store.clone(),
			CacheOptions {
				memory_budget: config.memory_budget,
				warm_dir: config.warm_dir.clone(),
				read_only: config.read_only,
			},
		)?);
		let ids = NounIds::open(&store, &ctx).await?;
		let lsm =
			LsmTree::open(store.clone(), cache.clone(), &ctx, config.lsm.clone()).await?;
		let meta = MetadataIndex::open(store.clone(), cache.clone(), &ctx).await?;
		let hnsw =
			KindHnsw::load(&store, &ctx, &config.hnsw, config.partition_by_kind).await?;
		let exclusions = Exclusions::open(&store, &ctx).await?;
		let nouns = store.list_prefix(&ctx, "noun").await?.len() as u64;
		let verbs = store.list_prefix(&ctx, "verb").await?.len() as u64;
		info!(
			"Opened engine at {}: {nouns} nouns, {verbs} verbs, {} indexed vectors",
			config.location,
			hnsw.len()
		);
		Ok(Self {
			inner: Arc::new(EngineInner {
				config,
				store,
				cache,
				ids: Mutex::new(ids),
				lsm,
				meta: RwLock::new(meta),
				hnsw: RwLock::new(hnsw),
				exclusions: RwLock::new(exclusions),
				id_locks: DashMap::new(),
				nouns: AtomicU64::new(nouns),
				verbs: AtomicU64::new(verbs),
			}),
		})
	}

	/// Insert a noun: its record, metadata, metadata-index postings and
	/// vector-index entry, atomically.
	pub async fn add(&self, ctx: &Context, input: NounInput) -> Result<String, Error> {
		self.inner.ensure_writable()?;
		let id = input.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
		let _guard = self.inner.lock_id(&id).await;
		let vector = Vector::new(input.vector);
		vector.check_dimension(self.inner.config.dimension())?;
		// The record keeps the vector exactly as inserted; the index gets
		// the normalised copy the distance metric wants
		let indexed = if self.inner.config.hnsw.distance.normalizes() {
			vector.normalized()
		} else {
			vector.clone()
		};
		if self.inner.get_noun(ctx, &id).await?.is_some() {
			return Err(Error::NounAlreadyExists(id));
		}
		let noun = Noun {
			id: id.clone(),
			kind: input.kind,
			vector,
			created_at: chrono::Utc::now().timestamp_millis(),
		};
		let ops = vec![
			Operation::SaveNoun {
				noun,
				is_new: true,
			},
			Operation::SaveNounMetadata {
				id: id.clone(),
				metadata: input.metadata.clone(),
				is_new: true,
			},
			Operation::AddToMetadataIndex {
				id: id.clone(),
				metadata: input.metadata,
			},
			Operation::AddToHnsw {
				id: id.clone(),
				kind: input.kind,
				vector: indexed.into(),
			},
		];
		Transaction::new(ops).execute(&self.inner, ctx).await?;
		self.inner.nouns.fetch_add(1, Ordering::Relaxed);
		Ok(id)
	}

	/// Fetch a noun with its metadata.
	pub async fn get(&self, ctx: &Context, id: &str) -> Result<Option<NounRecord>, Error> {
		let Some(noun) = self.inner.get_noun(ctx, id).await? else {
			return Ok(None);
		};
		let metadata = self.inner.get_noun_metadata(ctx, id).await?.unwrap_or_default();
		Ok(Some(NounRecord {
			id: noun.id,
			kind: noun.kind,
			vector: noun.vector,
			metadata,
			created_at: noun.created_at,
		}))
	}

	/// Apply a partial update to an existing noun.
	pub async fn update(&self, ctx: &Context, id: &str, patch: NounPatch) -> Result<(), Error> {
		self.inner.ensure_writable()?;
		let _guard = self.inner.lock_id(id).await;
		let Some(existing) = self.inner.get_noun(ctx, id).await? else {
			return Err(Error::BlobNotFound(paths::noun(id)));
		};
		let old_metadata = self.inner.get_noun_metadata(ctx, id).await?.unwrap_or_default();
		let mut ops = Vec::new();
		if let Some(vector) = patch.vector {
			let vector = Vector::new(vector);
			vector.check_dimension(self.inner.config.dimension())?;
			let indexed = if self.inner.config.hnsw.distance.normalizes() {
				vector.normalized()
			} else {
				vector.clone()
			};
			let noun = Noun {
				vector,
				..existing.clone()
			};
			ops.push(Operation::SaveNoun {
				noun,
				is_new: false,
			});
			ops.push(Operation::AddToHnsw {
				id: id.to_owned(),
				kind: existing.kind,
				vector: indexed.into(),
			});
		}
		if let Some(metadata) = patch.metadata {
			let mut merged = old_metadata.clone();
			merged.extend(metadata);
			ops.push(Operation::RemoveFromMetadataIndex {
				id: id.to_owned(),
				metadata: old_metadata,
			});
			ops.push(Operation::SaveNounMetadata {
				id: id.to_owned(),
				metadata: merged.clone(),
				is_new: false,
			});
			ops.push(Operation::AddToMetadataIndex {
				id: id.to_owned(),
				metadata: merged,
			});
		}
		Transaction::new(ops).execute(&self.inner, ctx).await
	}

	/// Delete a noun and every index entry it holds. Deleting a missing
	/// noun is not an error.
	pub async fn delete(&self, ctx: &Context, id: &str) -> Result<(), Error> {
		self.inner.ensure_writable()?;
		let _guard = self.inner.lock_id(id).await;
		let Some(noun) = self.inner.get_noun(ctx, id).await? else {
			return Ok(());
		};
		let metadata = self.inner.get_noun_metadata(ctx, id).await?.unwrap_or_default();
		let ops = vec![
			Operation::RemoveFromHnsw {
				id: id.to_owned(),
				kind: noun.kind,
			},
			Operation::RemoveFromMetadataIndex {
				id: id.to_owned(),
				metadata,
			},
			Operation::DeleteNounMetadata {
				id: id.to_owned(),
			},
			Operation::DeleteNoun {
				id: id.to_owned(),
			},
		];
		Transaction::new(ops).execute(&self.inner, ctx).await?;
		self.inner.nouns.fetch_sub(1, Ordering::Relaxed);
		Ok(())
	}

	/// Insert a verb. Both endpoints must exist; a parallel verb must
	/// differ in kind, weight or metadata from every existing verb between
	/// the pair.
	pub async fn add_verb(&self, ctx: &Context, input: VerbInput) -> Result<String, Error> {
		self.inner.ensure_writable()?;
		if !(0.0..=1.0).contains(&input.weight) {
			return Err(Error::InvalidArgument {
				name: "weight",
				message: format!("{} is outside [0, 1]", input.weight),
			});
		}
		if let Some(confidence) = input.confidence {
			if !(0.0..=1.0).contains(&confidence) {
				return Err(Error::InvalidArgument {
					name: "confidence",
					message: format!("{confidence} is outside [0, 1]"),
				});
			}
		}
		let _guard = self.inner.lock_id(&input.source).await;
		if self.inner.get_noun(ctx, &input.source).await?.is_none() {
			return Err(Error::VerbEndpointMissing {
				side: "source",
				id: input.source,
			});
		}
		if self.inner.get_noun(ctx, &input.target).await?.is_none() {
			return Err(Error::VerbEndpointMissing {
				side: "target",
				id: input.target,
			});
		}
		let id = input.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
		let verb = Verb {
			id: id.clone(),
			source: input.source.clone(),
			target: input.target.clone(),
			kind: input.kind,
			weight: input.weight,
			confidence: input.confidence,
			created_at: chrono::Utc::now().timestamp_millis(),
		};
		// Parallel verbs must be distinguishable
		for existing_id in self.inner.verb_src(ctx, &input.source).await? {
			if let Some(existing) = self.get_verb(ctx, &existing_id).await? {
				if existing.target != verb.target {
					continue;
				}
				let existing_verb = Verb {
					id: existing.id.clone(),
					source: existing.source,
					target: existing.target,
					kind: existing.kind,
					weight: existing.weight,
					confidence: existing.confidence,
					created_at: existing.created_at,
				};
				if verb.duplicates(&existing_verb, &input.metadata, &existing.metadata) {
					return Err(Error::VerbNotDistinct {
						rel_source: verb.source,
						target: verb.target,
					});
				}
			}
		}
		// The edge goes in first: if the record write fails, the reverse
		// rollback re-derives edge visibility after the record is gone
		let ops = vec![
			Operation::AddVerbEdge {
				source: verb.source.clone(),
				target: verb.target.clone(),
			},
			Operation::SaveVerb {
				verb,
				metadata: input.metadata,
				is_new: true,
			},
		];
		Transaction::new(ops).execute(&self.inner, ctx).await?;
		self.inner.verbs.fetch_add(1, Ordering::Relaxed);
		Ok(id)
	}

	/// Fetch a verb with its metadata.
	pub async fn get_verb(&self, ctx: &Context, id: &str) -> Result<Option<VerbRecord>, Error> {
		let Some(bytes) = self.inner.cache.get(ctx, &paths::verb(id)).await? else {
			return Ok(None);
		};
		let verb: Verb = rmp_serde::from_slice(&bytes)?;
		let metadata = match self.inner.cache.get(ctx, &paths::verb_meta(id)).await? {
			Some(bytes) => rmp_serde::from_slice(&bytes)?,
			None => Metadata::default(),
		};
		Ok(Some(VerbRecord {
			id: verb.id,
			source: verb.source,
			target: verb.target,
			kind: verb.kind,
			weight: verb.weight,
			confidence: verb.confidence,
			metadata,
			created_at: verb.created_at,
		}))
	}

	/// Delete a verb. The adjacency tables are append-only, so the edge is
	/// hidden through the exclusion set unless another verb still connects
	/// the pair.
	pub async fn delete_verb(&self, ctx: &Context, id: &str) -> Result<(), Error> {
		self.inner.ensure_writable()?;
		let Some(bytes) = self.inner.cache.get(ctx, &paths::verb(id)).await? else {
			return Ok(());
		};
		let verb: Verb = rmp_serde::from_slice(&bytes)?;
		let _guard = self.inner.lock_id(&verb.source).await;
		let (source, target) = (verb.source.clone(), verb.target.clone());
		let ops = vec![
			Operation::DeleteVerb {
				verb,
			},
			Operation::RemoveVerbEdge {
				source,
				target,
			},
		];
		Transaction::new(ops).execute(&self.inner, ctx).await?;
		self.inner.verbs.fetch_sub(1, Ordering::Relaxed);
		Ok(())
	}

	/// Approximate nearest-neighbour search, optionally filtered by a
	/// structured predicate and restricted to noun kinds.
	pub async fn search(
		&self,
		ctx: &Context,
		request: SearchRequest,
	) -> Result<Vec<SearchResult>, Error> {
		ctx.check()?;
		let mut vector = match request.query {
			Query::Vector(v) => Vector::new(v),
			Query::Text(text) => match &self.inner.config.embedder {
				Some(embedder) => embedder.embed(&text).await?,
				None => {
					return Err(Error::Misconfiguration(
						"text queries require an embedder".to_owned(),
					))
				}
			},
		};
		vector.check_dimension(self.inner.config.dimension())?;
		if self.inner.config.hnsw.distance.normalizes() {
			vector = vector.normalized();
		}
		let candidates = match &request.filter {
			Some(filter) => Some(self.inner.meta.read().await.query(ctx, filter).await?),
			None => None,
		};
		let ef = request.ef.unwrap_or(self.inner.config.ef_search);
		let hits = {
			let hnsw = self.inner.hnsw.read().await;
			hnsw.search(&vector, request.k, ef, request.kinds.as_deref(), candidates.as_ref())
		};
		// Materialise the hits through the cache
		let hits: Vec<(f64, String)> = {
			let mapper = self.inner.ids.lock().await;
			hits.into_iter()
				.filter_map(|(dist, int)| mapper.get_string(int).map(|id| (dist, id.to_owned())))
				.collect()
		};
		let mut paths_to_fetch = Vec::with_capacity(hits.len() * 2);
		for (_, id) in &hits {
			paths_to_fetch.push(paths::noun(id));
			paths_to_fetch.push(paths::noun_meta(id));
		}
		let fetched = self.inner.cache.get_many(ctx, &paths_to_fetch).await?;
		let mut out = Vec::with_capacity(hits.len());
		for (i, (distance, id)) in hits.into_iter().enumerate() {
			let Some(noun_bytes) = &fetched[i * 2] else {
				continue;
			};
			let noun: Noun = rmp_serde::from_slice(noun_bytes)?;
			let metadata = match &fetched[i * 2 + 1] {
				Some(bytes) => rmp_serde::from_slice(bytes)?,
				None => Metadata::default(),
			};
			out.push(SearchResult {
				id,
				kind: noun.kind,
				distance,
				metadata,
			});
		}
		Ok(out)
	}

	/// Every noun within `hops` hops of a start noun, as a bitmap of noun
	/// integers, optionally filtered by a metadata predicate.
	pub async fn neighbours(
		&self,
		ctx: &Context,
		id: &str,
		hops: u32,
		filter: Option<Filter>,
	) -> Result<RoaringBitmap, Error> {
		let candidates = match &filter {
			Some(filter) => Some(self.inner.meta.read().await.query(ctx, filter).await?),
			None => None,
		};
		let ids = self.inner.ids.lock().await;
		let exclusions = self.inner.exclusions.read().await;
		let query = GraphQuery {
			lsm: &self.inner.lsm,
			exclusions: &exclusions,
			ids: &ids,
		};
		query.neighbours(ctx, id, hops, candidates.as_ref()).await
	}

	/// The fewest-hop path between two nouns, if one exists.
	pub async fn shortest_path(
		&self,
		ctx: &Context,
		a: &str,
		b: &str,
		options: PathOptions,
	) -> Result<Option<Vec<String>>, Error> {
		let ids = self.inner.ids.lock().await;
		let exclusions = self.inner.exclusions.read().await;
		let query = GraphQuery {
			lsm: &self.inner.lsm,
			exclusions: &exclusions,
			ids: &ids,
		};
		query.shortest_path(ctx, a, b, &options).await
	}

	/// PageRank over the whole graph.
	pub async fn pagerank(
		&self,
		ctx: &Context,
		options: PageRankOptions,
	) -> Result<Vec<(String, f64)>, Error> {
		let ids = self.inner.ids.lock().await;
		let exclusions = self.inner.exclusions.read().await;
		let query = GraphQuery {
			lsm: &self.inner.lsm,
			exclusions: &exclusions,
			ids: &ids,
		};
		query.pagerank(ctx, &options).await
	}

	/// The noun id behind a dense integer, e.g. from a neighbours bitmap.
	pub async fn resolve(&self, int: NounInt) -> Option<String> {
		self.inner.ids.lock().await.get_string(int).map(str::to_owned)
	}

	/// Execute caller-composed operations atomically.
	pub async fn transact(&self, ctx: &Context, ops: Vec<Operation>) -> Result<(), Error> {
		self.inner.ensure_writable()?;
		Transaction::new(ops).execute(&self.inner, ctx).await
	}

	/// Warm the cache tiers for nouns about to be read.
	pub async fn prefetch(&self, ctx: &Context, ids: &[String]) -> Result<(), Error> {
		let mut paths_to_fetch = Vec::with_capacity(ids.len() * 2);
		for id in ids {
			paths_to_fetch.push(paths::noun(id));
			paths_to_fetch.push(paths::noun_meta(id));
		}
		self.inner.cache.prefetch(ctx, &paths_to_fetch).await
	}

	/// Engine-wide counters.
	pub async fn stats(&self) -> Stats {
		let lsm = self.inner.lsm.stats().await;
		Stats {
			nouns: self.inner.nouns.load(Ordering::Relaxed),
			relationships: lsm.total_relationships + lsm.memtable_relations as u64,
			sstables_per_level: lsm.tables_per_level,
			cache: self.inner.cache.stats(),
			indexed_vectors: self.inner.hnsw.read().await.len(),
			metadata_chunks: self.inner.meta.read().await.chunk_count(),
			excluded_edges: self.inner.exclusions.read().await.len(),
		}
	}

	/// Rebuild the vector index from the persisted noun records. Expensive;
	/// normal operation restores the persisted graph at open instead.
	pub async fn rebuild_vectors(&self, ctx: &Context) -> Result<usize, Error> {
		self.inner.ensure_writable()?;
		let mut rebuilt =
			KindHnsw::new(&self.inner.config.hnsw, self.inner.config.partition_by_kind);
		let mut count = 0;
		for path in self.inner.store.list_prefix(ctx, "noun").await? {
			ctx.check()?;
			let Some(bytes) = self.inner.cache.get(ctx, &path).await? else {
				continue;
			};
			let noun: Noun = rmp_serde::from_slice(&bytes)?;
			let int = self.inner.noun_int(&noun.id).await?;
			let vector = if self.inner.config.hnsw.distance.normalizes() {
				noun.vector.normalized()
			} else {
				noun.vector
			};
			rebuilt.insert(noun.kind, int, vector.into())?;
			count += 1;
		}
		// Drop the persisted graph; element ids restart from zero, so stale
		// node records must not survive into the next load
		for path in self.inner.store.list_prefix(ctx, "hnsw").await? {
			self.inner.cache.delete(ctx, &path).await?;
		}
		*self.inner.hnsw.write().await = rebuilt;
		info!("Rebuilt the vector index from {count} noun records");
		Ok(count)
	}

	/// Persist every dirty piece of index state and flush the write buffer.
	pub async fn flush(&self, ctx: &Context) -> Result<(), Error> {
		self.inner.lsm.flush(ctx).await?;
		self.inner.meta.write().await.flush(ctx).await?;
		self.inner.hnsw.write().await.save(&self.inner.store, ctx).await?;
		self.inner.ids.lock().await.save(&self.inner.store, ctx).await?;
		self.inner.exclusions.write().await.save(&self.inner.store, ctx).await?;
		Ok(())
	}
}
