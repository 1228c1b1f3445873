//! The Hierarchical Navigable Small World index behind approximate
//! nearest-neighbour search. The graph and its neighbour arrays are owned
//! here; vectors are shared with the rest of the engine. Nodes and the
//! entry-point manifest persist through the storage adapter and are restored
//! at open.

mod beam;
mod kinds;
mod layer;

pub use kinds::KindHnsw;

use crate::cnf;
use crate::ctx::Context;
use crate::err::Error;
use crate::idx::hnsw::beam::Scored;
use crate::idx::hnsw::layer::HnswLayer;
use crate::idx::ids::NounInt;
use crate::obs::{paths, Store};
use crate::val::{Distance, NounKind, SharedVector, Vector};
use hashbrown::{HashMap, HashSet};
use rand::prelude::SmallRng;
use rand::{Rng, SeedableRng};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

pub type ElementId = u64;

/// Construction and search parameters of one small-world graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HnswParams {
	pub dimension: usize,
	pub distance: Distance,
	/// Neighbours per node on the levels above zero.
	pub m: usize,
	/// Neighbours per node on level zero.
	pub m0: usize,
	pub ef_construction: usize,
	/// Level normalisation factor of the exponential level draw.
	pub ml: f64,
	pub extend_candidates: bool,
	pub keep_pruned_connections: bool,
}

impl HnswParams {
	pub fn new(dimension: usize, distance: Distance, m: usize) -> Self {
		Self {
			dimension,
			distance,
			m,
			m0: m * 2,
			ef_construction: cnf::HNSW_DEFAULT_EF_CONSTRUCTION as usize,
			ml: 1.0 / (m as f64).ln(),
			extend_candidates: false,
			keep_pruned_connections: false,
		}
	}
}

impl Default for HnswParams {
	fn default() -> Self {
		Self::new(384, Distance::Cosine, cnf::HNSW_DEFAULT_M as usize)
	}
}

/// The vectors of a graph, keyed by element id.
pub(super) struct HnswElements {
	elements: HashMap<ElementId, SharedVector>,
	next_element_id: ElementId,
	dist: Distance,
}

impl HnswElements {
	fn new(dist: Distance) -> Self {
		Self {
			elements: Default::default(),
			next_element_id: 0,
			dist,
		}
	}

	pub(super) fn get_vector(&self, e_id: &ElementId) -> Option<&SharedVector> {
		self.elements.get(e_id)
	}

	pub(super) fn get_distance(&self, q: &Vector, e_id: &ElementId) -> Option<f64> {
		self.elements.get(e_id).map(|e_pt| self.dist.calculate(e_pt, q))
	}

	pub(super) fn distance_between(&self, a: &ElementId, b: &ElementId) -> Option<f64> {
		let a = self.elements.get(a)?;
		let b = self.elements.get(b)?;
		Some(self.dist.calculate(a, b))
	}

	pub(super) fn contains(&self, e_id: &ElementId) -> bool {
		self.elements.contains_key(e_id)
	}

	pub(super) fn len(&self) -> usize {
		self.elements.len()
	}

	fn remove(&mut self, e_id: &ElementId) {
		self.elements.remove(e_id);
	}
}

/// The small-world graph itself: one wide layer at level zero and
/// progressively sparser layers above it.
struct Hnsw {
	m: usize,
	efc: usize,
	ml: f64,
	extend_candidates: bool,
	keep_pruned: bool,
	layer0: HnswLayer,
	layers: Vec<HnswLayer>,
	enter_point: Option<ElementId>,
	elements: HnswElements,
	rng: SmallRng,
}

impl Hnsw {
	fn new(p: &HnswParams) -> Self {
		Self {
			m: p.m,
			efc: p.ef_construction,
			ml: p.ml,
			extend_candidates: p.extend_candidates,
			keep_pruned: p.keep_pruned_connections,
			enter_point: None,
			layer0: HnswLayer::new(p.m0),
			layers: Vec::default(),
			elements: HnswElements::new(p.distance),
			rng: SmallRng::from_entropy(),
		}
	}

	/// Draw an insertion level from the exponentially decaying distribution
	/// the `ml` factor normalises.
	fn random_level(&mut self) -> usize {
		let unif: f64 = self.rng.gen();
		(-unif.ln() * self.ml).floor() as usize
	}

	fn insert(&mut self, q_pt: SharedVector) -> ElementId {
		let q_id = self.elements.next_element_id;
		self.elements.next_element_id += 1;
		self.elements.elements.insert(q_id, q_pt.clone());

		let q_level = self.random_level();
		let top_up_layers = self.layers.len();
		// The drawn level may top out above every existing layer
		for _ in top_up_layers..q_level {
			self.layers.push(HnswLayer::new(self.m));
		}

		match self.enter_point {
			Some(ep_id) => self.insert_element(q_id, &q_pt, q_level, ep_id, top_up_layers),
			None => {
				// The first element spans its layers alone and becomes the
				// entry point
				for layer in self.layers.iter_mut().take(q_level) {
					layer.add_isolated(q_id);
				}
				self.layer0.add_isolated(q_id);
				self.enter_point = Some(q_id);
			}
		}
		q_id
	}

	fn insert_element(
		&mut self,
		q_id: ElementId,
		q_pt: &Vector,
		q_level: usize,
		ep_id: ElementId,
		top_up_layers: usize,
	) {
		let Some(ep_dist) = self.elements.get_distance(q_pt, &ep_id) else {
			return;
		};
		let mut best = Scored::new(ep_dist, ep_id);

		// Route greedily down to the first layer the element joins
		if q_level < top_up_layers {
			for layer in self.layers[q_level..top_up_layers].iter().rev() {
				best = layer.descend(&self.elements, q_pt, best);
			}
		}

		// Insert layer by layer, each search beam seeding the next
		let mut entries = vec![best];
		let joins = q_level.min(top_up_layers);
		if joins > 0 {
			for layer in self.layers.iter_mut().take(joins).rev() {
				let found = layer.insert(
					&self.elements,
					q_id,
					q_pt,
					&entries,
					self.efc,
					self.extend_candidates,
					self.keep_pruned,
				);
				entries = found.to_entries();
			}
		}
		self.layer0.insert(
			&self.elements,
			q_id,
			q_pt,
			&entries,
			self.efc,
			self.extend_candidates,
			self.keep_pruned,
		);

		if top_up_layers < q_level {
			for layer in self.layers[top_up_layers..q_level].iter_mut() {
				layer.add_isolated(q_id);
			}
		}

		if q_level > top_up_layers {
			self.enter_point = Some(q_id);
		}
	}

	fn remove(&mut self, e_id: ElementId) -> bool {
		let Some(e_pt) = self.elements.get_vector(&e_id).cloned() else {
			return false;
		};
		let layers = self.layers.len();
		let mut new_enter_point = None;

		// Are we deleting the current enter point?
		if Some(e_id) == self.enter_point {
			let top = if layers == 0 {
				&self.layer0
			} else {
				&self.layers[layers - 1]
			};
			new_enter_point = top
				.search(&self.elements, &e_pt, &[Scored::new(0.0, e_id)], 1, &|e| e != e_id)
				.nearest();
		}

		self.elements.remove(&e_id);

		let mut removed = false;
		for layer in self.layers.iter_mut().rev() {
			if layer.remove(&self.elements, e_id, self.efc, self.extend_candidates, self.keep_pruned)
			{
				removed = true;
			}
		}
		if self.layer0.remove(&self.elements, e_id, self.efc, self.extend_candidates, self.keep_pruned)
		{
			removed = true;
		}

		if removed && new_enter_point.is_some() {
			self.enter_point = new_enter_point.map(|s| s.element);
		}
		removed
	}

	/// Greedy descent from the entry point to the best level-0 seed.
	fn search_entry(&self, q: &Vector) -> Option<Scored> {
		let ep_id = self.enter_point?;
		let ep_dist = self.elements.get_distance(q, &ep_id)?;
		let mut best = Scored::new(ep_dist, ep_id);
		for layer in self.layers.iter().rev() {
			best = layer.descend(&self.elements, q, best);
		}
		Some(best)
	}

	fn knn_search(&self, q: &Vector, k: usize, efs: usize) -> Vec<(f64, ElementId)> {
		match self.search_entry(q) {
			Some(entry) => self
				.layer0
				.search(&self.elements, q, &[entry], efs.max(k), &|_| true)
				.take_nearest(k),
			None => vec![],
		}
	}

	fn knn_search_filtered(
		&self,
		q: &Vector,
		k: usize,
		efs: usize,
		accept: &dyn Fn(ElementId) -> bool,
	) -> Vec<(f64, ElementId)> {
		match self.search_entry(q) {
			Some(entry) => self
				.layer0
				.search(&self.elements, q, &[entry], efs.max(k), accept)
				.take_nearest(k),
			None => vec![],
		}
	}

	/// Every element whose edge lists reference the given element.
	fn neighbourhood_of(&self, e_id: ElementId) -> HashSet<ElementId> {
		let mut out = HashSet::new();
		if let Some(edges) = self.layer0.neighbours_of(e_id) {
			out.extend(edges.iter());
		}
		for layer in &self.layers {
			if let Some(edges) = layer.neighbours_of(e_id) {
				out.extend(edges.iter());
			}
		}
		out
	}

	fn edges_per_level(&self, e_id: ElementId) -> Vec<Vec<ElementId>> {
		let mut out = Vec::new();
		match self.layer0.neighbours_of(e_id) {
			Some(edges) => out.push(edges.iter().collect()),
			None => return out,
		}
		for layer in &self.layers {
			match layer.neighbours_of(e_id) {
				Some(edges) => out.push(edges.iter().collect()),
				None => break,
			}
		}
		out
	}

	#[cfg(test)]
	fn check_hnsw_properties(&self, expected_count: usize) {
		assert_eq!(self.elements.len(), expected_count);
		self.layer0.check_props(&self.elements);
		for layer in &self.layers {
			layer.check_props(&self.elements);
		}
	}
}

/// One persisted graph node.
#[derive(Serialize, Deserialize)]
struct NodeState {
	element: ElementId,
	noun: NounInt,
	vector: Vec<f32>,
	/// Neighbour lists, level zero first.
	levels: Vec<Vec<ElementId>>,
}

#[derive(Serialize, Deserialize)]
struct ManifestState {
	version: u16,
	params: HnswParams,
	enter_point: Option<ElementId>,
	next_element_id: ElementId,
	/// Number of layers above level zero.
	top_layers: usize,
	count: u64,
}

/// The noun-facing vector index: maps nouns onto graph elements, keeps the
/// graph consistent under vector replacement, and persists dirty nodes.
pub struct HnswIndex {
	params: HnswParams,
	hnsw: Hnsw,
	e_nouns: HashMap<ElementId, NounInt>,
	noun_elements: HashMap<NounInt, ElementId>,
	dirty: HashSet<ElementId>,
	removed: HashSet<ElementId>,
	manifest_dirty: bool,
}

impl HnswIndex {
	pub fn new(params: &HnswParams) -> Self {
		Self {
			params: params.clone(),
			hnsw: Hnsw::new(params),
			e_nouns: HashMap::default(),
			noun_elements: HashMap::default(),
			dirty: HashSet::default(),
			removed: HashSet::default(),
			manifest_dirty: false,
		}
	}

	pub fn len(&self) -> usize {
		self.noun_elements.len()
	}

	pub fn is_empty(&self) -> bool {
		self.noun_elements.is_empty()
	}

	pub fn contains(&self, noun: NounInt) -> bool {
		self.noun_elements.contains_key(&noun)
	}

	pub fn get_vector(&self, noun: NounInt) -> Option<&SharedVector> {
		let e_id = self.noun_elements.get(&noun)?;
		self.hnsw.elements.get_vector(e_id)
	}

	/// Index a noun's vector, replacing any previous vector for the noun.
	pub fn insert(&mut self, noun: NounInt, vector: SharedVector) -> Result<(), Error> {
		vector.check_dimension(self.params.dimension)?;
		if self.noun_elements.contains_key(&noun) {
			self.remove(noun);
		}
		let e_id = self.hnsw.insert(vector);
		self.e_nouns.insert(e_id, noun);
		self.noun_elements.insert(noun, e_id);
		self.removed.remove(&e_id);
		self.dirty.insert(e_id);
		self.dirty.extend(self.hnsw.neighbourhood_of(e_id));
		self.manifest_dirty = true;
		Ok(())
	}

	/// Remove a noun from the index. Returns false if it was not indexed.
	pub fn remove(&mut self, noun: NounInt) -> bool {
		let Some(e_id) = self.noun_elements.remove(&noun) else {
			return false;
		};
		// The former neighbourhood gets re-linked, so it must be re-persisted
		let touched = self.hnsw.neighbourhood_of(e_id);
		self.hnsw.remove(e_id);
		self.e_nouns.remove(&e_id);
		self.dirty.extend(touched);
		self.dirty.remove(&e_id);
		self.removed.insert(e_id);
		self.manifest_dirty = true;
		true
	}

	/// The k nouns closest to the query, ties broken by ascending noun id.
	pub fn knn_search(&self, q: &Vector, k: usize, ef: usize) -> Vec<(f64, NounInt)> {
		let neighbours = self.hnsw.knn_search(q, k, ef);
		self.to_nouns(neighbours)
	}

	/// Filtered search: only nouns present in the candidate bitmap are
	/// returned, but the beam routes through the others.
	pub fn knn_search_filtered(
		&self,
		q: &Vector,
		k: usize,
		ef: usize,
		candidates: &RoaringBitmap,
	) -> Vec<(f64, NounInt)> {
		let accept = |e_id: ElementId| {
			self.e_nouns.get(&e_id).map(|noun| candidates.contains(*noun)).unwrap_or(false)
		};
		let neighbours = self.hnsw.knn_search_filtered(q, k, ef, &accept);
		self.to_nouns(neighbours)
	}

	fn to_nouns(&self, neighbours: Vec<(f64, ElementId)>) -> Vec<(f64, NounInt)> {
		let mut out: Vec<(f64, NounInt)> = neighbours
			.into_iter()
			.filter_map(|(dist, e_id)| self.e_nouns.get(&e_id).map(|noun| (dist, *noun)))
			.collect();
		out.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
		out
	}

	/// Persist dirty nodes and the manifest.
	pub async fn save(
		&mut self,
		store: &Store,
		ctx: &Context,
		kind: Option<NounKind>,
	) -> Result<(), Error> {
		if !self.manifest_dirty && self.dirty.is_empty() && self.removed.is_empty() {
			return Ok(());
		}
		for e_id in std::mem::take(&mut self.removed) {
			store.delete_blob(ctx, &paths::hnsw_node(kind, e_id)).await?;
		}
		for e_id in std::mem::take(&mut self.dirty) {
			// A dirty node may have been removed since it was marked
			let Some(vector) = self.hnsw.elements.get_vector(&e_id) else {
				continue;
			};
			let Some(noun) = self.e_nouns.get(&e_id) else {
				continue;
			};
			let state = NodeState {
				element: e_id,
				noun: *noun,
				vector: vector.as_slice().to_vec(),
				levels: self.hnsw.edges_per_level(e_id),
			};
			store.save_record(ctx, &paths::hnsw_node(kind, e_id), &state).await?;
		}
		let manifest = ManifestState {
			version: 1,
			params: self.params.clone(),
			enter_point: self.hnsw.enter_point,
			next_element_id: self.hnsw.elements.next_element_id,
			top_layers: self.hnsw.layers.len(),
			count: self.noun_elements.len() as u64,
		};
		store.save_record(ctx, &paths::hnsw_manifest(kind), &manifest).await?;
		self.manifest_dirty = false;
		Ok(())
	}

	/// Restore a persisted graph. Returns a fresh index when nothing was
	/// persisted.
	pub async fn load(
		store: &Store,
		ctx: &Context,
		kind: Option<NounKind>,
		params: &HnswParams,
	) -> Result<Self, Error> {
		let Some(manifest) =
			store.get_record::<ManifestState>(ctx, &paths::hnsw_manifest(kind)).await?
		else {
			return Ok(Self::new(params));
		};
		let mut index = Self::new(&manifest.params);
		index.hnsw.enter_point = manifest.enter_point;
		index.hnsw.elements.next_element_id = manifest.next_element_id;
		for _ in 0..manifest.top_layers {
			index.hnsw.layers.push(HnswLayer::new(manifest.params.m));
		}
		for path in store.list_prefix(ctx, &paths::hnsw_node_prefix(kind)).await? {
			let Some(state) = store.get_record::<NodeState>(ctx, &path).await? else {
				continue;
			};
			let vector: SharedVector = Vector::new(state.vector).into();
			index.hnsw.elements.elements.insert(state.element, vector);
			index.e_nouns.insert(state.element, state.noun);
			index.noun_elements.insert(state.noun, state.element);
			for (level, edges) in state.levels.iter().enumerate() {
				if level == 0 {
					index.hnsw.layer0.load_node(state.element, edges);
				} else if let Some(layer) = index.hnsw.layers.get_mut(level - 1) {
					layer.load_node(state.element, edges);
				}
			}
		}
		debug!(
			"Restored vector index {:?}: {} nodes, {} upper layers",
			kind,
			index.len(),
			manifest.top_layers
		);
		Ok(index)
	}

	#[cfg(test)]
	pub(crate) fn check_properties(&self) {
		self.hnsw.check_hnsw_properties(self.noun_elements.len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::Rng;

	fn random_vector(rng: &mut SmallRng, dim: usize) -> Vector {
		Vector::new((0..dim).map(|_| rng.gen_range(-1.0f32..1.0f32)).collect())
	}

	fn brute_force(
		collection: &[(NounInt, SharedVector)],
		q: &Vector,
		k: usize,
		dist: Distance,
	) -> Vec<NounInt> {
		let mut all: Vec<(f64, NounInt)> =
			collection.iter().map(|(n, v)| (dist.calculate(v, q), *n)).collect();
		all.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
		all.into_iter().take(k).map(|(_, n)| n).collect()
	}

	#[test]
	fn insertion_keeps_graph_properties() {
		let params = HnswParams::new(3, Distance::Euclidean, 4);
		let mut index = HnswIndex::new(&params);
		let mut rng = SmallRng::seed_from_u64(42);
		for noun in 0..100u32 {
			index.insert(noun, random_vector(&mut rng, 3).into()).unwrap();
			index.check_properties();
		}
		assert_eq!(index.len(), 100);
	}

	#[test]
	fn wrong_dimension_is_rejected() {
		let params = HnswParams::new(4, Distance::Euclidean, 4);
		let mut index = HnswIndex::new(&params);
		let res = index.insert(0, Vector::new(vec![1.0, 2.0]).into());
		assert!(matches!(
			res,
			Err(Error::VectorDimension {
				expected: 4,
				found: 2
			})
		));
	}

	#[test]
	fn every_inserted_vector_is_findable() {
		let params = HnswParams::new(5, Distance::Euclidean, 8);
		let mut index = HnswIndex::new(&params);
		let mut rng = SmallRng::seed_from_u64(7);
		let collection: Vec<(NounInt, SharedVector)> =
			(0..80u32).map(|n| (n, SharedVector::from(random_vector(&mut rng, 5)))).collect();
		for (noun, vector) in &collection {
			index.insert(*noun, vector.clone()).unwrap();
		}
		for (noun, vector) in &collection {
			let res = index.knn_search(vector, 1, 80);
			assert_eq!(res.len(), 1);
			assert_eq!(res[0].1, *noun, "looking for {noun}");
			assert!(res[0].0 < 1e-9);
		}
	}

	#[test]
	fn removal_relinks_and_forgets() {
		let params = HnswParams::new(3, Distance::Euclidean, 4);
		let mut index = HnswIndex::new(&params);
		let mut rng = SmallRng::seed_from_u64(11);
		let vectors: Vec<SharedVector> =
			(0..50).map(|_| SharedVector::from(random_vector(&mut rng, 3))).collect();
		for (noun, vector) in vectors.iter().enumerate() {
			index.insert(noun as NounInt, vector.clone()).unwrap();
		}
		for noun in 0..25u32 {
			assert!(index.remove(noun));
			index.check_properties();
		}
		assert!(!index.remove(0));
		assert_eq!(index.len(), 25);
		let res = index.knn_search(&vectors[30], 5, 50);
		assert_eq!(res.len(), 5);
		assert!(res.iter().all(|(_, n)| *n >= 25));
	}

	#[test]
	fn recall_at_10_beats_95_percent() {
		let params = HnswParams::new(20, Distance::Euclidean, 16);
		let mut index = HnswIndex::new(&params);
		let mut rng = SmallRng::seed_from_u64(1234);
		let collection: Vec<(NounInt, SharedVector)> = (0..1200u32)
			.map(|n| (n, SharedVector::from(random_vector(&mut rng, 20))))
			.collect();
		for (noun, vector) in &collection {
			index.insert(*noun, vector.clone()).unwrap();
		}
		let mut total_recall = 0.0;
		let queries = 50;
		for _ in 0..queries {
			let q = random_vector(&mut rng, 20);
			let expected = brute_force(&collection, &q, 10, Distance::Euclidean);
			let got: Vec<NounInt> =
				index.knn_search(&q, 10, 100).into_iter().map(|(_, n)| n).collect();
			let hits = got.iter().filter(|n| expected.contains(n)).count();
			total_recall += hits as f64 / expected.len() as f64;
		}
		let recall = total_recall / queries as f64;
		assert!(recall >= 0.95, "recall@10 was {recall}");
	}

	#[test]
	fn filtered_search_returns_only_candidates() {
		let params = HnswParams::new(4, Distance::Euclidean, 8);
		let mut index = HnswIndex::new(&params);
		let mut rng = SmallRng::seed_from_u64(99);
		for noun in 0..200u32 {
			index.insert(noun, random_vector(&mut rng, 4).into()).unwrap();
		}
		let mut candidates = RoaringBitmap::new();
		for noun in (0..200u32).filter(|n| n % 2 == 0) {
			candidates.insert(noun);
		}
		let q = random_vector(&mut rng, 4);
		let res = index.knn_search_filtered(&q, 10, 100, &candidates);
		assert_eq!(res.len(), 10);
		assert!(res.iter().all(|(_, n)| n % 2 == 0), "{res:?}");
		// Distances are monotonically non-decreasing
		for pair in res.windows(2) {
			assert!(pair[0].0 <= pair[1].0);
		}
	}

	#[test]
	fn filtered_recall_matches_brute_force() {
		let params = HnswParams::new(8, Distance::Euclidean, 16);
		let mut index = HnswIndex::new(&params);
		let mut rng = SmallRng::seed_from_u64(77);
		let collection: Vec<(NounInt, SharedVector)> = (0..600u32)
			.map(|n| (n, SharedVector::from(random_vector(&mut rng, 8))))
			.collect();
		for (noun, vector) in &collection {
			index.insert(*noun, vector.clone()).unwrap();
		}
		let mut candidates = RoaringBitmap::new();
		for noun in (0..600u32).filter(|n| n % 2 == 0) {
			candidates.insert(noun);
		}
		let accepted: Vec<(NounInt, SharedVector)> =
			collection.iter().filter(|(n, _)| n % 2 == 0).cloned().collect();
		let mut total_recall = 0.0;
		let queries = 30;
		for _ in 0..queries {
			// Queries drawn near indexed points, so that the beam starts
			// right next to accepted entry points too
			let near: &Vector = &collection[rng.gen_range(0..collection.len())].1;
			let q = Vector::new(
				near.as_slice().iter().map(|v| v + rng.gen_range(-0.05f32..0.05f32)).collect(),
			);
			let expected = brute_force(&accepted, &q, 10, Distance::Euclidean);
			let got: Vec<NounInt> = index
				.knn_search_filtered(&q, 10, 100, &candidates)
				.into_iter()
				.map(|(_, n)| n)
				.collect();
			assert_eq!(got.len(), 10);
			let hits = got.iter().filter(|n| expected.contains(n)).count();
			total_recall += hits as f64 / expected.len() as f64;
		}
		let recall = total_recall / queries as f64;
		assert!(recall >= 0.95, "filtered recall@10 was {recall}");
	}

	#[tokio::test]
	async fn persisted_graphs_are_restored() {
		let store = Store::open("memory:").unwrap();
		let ctx = Context::background();
		let params = HnswParams::new(4, Distance::Euclidean, 8);
		let mut rng = SmallRng::seed_from_u64(5);
		let vectors: Vec<SharedVector> =
			(0..60).map(|_| SharedVector::from(random_vector(&mut rng, 4))).collect();
		{
			let mut index = HnswIndex::new(&params);
			for (noun, vector) in vectors.iter().enumerate() {
				index.insert(noun as NounInt, vector.clone()).unwrap();
			}
			index.remove(3);
			index.save(&store, &ctx, None).await.unwrap();
		}
		let restored = HnswIndex::load(&store, &ctx, None, &params).await.unwrap();
		assert_eq!(restored.len(), 59);
		assert!(!restored.contains(3));
		for (noun, vector) in vectors.iter().enumerate() {
			if noun == 3 {
				continue;
			}
			let res = restored.knn_search(vector, 1, 60);
			assert_eq!(res[0].1, noun as NounInt);
			assert!(res[0].0 < 1e-9);
		}
	}
}
