use crate::idx::hnsw::beam::{Beam, Scored};
use crate::idx::hnsw::{ElementId, HnswElements};
use crate::val::Vector;
use ahash::HashMap;
use ahash::HashMapExt;
use hashbrown::HashSet;
use smallvec::SmallVec;

/// The neighbour list of one node. Edge budgets are small, so the list
/// stays inline; order carries no meaning.
#[derive(Clone, Debug, Default)]
pub(super) struct Neighbours(SmallVec<[ElementId; 32]>);

impl Neighbours {
	pub(super) fn insert(&mut self, element: ElementId) -> bool {
		if self.0.contains(&element) {
			false
		} else {
			self.0.push(element);
			true
		}
	}

	pub(super) fn remove(&mut self, element: ElementId) -> bool {
		if let Some(pos) = self.0.iter().position(|e| *e == element) {
			self.0.swap_remove(pos);
			true
		} else {
			false
		}
	}

	pub(super) fn len(&self) -> usize {
		self.0.len()
	}

	pub(super) fn iter(&self) -> impl Iterator<Item = ElementId> + '_ {
		self.0.iter().copied()
	}
}

impl FromIterator<ElementId> for Neighbours {
	fn from_iter<I: IntoIterator<Item = ElementId>>(iter: I) -> Self {
		let mut out = Self::default();
		for e in iter {
			out.insert(e);
		}
		out
	}
}

/// One level of the small-world graph: a bidirectional adjacency with a
/// per-node edge budget. Level zero carries a larger budget than the
/// levels above it.
#[derive(Debug)]
pub(super) struct HnswLayer {
	m_max: usize,
	adjacency: HashMap<ElementId, Neighbours>,
}

impl HnswLayer {
	pub(super) fn new(m_max: usize) -> Self {
		Self {
			m_max,
			adjacency: HashMap::new(),
		}
	}

	pub(super) fn neighbours_of(&self, element: ElementId) -> Option<&Neighbours> {
		self.adjacency.get(&element)
	}

	/// Add a node with no edges yet; the first element of a layer, or an
	/// element whose level tops out above the current entry point.
	pub(super) fn add_isolated(&mut self, element: ElementId) {
		self.adjacency.entry(element).or_default();
	}

	/// Restore a persisted node with its exact edge list. Back-edges are
	/// not derived; the persisted records already carry both directions.
	pub(super) fn load_node(&mut self, element: ElementId, edges: &[ElementId]) {
		self.adjacency.insert(element, edges.iter().copied().collect());
	}

	/// Greedy routing: hill-climb from `best` until no neighbour improves.
	/// Used on the layers above the one a search or insertion targets.
	pub(super) fn descend(&self, elements: &HnswElements, pt: &Vector, mut best: Scored) -> Scored {
		loop {
			let mut improved = false;
			if let Some(neighbours) = self.adjacency.get(&best.element) {
				for e in neighbours.iter() {
					if let Some(dist) = elements.get_distance(pt, &e) {
						if dist < best.dist {
							best = Scored::new(dist, e);
							improved = true;
						}
					}
				}
			}
			if !improved {
				return best;
			}
		}
	}

	/// The beam search. Every reachable element routes the beam, but only
	/// elements passing `accept` enter the result set, so a sparse
	/// candidate set cannot strand the search in a disconnected pocket.
	/// The pruning bound follows the furthest accepted result and only
	/// terminates the walk once `ef` results are held.
	pub(super) fn search(
		&self,
		elements: &HnswElements,
		pt: &Vector,
		entries: &[Scored],
		ef: usize,
		accept: &dyn Fn(ElementId) -> bool,
	) -> Beam {
		let mut visited: HashSet<ElementId> = entries.iter().map(|s| s.element).collect();
		let mut frontier = Beam::default();
		let mut results = Beam::default();
		for s in entries {
			frontier.push(s.dist, s.element);
			if accept(s.element) {
				results.push(s.dist, s.element);
			}
		}
		let mut bound = results.furthest_dist().unwrap_or(f64::INFINITY);
		while let Some(next) = frontier.pop_nearest() {
			if next.dist > bound && results.len() >= ef {
				break;
			}
			let Some(neighbours) = self.adjacency.get(&next.element) else {
				continue;
			};
			for e in neighbours.iter() {
				if !visited.insert(e) {
					continue;
				}
				let Some(dist) = elements.get_distance(pt, &e) else {
					continue;
				};
				if dist >= bound && results.len() >= ef {
					continue;
				}
				frontier.push(dist, e);
				if accept(e) {
					results.push(dist, e);
					if results.len() > ef {
						results.drop_furthest();
					}
					if let Some(furthest) = results.furthest_dist() {
						bound = furthest;
					}
				}
			}
		}
		results
	}

	/// Pick the element's neighbours out of a candidate beam: a candidate
	/// is kept when the element is closer to it than any already-kept
	/// neighbour, which spreads edges across directions instead of
	/// clustering them. `extend` widens the pool with the candidates' own
	/// neighbourhoods first; `keep_pruned` backfills rejected candidates up
	/// to the budget.
	pub(super) fn select_neighbours(
		&self,
		elements: &HnswElements,
		q_id: ElementId,
		q_pt: &Vector,
		mut pool: Beam,
		extend: bool,
		keep_pruned: bool,
	) -> Neighbours {
		if extend {
			let mut seen: HashSet<ElementId> = pool.iter().map(|s| s.element).collect();
			for s in pool.to_entries() {
				if let Some(neighbours) = self.adjacency.get(&s.element) {
					for e in neighbours.iter() {
						if e != q_id && seen.insert(e) {
							if let Some(dist) = elements.get_distance(q_pt, &e) {
								pool.push(dist, e);
							}
						}
					}
				}
			}
		}
		if pool.len() <= self.m_max {
			return pool.iter().map(|s| s.element).collect();
		}
		let mut chosen = Neighbours::default();
		let mut pruned = Vec::new();
		while let Some(s) = pool.pop_nearest() {
			if chosen.len() == self.m_max {
				break;
			}
			let shadowed = chosen.iter().any(|kept| {
				elements.distance_between(&s.element, &kept).map_or(false, |d| d < s.dist)
			});
			if shadowed {
				pruned.push(s.element);
			} else {
				chosen.insert(s.element);
			}
		}
		if keep_pruned {
			for e in pruned {
				if chosen.len() == self.m_max {
					break;
				}
				chosen.insert(e);
			}
		}
		chosen
	}

	/// Insert an element: search the layer from the entry beam, select its
	/// neighbours, link both directions, and re-select for any neighbour
	/// the back-edge pushed over budget. Returns the search beam, which
	/// seeds the insertion one layer down.
	#[allow(clippy::too_many_arguments)]
	pub(super) fn insert(
		&mut self,
		elements: &HnswElements,
		q_id: ElementId,
		q_pt: &Vector,
		entries: &[Scored],
		efc: usize,
		extend: bool,
		keep_pruned: bool,
	) -> Beam {
		let found = self.search(elements, q_pt, entries, efc, &|_| true);
		let chosen = self.select_neighbours(elements, q_id, q_pt, found.clone(), extend, keep_pruned);
		for e in chosen.iter() {
			self.adjacency.entry(e).or_default().insert(q_id);
		}
		self.adjacency.insert(q_id, chosen.clone());
		for e in chosen.iter() {
			let Some(connections) = self.adjacency.get(&e) else {
				continue;
			};
			if connections.len() <= self.m_max {
				continue;
			}
			let Some(e_pt) = elements.get_vector(&e).cloned() else {
				continue;
			};
			let mut pool = Beam::default();
			for n in connections.iter() {
				if let Some(dist) = elements.get_distance(&e_pt, &n) {
					pool.push(dist, n);
				}
			}
			let trimmed = self.select_neighbours(elements, e, &e_pt, pool, extend, keep_pruned);
			self.adjacency.insert(e, trimmed);
		}
		found
	}

	/// Remove an element and re-link its former neighbours among
	/// themselves.
	pub(super) fn remove(
		&mut self,
		elements: &HnswElements,
		e_id: ElementId,
		efc: usize,
		extend: bool,
		keep_pruned: bool,
	) -> bool {
		let Some(former) = self.adjacency.remove(&e_id) else {
			return false;
		};
		for n in former.iter() {
			if let Some(edges) = self.adjacency.get_mut(&n) {
				edges.remove(e_id);
			}
		}
		for n in former.iter() {
			let Some(n_pt) = elements.get_vector(&n).cloned() else {
				continue;
			};
			let found =
				self.search(elements, &n_pt, &[Scored::new(0.0, n)], efc, &|e| e != n);
			let chosen = self.select_neighbours(elements, n, &n_pt, found, extend, keep_pruned);
			self.adjacency.insert(n, chosen);
		}
		true
	}
}

#[cfg(test)]
impl HnswLayer {
	pub(super) fn check_props(&self, elements: &HnswElements) {
		assert!(
			self.adjacency.len() <= elements.len(),
			"{} - {}",
			self.adjacency.len(),
			elements.len()
		);
		for (e_id, edges) in &self.adjacency {
			assert!(
				edges.len() <= self.m_max,
				"edge list of {e_id}: len({}) > m_max({})",
				edges.len(),
				self.m_max,
			);
			assert!(edges.iter().all(|n| n != *e_id), "{e_id} lists itself");
			assert!(elements.contains(e_id), "missing vector for element {e_id}");
		}
	}
}
