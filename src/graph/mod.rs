//! Graph traversal over the adjacency index: multi-hop neighbourhoods,
//! shortest paths and PageRank. The adjacency tables are append-only, so
//! removed relationships are subtracted here through a persisted exclusion
//! set maintained by the transactional layer.

use crate::ctx::Context;
use crate::err::Error;
use crate::idx::ids::NounIds;
use crate::lsm::LsmTree;
use crate::obs::{paths, Store};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Relationships removed after reaching the append-only adjacency tables.
/// Small by construction: a pair leaves this set the moment a relationship
/// between the two nouns is written again.
#[derive(Debug, Default)]
pub struct Exclusions {
	pairs: HashSet<(String, String)>,
	dirty: bool,
}

#[derive(Serialize, Deserialize)]
struct ExclusionState {
	version: u16,
	pairs: Vec<(String, String)>,
}

impl Exclusions {
	pub async fn open(store: &Store, ctx: &Context) -> Result<Self, Error> {
		let pairs = match store.get_record::<ExclusionState>(ctx, &paths::graph_removed()).await? {
			Some(state) => state.pairs.into_iter().collect(),
			None => HashSet::new(),
		};
		Ok(Self {
			pairs,
			dirty: false,
		})
	}

	pub async fn save(&mut self, store: &Store, ctx: &Context) -> Result<(), Error> {
		if !self.dirty {
			return Ok(());
		}
		let state = ExclusionState {
			version: 1,
			pairs: self.pairs.iter().cloned().collect(),
		};
		store.save_record(ctx, &paths::graph_removed(), &state).await?;
		self.dirty = false;
		Ok(())
	}

	pub fn exclude(&mut self, source: &str, target: &str) {
		if self.pairs.insert((source.to_owned(), target.to_owned())) {
			self.dirty = true;
		}
	}

	pub fn unexclude(&mut self, source: &str, target: &str) {
		if self.pairs.remove(&(source.to_owned(), target.to_owned())) {
			self.dirty = true;
		}
	}

	pub fn is_excluded(&self, source: &str, target: &str) -> bool {
		self.pairs.contains(&(source.to_owned(), target.to_owned()))
	}

	pub fn len(&self) -> usize {
		self.pairs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pairs.is_empty()
	}
}

/// Options of a shortest-path query.
#[derive(Clone, Debug)]
pub struct PathOptions {
	/// Paths longer than this are not searched for.
	pub max_depth: usize,
}

impl Default for PathOptions {
	fn default() -> Self {
		Self {
			max_depth: 10,
		}
	}
}

/// Options of a PageRank computation.
#[derive(Clone, Debug)]
pub struct PageRankOptions {
	pub damping: f64,
	pub iterations: usize,
	/// How many top-ranked nouns to return.
	pub limit: usize,
}

impl Default for PageRankOptions {
	fn default() -> Self {
		Self {
			damping: 0.85,
			iterations: 20,
			limit: 100,
		}
	}
}

/// A read-only view over the graph, borrowed from the engine for the
/// duration of one query.
pub struct GraphQuery<'a> {
	pub lsm: &'a LsmTree,
	pub exclusions: &'a Exclusions,
	pub ids: &'a NounIds,
}

impl<'a> GraphQuery<'a> {
	/// The live out-neighbours of a noun: the adjacency union minus the
	/// exclusion set.
	async fn targets_of(&self, ctx: &Context, source: &str) -> Result<BTreeSet<String>, Error> {
		let mut targets = self.lsm.get(ctx, source).await?;
		if !self.exclusions.is_empty() {
			targets.retain(|t| !self.exclusions.is_excluded(source, t));
		}
		Ok(targets)
	}

	/// Every noun within `hops` hops of the start, as a bitmap of noun
	/// integers, optionally intersected with a pre-computed candidate set.
	pub async fn neighbours(
		&self,
		ctx: &Context,
		start: &str,
		hops: u32,
		filter: Option<&RoaringBitmap>,
	) -> Result<RoaringBitmap, Error> {
		let mut out = RoaringBitmap::new();
		let mut visited: HashSet<String> = HashSet::from([start.to_owned()]);
		let mut frontier: Vec<String> = vec![start.to_owned()];
		for _ in 0..hops {
			ctx.check()?;
			let mut next = Vec::new();
			for source in frontier {
				for target in self.targets_of(ctx, &source).await? {
					if visited.insert(target.clone()) {
						if let Some(int) = self.ids.get_int(&target) {
							out.insert(int);
						}
						next.push(target);
					}
				}
			}
			if next.is_empty() {
				break;
			}
			frontier = next;
		}
		if let Some(filter) = filter {
			out &= filter;
		}
		Ok(out)
	}

	/// The shortest path from `a` to `b` by hop count, endpoints included,
	/// or None when no path exists within the depth bound.
	pub async fn shortest_path(
		&self,
		ctx: &Context,
		a: &str,
		b: &str,
		options: &PathOptions,
	) -> Result<Option<Vec<String>>, Error> {
		if a == b {
			return Ok(Some(vec![a.to_owned()]));
		}
		let mut parents: HashMap<String, String> = HashMap::new();
		let mut queue: VecDeque<(String, usize)> = VecDeque::from([(a.to_owned(), 0)]);
		let mut visited: HashSet<String> = HashSet::from([a.to_owned()]);
		while let Some((node, depth)) = queue.pop_front() {
			ctx.check()?;
			if depth >= options.max_depth {
				continue;
			}
			for target in self.targets_of(ctx, &node).await? {
				if !visited.insert(target.clone()) {
					continue;
				}
				parents.insert(target.clone(), node.clone());
				if target == b {
					let mut path = vec![b.to_owned()];
					let mut cursor = b;
					while let Some(parent) = parents.get(cursor) {
						path.push(parent.clone());
						cursor = parent;
					}
					path.reverse();
					return Ok(Some(path));
				}
				queue.push_back((target, depth + 1));
			}
		}
		Ok(None)
	}

	/// Weighted-vote PageRank over every noun the id mapper knows, with
	/// dangling mass redistributed evenly. Returns the top nouns by rank.
	pub async fn pagerank(
		&self,
		ctx: &Context,
		options: &PageRankOptions,
	) -> Result<Vec<(String, f64)>, Error> {
		let n = self.ids.len();
		if n == 0 {
			return Ok(Vec::new());
		}
		// Materialise the integer adjacency once
		let mut adjacency: Vec<Vec<u32>> = Vec::with_capacity(n);
		for int in 0..n as u32 {
			ctx.check()?;
			let targets = match self.ids.get_string(int) {
				Some(source) => {
					let source = source.to_owned();
					self.targets_of(ctx, &source)
						.await?
						.iter()
						.filter_map(|t| self.ids.get_int(t))
						.collect()
				}
				None => Vec::new(),
			};
			adjacency.push(targets);
		}
		let n_f = n as f64;
		let mut ranks = vec![1.0 / n_f; n];
		for _ in 0..options.iterations {
			ctx.check()?;
			let mut next = vec![(1.0 - options.damping) / n_f; n];
			let mut dangling = 0.0;
			for (int, targets) in adjacency.iter().enumerate() {
				if targets.is_empty() {
					dangling += ranks[int];
					continue;
				}
				let share = options.damping * ranks[int] / targets.len() as f64;
				for &t in targets {
					next[t as usize] += share;
				}
			}
			let dangling_share = options.damping * dangling / n_f;
			for rank in next.iter_mut() {
				*rank += dangling_share;
			}
			ranks = next;
		}
		let mut ranked: Vec<(String, f64)> = ranks
			.into_iter()
			.enumerate()
			.filter_map(|(int, rank)| {
				self.ids.get_string(int as u32).map(|id| (id.to_owned(), rank))
			})
			.collect();
		ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
		ranked.truncate(options.limit);
		Ok(ranked)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::{CacheManager, CacheOptions};
	use crate::lsm::LsmOptions;
	use std::sync::Arc;

	struct Fixture {
		lsm: LsmTree,
		exclusions: Exclusions,
		ids: NounIds,
	}

	async fn fixture(edges: &[(&str, &str)]) -> Fixture {
		let store = Arc::new(Store::open("memory:").unwrap());
		let cache = Arc::new(CacheManager::new(store.clone(), CacheOptions::default()).unwrap());
		let ctx = Context::background();
		let lsm = LsmTree::open(store, cache, &ctx, LsmOptions::default()).await.unwrap();
		let mut ids = NounIds::new();
		for (source, target) in edges {
			ids.get_or_assign(source).unwrap();
			ids.get_or_assign(target).unwrap();
			lsm.add(&ctx, source, target).await.unwrap();
		}
		Fixture {
			lsm,
			exclusions: Exclusions::default(),
			ids,
		}
	}

	impl Fixture {
		fn query(&self) -> GraphQuery<'_> {
			GraphQuery {
				lsm: &self.lsm,
				exclusions: &self.exclusions,
				ids: &self.ids,
			}
		}
	}

	#[tokio::test]
	async fn neighbours_walk_the_requested_hops() {
		let f = fixture(&[("a", "b"), ("b", "c"), ("c", "d"), ("a", "e")]).await;
		let ctx = Context::background();
		let q = f.query();
		let one = q.neighbours(&ctx, "a", 1, None).await.unwrap();
		let ints = |ids: &[&str], f: &Fixture| -> Vec<u32> {
			let mut v: Vec<u32> = ids.iter().map(|i| f.ids.get_int(i).unwrap()).collect();
			v.sort();
			v
		};
		assert_eq!(one.iter().collect::<Vec<u32>>(), ints(&["b", "e"], &f));
		let two = q.neighbours(&ctx, "a", 2, None).await.unwrap();
		assert_eq!(two.iter().collect::<Vec<u32>>(), ints(&["b", "c", "e"], &f));
		let all = q.neighbours(&ctx, "a", 10, None).await.unwrap();
		assert_eq!(all.iter().collect::<Vec<u32>>(), ints(&["b", "c", "d", "e"], &f));
	}

	#[tokio::test]
	async fn excluded_edges_disappear_from_traversals() {
		let mut f = fixture(&[("a", "b"), ("b", "c")]).await;
		let ctx = Context::background();
		f.exclusions.exclude("a", "b");
		let q = f.query();
		let reachable = q.neighbours(&ctx, "a", 5, None).await.unwrap();
		assert!(reachable.is_empty());
		assert_eq!(q.shortest_path(&ctx, "a", "c", &PathOptions::default()).await.unwrap(), None);
	}

	#[tokio::test]
	async fn shortest_path_finds_the_fewest_hops() {
		let f =
			fixture(&[("a", "b"), ("b", "c"), ("c", "d"), ("a", "x"), ("x", "d"), ("d", "a")])
				.await;
		let ctx = Context::background();
		let q = f.query();
		let path = q.shortest_path(&ctx, "a", "d", &PathOptions::default()).await.unwrap();
		assert_eq!(path, Some(vec!["a".to_owned(), "x".to_owned(), "d".to_owned()]));
		// Self paths are trivial
		assert_eq!(
			q.shortest_path(&ctx, "a", "a", &PathOptions::default()).await.unwrap(),
			Some(vec!["a".to_owned()])
		);
		// The depth bound cuts long paths off
		let bounded = q
			.shortest_path(
				&ctx,
				"a",
				"d",
				&PathOptions {
					max_depth: 1,
				},
			)
			.await
			.unwrap();
		assert_eq!(bounded, None);
	}

	#[tokio::test]
	async fn pagerank_rewards_pointed_at_nouns() {
		let f = fixture(&[("a", "hub"), ("b", "hub"), ("c", "hub"), ("hub", "a")]).await;
		let ctx = Context::background();
		let q = f.query();
		let ranked = q.pagerank(&ctx, &PageRankOptions::default()).await.unwrap();
		assert_eq!(ranked[0].0, "hub");
		let total: f64 = ranked.iter().map(|(_, r)| r).sum();
		assert!((total - 1.0).abs() < 1e-6, "ranks sum to {total}");
	}
}
