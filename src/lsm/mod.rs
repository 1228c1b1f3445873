//! The log-structured merge tree behind the graph adjacency index. Writers
//! append (source, target) pairs into an in-memory buffer; the buffer
//! freezes into immutable level-0 tables; levels compact size-tiered into
//! the level below. Relationships are append-only here: deletions are
//! compensated above this layer, so no tombstones exist.

mod manifest;
mod memtable;
mod sstable;

pub use sstable::{SsTable, TableMeta};

use crate::cache::CacheManager;
use crate::cnf;
use crate::ctx::Context;
use crate::err::Error;
use crate::obs::{paths, Store};
use manifest::Manifest;
use memtable::MemTable;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};

/// Per-engine tuning of the tree.
#[derive(Clone, Debug)]
pub struct LsmOptions {
	/// Relationships buffered before the memtable freezes and flushes.
	pub flush_threshold: usize,
	/// Tables a level may hold before it compacts into the next one.
	pub fanin: usize,
	/// Floor between periodic compaction sweeps.
	pub compaction_interval_ms: u64,
}

impl Default for LsmOptions {
	fn default() -> Self {
		Self {
			flush_threshold: *cnf::MEMTABLE_FLUSH_THRESHOLD,
			fanin: *cnf::COMPACTION_FANIN,
			compaction_interval_ms: *cnf::COMPACTION_INTERVAL_MS,
		}
	}
}

/// Counters surfaced through the engine's stats call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LsmStats {
	pub tables_per_level: BTreeMap<u8, usize>,
	pub total_relationships: u64,
	pub memtable_relations: usize,
	pub quarantined: usize,
}

struct TableEntry {
	loaded: Option<Arc<SsTable>>,
	health: i32,
	quarantined: bool,
}

impl TableEntry {
	fn unloaded() -> Self {
		Self {
			loaded: None,
			health: cnf::TABLE_HEALTH_SCORE,
			quarantined: false,
		}
	}
}

/// The tree. One logical writer mutates it; reads run concurrently and see
/// either the pre-compaction tables or the post-compaction table, never a
/// partial view, because publication is an atomic manifest swap.
pub struct LsmTree {
	store: Arc<Store>,
	cache: Arc<CacheManager>,
	options: LsmOptions,
	memtable: Mutex<MemTable>,
	/// The buffer being flushed, still visible to readers until the table
	/// it becomes is published.
	frozen: RwLock<Option<Arc<BTreeMap<String, BTreeSet<String>>>>>,
	manifest: RwLock<Manifest>,
	tables: RwLock<HashMap<u64, TableEntry>>,
	flushing: AtomicBool,
	flushed: Notify,
	compacting: AtomicBool,
	last_sweep_ms: AtomicI64,
}

impl LsmTree {
	/// Open the tree: load the manifest, register every referenced table,
	/// and report orphans without touching them.
	pub async fn open(
		store: Arc<Store>,
		cache: Arc<CacheManager>,
		ctx: &Context,
		options: LsmOptions,
	) -> Result<Self, Error> {
		let manifest = Manifest::load(&store, ctx).await?;
		let mut tables = HashMap::new();
		for &id in manifest.sstables.keys() {
			tables.insert(id, TableEntry::unloaded());
		}
		for path in store.list_prefix(ctx, "lsm/sstable").await? {
			if let Some(id) = path.rsplit('/').next().and_then(|s| s.parse::<u64>().ok()) {
				if !manifest.sstables.contains_key(&id) {
					// A crash between table write and manifest write leaves
					// an orphan; it is ignored, never deleted eagerly
					debug!("Ignoring orphan sstable {id}");
				}
			}
		}
		Ok(Self {
			store,
			cache,
			options,
			memtable: Mutex::new(MemTable::default()),
			frozen: RwLock::new(None),
			manifest: RwLock::new(manifest),
			tables: RwLock::new(tables),
			flushing: AtomicBool::new(false),
			flushed: Notify::new(),
			compacting: AtomicBool::new(false),
			last_sweep_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
		})
	}

	/// Append a relationship. O(1) amortised; blocks cooperatively when the
	/// buffer is past its high-water mark while a flush is in flight.
	pub async fn add(&self, ctx: &Context, source: &str, target: &str) -> Result<bool, Error> {
		let high_water =
			(self.options.flush_threshold as f64 * cnf::MEMTABLE_HIGH_WATER_RATIO) as usize;
		loop {
			let notified = self.flushed.notified();
			{
				let mem = self.memtable.lock().await;
				if !(self.flushing.load(Ordering::Acquire) && mem.relations() >= high_water) {
					break;
				}
			}
			ctx.check()?;
			notified.await;
		}
		let (added, should_flush) = {
			let mut mem = self.memtable.lock().await;
			let added = mem.add(source, target);
			(added, mem.relations() >= self.options.flush_threshold)
		};
		if should_flush {
			self.flush(ctx).await?;
		} else {
			self.compact_if_due(ctx).await?;
		}
		Ok(added)
	}

	/// The union of every target set recorded for a source, across the
	/// buffer, the frozen buffer, and every surviving table of every level.
	pub async fn get(&self, ctx: &Context, source: &str) -> Result<BTreeSet<String>, Error> {
		ctx.check()?;
		let mut out = BTreeSet::new();
		{
			let mem = self.memtable.lock().await;
			if let Some(targets) = mem.get(source) {
				out.extend(targets.iter().cloned());
			}
		}
		if let Some(frozen) = self.frozen.read().await.as_ref() {
			if let Some(targets) = frozen.get(source) {
				out.extend(targets.iter().cloned());
			}
		}
		let ids: Vec<u64> = {
			let manifest = self.manifest.read().await;
			manifest.sstables.keys().copied().collect()
		};
		for id in ids {
			if let Some(table) = self.table(ctx, id).await? {
				if let Some(targets) = table.get(source) {
					out.extend(targets.iter().cloned());
				}
			}
		}
		Ok(out)
	}

	/// Freeze and persist the memtable as a level-0 table. The frozen
	/// buffer stays readable until the table is published, so a concurrent
	/// read never sees a gap.
	pub async fn flush(&self, ctx: &Context) -> Result<(), Error> {
		if self
			.flushing
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Ok(());
		}
		let result = self.flush_inner(ctx).await;
		self.flushing.store(false, Ordering::Release);
		self.flushed.notify_waiters();
		result?;
		self.maybe_compact(ctx).await
	}

	async fn flush_inner(&self, ctx: &Context) -> Result<(), Error> {
		let frozen_map = {
			let mut mem = self.memtable.lock().await;
			if mem.is_empty() {
				return Ok(());
			}
			Arc::new(mem.take())
		};
		*self.frozen.write().await = Some(frozen_map.clone());

		let id = {
			let mut manifest = self.manifest.write().await;
			let id = manifest.next_table_id;
			manifest.next_table_id += 1;
			id
		};
		let table = SsTable::build(id, 0, (*frozen_map).clone());
		let relations = table.relationship_count();
		let result = self.publish_flush(ctx, table).await;
		if let Err(e) = result {
			// The table is not visible; the data goes back into the buffer
			warn!("Flush of sstable {id} failed, restoring the memtable: {e}");
			let mut mem = self.memtable.lock().await;
			for (source, targets) in frozen_map.iter() {
				for target in targets {
					mem.add(source, target);
				}
			}
			*self.frozen.write().await = None;
			return Err(e);
		}
		*self.frozen.write().await = None;
		debug!("Flushed sstable {id} with {relations} relationships at level 0");
		Ok(())
	}

	async fn publish_flush(&self, ctx: &Context, table: SsTable) -> Result<(), Error> {
		let id = table.id();
		let relations = table.relationship_count();
		let encoded = table.encode()?;
		self.cache.set(ctx, &paths::sstable(id), encoded).await?;
		self.tables.write().await.insert(
			id,
			TableEntry {
				loaded: Some(Arc::new(table)),
				health: cnf::TABLE_HEALTH_SCORE,
				quarantined: false,
			},
		);
		let mut manifest = self.manifest.write().await;
		manifest.sstables.insert(id, 0);
		manifest.total_relationships += relations;
		manifest.save(&self.store, ctx).await
	}

	/// Fetch a table, loading and caching its body on first touch. Read
	/// failures wear the table's health down; at zero it is quarantined and
	/// silently omitted from reads from then on.
	async fn table(&self, ctx: &Context, id: u64) -> Result<Option<Arc<SsTable>>, Error> {
		{
			let tables = self.tables.read().await;
			match tables.get(&id) {
				Some(entry) if entry.quarantined => return Ok(None),
				Some(entry) => {
					if let Some(table) = &entry.loaded {
						return Ok(Some(table.clone()));
					}
				}
				None => return Ok(None),
			}
		}
		let decoded = match self.cache.get(ctx, &paths::sstable(id)).await? {
			Some(bytes) => SsTable::decode(&bytes),
			None => Err(Error::BlobNotFound(paths::sstable(id))),
		};
		let mut tables = self.tables.write().await;
		let entry = tables.entry(id).or_insert_with(TableEntry::unloaded);
		match decoded {
			Ok(table) => {
				let table = Arc::new(table);
				entry.loaded = Some(table.clone());
				entry.health = cnf::TABLE_HEALTH_SCORE;
				Ok(Some(table))
			}
			Err(e) => {
				entry.health -= 1;
				warn!("Failed to read sstable {id} (health {}): {e}", entry.health);
				if entry.health <= 0 && !entry.quarantined {
					entry.quarantined = true;
					error!("Quarantining sstable {id} after repeated read failures");
				}
				Ok(None)
			}
		}
	}

	/// Run the periodic compaction sweep when its interval elapsed. The
	/// size-tiered threshold is also checked after every flush; this sweep
	/// only picks up what that path skipped.
	pub async fn compact_if_due(&self, ctx: &Context) -> Result<(), Error> {
		let now = chrono::Utc::now().timestamp_millis();
		let last = self.last_sweep_ms.load(Ordering::Relaxed);
		let interval = self.options.compaction_interval_ms.min(i64::MAX as u64) as i64;
		if now.saturating_sub(last) < interval {
			return Ok(());
		}
		if self
			.last_sweep_ms
			.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
			.is_err()
		{
			return Ok(());
		}
		self.maybe_compact(ctx).await
	}

	/// Compact every level holding at least `fanin` healthy tables into a
	/// single table one level down. Guarded so that compactions never
	/// overlap; publication is the manifest swap.
	pub async fn maybe_compact(&self, ctx: &Context) -> Result<(), Error> {
		if self
			.compacting
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Ok(());
		}
		// Yield before the heavy lifting
		tokio::task::yield_now().await;
		let result = self.compact_levels(ctx).await;
		self.compacting.store(false, Ordering::Release);
		result
	}

	async fn compact_levels(&self, ctx: &Context) -> Result<(), Error> {
		for level in 0..cnf::MAX_LSM_LEVEL {
			loop {
				ctx.check()?;
				let ids = {
					let manifest = self.manifest.read().await;
					manifest.level(level)
				};
				// Quarantined tables cannot be merged safely
				let mut healthy = Vec::with_capacity(ids.len());
				{
					let tables = self.tables.read().await;
					for id in ids {
						match tables.get(&id) {
							Some(entry) if entry.quarantined => {}
							_ => healthy.push(id),
						}
					}
				}
				if healthy.len() < self.options.fanin {
					break;
				}
				self.compact_level(ctx, level, healthy).await?;
			}
		}
		Ok(())
	}

	async fn compact_level(&self, ctx: &Context, level: u8, ids: Vec<u64>) -> Result<(), Error> {
		let mut inputs = Vec::with_capacity(ids.len());
		for &id in &ids {
			match self.table(ctx, id).await? {
				Some(table) => inputs.push(table),
				// A table that stopped reading mid-plan aborts this merge
				None => return Ok(()),
			}
		}
		let merged_id = {
			let mut manifest = self.manifest.write().await;
			let id = manifest.next_table_id;
			manifest.next_table_id += 1;
			id
		};
		let target_level = (level + 1).min(cnf::MAX_LSM_LEVEL);
		let refs: Vec<&SsTable> = inputs.iter().map(Arc::as_ref).collect();
		let merged = SsTable::merge(&refs, merged_id, target_level);
		let encoded = merged.encode()?;
		self.cache.set(ctx, &paths::sstable(merged_id), encoded).await?;
		let merged = Arc::new(merged);
		// The manifest swap publishes the merge atomically
		{
			let mut manifest = self.manifest.write().await;
			for id in &ids {
				manifest.sstables.remove(id);
			}
			manifest.sstables.insert(merged_id, target_level);
			manifest.last_compaction = chrono::Utc::now().timestamp_millis();
			manifest.save(&self.store, ctx).await?;
		}
		{
			let mut tables = self.tables.write().await;
			for id in &ids {
				tables.remove(id);
			}
			tables.insert(
				merged_id,
				TableEntry {
					loaded: Some(merged),
					health: cnf::TABLE_HEALTH_SCORE,
					quarantined: false,
				},
			);
		}
		// The inputs are unreferenced now; dropping their blobs is safe
		for id in &ids {
			self.cache.delete(ctx, &paths::sstable(*id)).await?;
		}
		info!(
			"Compacted {} level-{level} sstables into sstable {merged_id} at level {target_level}",
			ids.len()
		);
		Ok(())
	}

	pub async fn stats(&self) -> LsmStats {
		let manifest = self.manifest.read().await;
		let tables = self.tables.read().await;
		LsmStats {
			tables_per_level: manifest.tables_per_level(),
			total_relationships: manifest.total_relationships,
			memtable_relations: self.memtable.lock().await.relations(),
			quarantined: tables.values().filter(|t| t.quarantined).count(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::CacheOptions;
	use bytes::Bytes;

	fn small_options() -> LsmOptions {
		LsmOptions {
			flush_threshold: 100,
			fanin: 3,
			compaction_interval_ms: u64::MAX,
		}
	}

	async fn new_tree(store: Arc<Store>, options: LsmOptions) -> LsmTree {
		let cache = Arc::new(CacheManager::new(store.clone(), CacheOptions::default()).unwrap());
		LsmTree::open(store, cache, &Context::background(), options).await.unwrap()
	}

	#[tokio::test]
	async fn reads_union_memtable_and_tables() {
		let store = Arc::new(Store::open("memory:").unwrap());
		let tree = new_tree(store, small_options()).await;
		let ctx = Context::background();
		tree.add(&ctx, "a", "b").await.unwrap();
		tree.add(&ctx, "a", "c").await.unwrap();
		tree.flush(&ctx).await.unwrap();
		tree.add(&ctx, "a", "d").await.unwrap();
		let targets = tree.get(&ctx, "a").await.unwrap();
		assert_eq!(
			targets.into_iter().collect::<Vec<String>>(),
			vec!["b".to_owned(), "c".to_owned(), "d".to_owned()]
		);
		assert_eq!(tree.get(&ctx, "zz").await.unwrap().len(), 0);
	}

	#[tokio::test]
	async fn three_flushes_compact_into_one_level_1_table() {
		let store = Arc::new(Store::open("memory:").unwrap());
		let tree = new_tree(store, small_options()).await;
		let ctx = Context::background();
		// 2.5 flush thresholds of relationships over twenty sources
		for i in 0..250u32 {
			tree.add(&ctx, &format!("s{:02}", i % 20), &format!("t{i}")).await.unwrap();
		}
		// The first two flushes fired on the threshold; force the third
		tree.flush(&ctx).await.unwrap();
		let stats = tree.stats().await;
		assert_eq!(stats.tables_per_level.get(&0), None, "{:?}", stats.tables_per_level);
		assert_eq!(stats.tables_per_level.get(&1), Some(&1), "{:?}", stats.tables_per_level);
		assert_eq!(stats.total_relationships, 250);
		// The merged table unions every flush's range
		for source in 0..20u32 {
			let targets = tree.get(&ctx, &format!("s{source:02}")).await.unwrap();
			let expected: BTreeSet<String> =
				(0..250u32).filter(|i| i % 20 == source).map(|i| format!("t{i}")).collect();
			assert_eq!(targets, expected);
		}
	}

	#[tokio::test]
	async fn orphan_tables_are_ignored_and_kept() {
		let store = Arc::new(Store::open("memory:").unwrap());
		let ctx = Context::background();
		{
			let tree = new_tree(
				store.clone(),
				LsmOptions {
					flush_threshold: 10,
					fanin: 100,
					compaction_interval_ms: u64::MAX,
				},
			)
			.await;
			for i in 0..30u32 {
				tree.add(&ctx, &format!("s{}", i % 3), &format!("t{i}")).await.unwrap();
			}
			tree.flush(&ctx).await.unwrap();
		}
		// A table written without a manifest update: the aftermath of a
		// crash between the two writes
		let orphan = SsTable::build(
			999,
			0,
			[("s0".to_owned(), ["ghost".to_owned()].into_iter().collect())].into_iter().collect(),
		);
		store.put_blob(&ctx, &paths::sstable(999), orphan.encode().unwrap()).await.unwrap();

		let tree = new_tree(store.clone(), small_options()).await;
		let targets = tree.get(&ctx, "s0").await.unwrap();
		assert!(!targets.contains("ghost"), "orphan data leaked into reads");
		assert!(!targets.is_empty());
		// The orphan blob is still on storage, untouched
		assert!(store.get_blob(&ctx, &paths::sstable(999)).await.unwrap().is_some());
	}

	#[tokio::test]
	async fn corrupted_tables_quarantine_after_repeated_failures() {
		let store = Arc::new(Store::open("memory:").unwrap());
		let ctx = Context::background();
		{
			let tree = new_tree(
				store.clone(),
				LsmOptions {
					flush_threshold: 5,
					fanin: 100,
					compaction_interval_ms: u64::MAX,
				},
			)
			.await;
			for i in 0..5u32 {
				tree.add(&ctx, "s", &format!("t{i}")).await.unwrap();
			}
			tree.flush(&ctx).await.unwrap();
		}
		// Corrupt the only table on storage
		let id = {
			let manifest = Manifest::load(&store, &ctx).await.unwrap();
			*manifest.sstables.keys().next().unwrap()
		};
		store.put_blob(&ctx, &paths::sstable(id), Bytes::from_static(b"garbage")).await.unwrap();

		// A fresh tree with a fresh cache sees the corruption
		let tree = new_tree(store, small_options()).await;
		for _ in 0..cnf::TABLE_HEALTH_SCORE {
			// Reads skip the broken table instead of failing
			assert!(tree.get(&ctx, "s").await.unwrap().is_empty());
		}
		assert_eq!(tree.stats().await.quarantined, 1);
	}
}
