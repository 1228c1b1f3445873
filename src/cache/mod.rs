//! The multi-level cache: a hot in-memory LRU tier, a warm node-local
//! persistent tier with a TTL, and the storage adapter as the authoritative
//! cold tier. The cache borrows everything it holds; evicting any entry is
//! always safe.

mod tune;

pub use tune::CacheStats;
use tune::{CacheCounters, TuneState};

use crate::cnf;
use crate::ctx::Context;
use crate::err::Error;
use crate::obs::Store;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

/// How many cache operations may run concurrently before callers queue.
const CONCURRENT_OPS: usize = 64;

/// Construction options for the cache manager.
#[derive(Clone, Debug, Default)]
pub struct CacheOptions {
	/// Total memory budget the tuner sizes the hot tier within. Defaults to
	/// the configured hot maximum when unset.
	pub memory_budget: Option<usize>,
	/// Directory of the warm tier. In-memory when unset.
	pub warm_dir: Option<PathBuf>,
	/// Read-only engines cache more aggressively.
	pub read_only: bool,
}

struct HotEntry {
	value: Bytes,
	last_access: u64,
}

#[derive(Default)]
struct HotTier {
	entries: HashMap<String, HotEntry>,
	total_bytes: usize,
}

/// The cache manager. See the module documentation.
pub struct CacheManager {
	store: Arc<Store>,
	hot: Mutex<HotTier>,
	warm: Arc<dyn ObjectStore>,
	clock: AtomicU64,
	counters: CacheCounters,
	tune: Mutex<TuneState>,
	permits: Semaphore,
	queued: AtomicUsize,
}

impl CacheManager {
	pub fn new(store: Arc<Store>, options: CacheOptions) -> Result<Self, Error> {
		let warm: Arc<dyn ObjectStore> = match &options.warm_dir {
			Some(dir) => {
				if !dir.is_dir() {
					std::fs::create_dir_all(dir)?;
				}
				Arc::new(LocalFileSystem::new_with_prefix(dir).map_err(Error::ObjectStore)?)
			}
			None => Arc::new(InMemory::new()),
		};
		let tune = TuneState::new(&options, store.is_remote());
		Ok(Self {
			store,
			hot: Mutex::new(HotTier::default()),
			warm,
			clock: AtomicU64::new(0),
			counters: CacheCounters::default(),
			tune: Mutex::new(tune),
			permits: Semaphore::new(CONCURRENT_OPS),
			queued: AtomicUsize::new(0),
		})
	}

	/// Bounded admission: fail fast when the queue is full, queue with a
	/// timeout otherwise.
	async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>, Error> {
		let queued = self.queued.fetch_add(1, Ordering::Relaxed);
		if queued >= *cnf::CACHE_MAX_QUEUE {
			self.queued.fetch_sub(1, Ordering::Relaxed);
			return Err(Error::Overloaded {
				queued,
			});
		}
		let timeout = Duration::from_millis(*cnf::CACHE_QUEUE_TIMEOUT_MS);
		let permit = tokio::time::timeout(timeout, self.permits.acquire()).await;
		self.queued.fetch_sub(1, Ordering::Relaxed);
		match permit {
			Ok(Ok(permit)) => Ok(permit),
			Ok(Err(_)) => Err(Error::Unreachable("CacheManager::acquire")),
			Err(_) => Err(Error::Timedout),
		}
	}

	fn tick(&self) -> u64 {
		self.clock.fetch_add(1, Ordering::Relaxed)
	}

	/// Fetch a value, trying hot, then warm, then the adapter. Hits promote
	/// the entry into the faster tiers.
	pub async fn get(&self, ctx: &Context, path: &str) -> Result<Option<Bytes>, Error> {
		let _permit = self.acquire().await?;
		self.get_unqueued(ctx, path).await
	}

	async fn get_unqueued(&self, ctx: &Context, path: &str) -> Result<Option<Bytes>, Error> {
		ctx.check()?;
		// Hot tier
		{
			let mut hot = self.hot.lock().await;
			if let Some(entry) = hot.entries.get_mut(path) {
				entry.last_access = self.tick();
				self.counters.hot_hits.fetch_add(1, Ordering::Relaxed);
				let value = entry.value.clone();
				drop(hot);
				self.maybe_tune().await;
				return Ok(Some(value));
			}
		}
		self.counters.hot_missed();
		// Warm tier
		if let Some(value) = self.warm_get(path).await? {
			self.counters.warm_hits.fetch_add(1, Ordering::Relaxed);
			self.hot_put(path, value.clone()).await;
			self.maybe_tune().await;
			return Ok(Some(value));
		}
		self.counters.warm_misses.fetch_add(1, Ordering::Relaxed);
		// Cold tier
		match self.store.get_blob(ctx, path).await? {
			Some(value) => {
				self.counters.cold_hits.fetch_add(1, Ordering::Relaxed);
				self.warm_put(path, &value).await;
				self.hot_put(path, value.clone()).await;
				self.maybe_tune().await;
				Ok(Some(value))
			}
			None => {
				self.counters.cold_misses.fetch_add(1, Ordering::Relaxed);
				Ok(None)
			}
		}
	}

	/// Fetch many values, coalescing the misses into batched adapter reads.
	pub async fn get_many(
		&self,
		ctx: &Context,
		paths: &[String],
	) -> Result<Vec<Option<Bytes>>, Error> {
		let _permit = self.acquire().await?;
		let mut out: Vec<Option<Bytes>> = vec![None; paths.len()];
		let mut missing: Vec<usize> = Vec::new();
		for (i, path) in paths.iter().enumerate() {
			ctx.check()?;
			// Probe the fast tiers only; the cold fetch is batched below
			let hit = {
				let mut hot = self.hot.lock().await;
				if let Some(entry) = hot.entries.get_mut(path.as_str()) {
					entry.last_access = self.tick();
					self.counters.hot_hits.fetch_add(1, Ordering::Relaxed);
					Some(entry.value.clone())
				} else {
					None
				}
			};
			let hit = match hit {
				Some(v) => Some(v),
				None => {
					self.counters.hot_missed();
					match self.warm_get(path).await? {
						Some(v) => {
							self.counters.warm_hits.fetch_add(1, Ordering::Relaxed);
							self.hot_put(path, v.clone()).await;
							Some(v)
						}
						None => {
							self.counters.warm_misses.fetch_add(1, Ordering::Relaxed);
							None
						}
					}
				}
			};
			match hit {
				Some(v) => out[i] = Some(v),
				None => missing.push(i),
			}
		}
		let batch_size = self.tune.lock().await.batch_size.max(1);
		for batch in missing.chunks(batch_size) {
			ctx.check()?;
			let fetches = batch.iter().map(|&i| self.store.get_blob(ctx, &paths[i]));
			let results = futures::future::join_all(fetches).await;
			for (&i, fetched) in batch.iter().zip(results) {
				match fetched? {
					Some(value) => {
						self.counters.cold_hits.fetch_add(1, Ordering::Relaxed);
						self.warm_put(&paths[i], &value).await;
						self.hot_put(&paths[i], value.clone()).await;
						out[i] = Some(value);
					}
					None => {
						self.counters.cold_misses.fetch_add(1, Ordering::Relaxed);
					}
				}
			}
		}
		self.maybe_tune().await;
		Ok(out)
	}

	/// Whether a value exists, probing the fast tiers before asking the
	/// adapter for a body-less head.
	pub async fn exists(&self, ctx: &Context, path: &str) -> Result<bool, Error> {
		ctx.check()?;
		if self.hot.lock().await.entries.contains_key(path) {
			return Ok(true);
		}
		if self.warm_get(path).await?.is_some() {
			return Ok(true);
		}
		self.store.exists(ctx, path).await
	}

	/// Write a value through every tier.
	pub async fn set(&self, ctx: &Context, path: &str, value: Bytes) -> Result<(), Error> {
		let _permit = self.acquire().await?;
		self.store.put_blob(ctx, path, value.clone()).await?;
		self.warm_put(path, &value).await;
		self.hot_put(path, value).await;
		self.counters.writes.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	/// Remove a value from every tier.
	pub async fn delete(&self, ctx: &Context, path: &str) -> Result<(), Error> {
		let _permit = self.acquire().await?;
		self.store.delete_blob(ctx, path).await?;
		self.warm_delete(path).await;
		let mut hot = self.hot.lock().await;
		if let Some(entry) = hot.entries.remove(path) {
			hot.total_bytes = hot.total_bytes.saturating_sub(entry.value.len());
		}
		Ok(())
	}

	/// Warm the tiers for ids about to be read.
	pub async fn prefetch(&self, ctx: &Context, paths: &[String]) -> Result<(), Error> {
		self.get_many(ctx, paths).await.map(|_| ())
	}

	/// Per-tier counters.
	pub fn stats(&self) -> CacheStats {
		self.counters.snapshot()
	}

	async fn hot_put(&self, path: &str, value: Bytes) {
		let (hot_max, threshold) = {
			let tune = self.tune.lock().await;
			(tune.hot_max_bytes, tune.eviction_threshold)
		};
		let mut hot = self.hot.lock().await;
		let len = value.len();
		if let Some(old) = hot.entries.insert(
			path.to_owned(),
			HotEntry {
				value,
				last_access: self.tick(),
			},
		) {
			hot.total_bytes = hot.total_bytes.saturating_sub(old.value.len());
		}
		hot.total_bytes += len;
		if (hot.total_bytes as f64) > hot_max as f64 * threshold {
			Self::evict(&mut hot);
		}
	}

	/// Remove the oldest entries by last access, a fifth of the tier at a
	/// time.
	fn evict(hot: &mut HotTier) {
		let evict = ((hot.entries.len() as f64 * cnf::HOT_EVICT_FRACTION).ceil() as usize).max(1);
		let mut by_age: Vec<(u64, String)> =
			hot.entries.iter().map(|(k, e)| (e.last_access, k.clone())).collect();
		by_age.sort_unstable();
		for (_, key) in by_age.into_iter().take(evict) {
			if let Some(entry) = hot.entries.remove(&key) {
				hot.total_bytes = hot.total_bytes.saturating_sub(entry.value.len());
			}
		}
		trace!("Evicted {evict} hot cache entries, {} bytes resident", hot.total_bytes);
	}

	/// Warm entries carry their expiry in a fixed header so that the tier
	/// needs no separate index to survive restarts.
	async fn warm_put(&self, path: &str, value: &Bytes) {
		let ttl_ms = self.tune.lock().await.warm_ttl_ms;
		let expires_at = chrono::Utc::now().timestamp_millis() + ttl_ms;
		let mut buf = BytesMut::with_capacity(8 + value.len());
		buf.put_i64(expires_at);
		buf.put_slice(value);
		// The warm tier is advisory; a failed write only costs a future miss
		if let Err(e) = self.warm.put(&Path::from(path), buf.freeze()).await {
			trace!("Warm tier write failed for {path}: {e}");
		}
	}

	async fn warm_get(&self, path: &str) -> Result<Option<Bytes>, Error> {
		let location = Path::from(path);
		let mut data = match self.warm.get(&location).await {
			Ok(data) => data.bytes().await.map_err(Error::ObjectStore)?,
			Err(object_store::Error::NotFound {
				..
			}) => return Ok(None),
			Err(e) => {
				trace!("Warm tier read failed for {path}: {e}");
				return Ok(None);
			}
		};
		if data.len() < 8 {
			self.warm_delete(path).await;
			return Ok(None);
		}
		let expires_at = data.get_i64();
		if expires_at <= chrono::Utc::now().timestamp_millis() {
			// Lazily purge the expired entry
			self.warm_delete(path).await;
			return Ok(None);
		}
		Ok(Some(data))
	}

	async fn warm_delete(&self, path: &str) {
		if let Err(e) = self.warm.delete(&Path::from(path)).await {
			if !matches!(e, object_store::Error::NotFound { .. }) {
				trace!("Warm tier delete failed for {path}: {e}");
			}
		}
	}

	/// Re-evaluate the tuning knobs when the evaluation interval elapsed.
	async fn maybe_tune(&self) {
		let now = chrono::Utc::now().timestamp_millis();
		let mut tune = self.tune.lock().await;
		if now - tune.last_eval_ms < *cnf::CACHE_TUNER_INTERVAL_MS as i64 {
			return;
		}
		tune.adjust(&self.counters.snapshot(), now);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn manager() -> CacheManager {
		let store = Arc::new(Store::open("memory:").unwrap());
		CacheManager::new(store, CacheOptions::default()).unwrap()
	}

	#[tokio::test]
	async fn a_cold_hit_populates_both_tiers() {
		let cache = manager();
		let ctx = Context::background();
		cache.store.put_blob(&ctx, "z", Bytes::from_static(b"cold")).await.unwrap();

		let value = cache.get(&ctx, "z").await.unwrap().unwrap();
		assert_eq!(value, Bytes::from_static(b"cold"));
		let stats = cache.stats();
		assert_eq!(stats.hot_misses, 1);
		assert_eq!(stats.warm_misses, 1);
		assert_eq!(stats.cold_hits, 1);

		// The second read is a hot hit and nothing else
		cache.get(&ctx, "z").await.unwrap().unwrap();
		let stats = cache.stats();
		assert_eq!(stats.hot_hits, 1);
		assert_eq!(stats.warm_misses, 1);
		assert_eq!(stats.cold_hits, 1);
	}

	#[tokio::test]
	async fn set_then_get_round_trips() {
		let cache = manager();
		let ctx = Context::background();
		cache.set(&ctx, "k", Bytes::from_static(b"v")).await.unwrap();
		assert_eq!(cache.get(&ctx, "k").await.unwrap(), Some(Bytes::from_static(b"v")));
		// The write went through to the adapter
		assert_eq!(cache.store.get_blob(&ctx, "k").await.unwrap(), Some(Bytes::from_static(b"v")));
		cache.delete(&ctx, "k").await.unwrap();
		assert_eq!(cache.get(&ctx, "k").await.unwrap(), None);
		assert_eq!(cache.store.get_blob(&ctx, "k").await.unwrap(), None);
	}

	#[tokio::test]
	async fn get_many_coalesces_misses() {
		let cache = manager();
		let ctx = Context::background();
		let paths: Vec<String> = (0..20).map(|i| format!("p/{i}")).collect();
		for path in &paths {
			cache.store.put_blob(&ctx, path, Bytes::from(path.clone())).await.unwrap();
		}
		let got = cache.get_many(&ctx, &paths).await.unwrap();
		assert!(got.iter().all(Option::is_some));
		assert_eq!(cache.stats().cold_hits, 20);
		// All hot now
		let got = cache.get_many(&ctx, &paths).await.unwrap();
		assert!(got.iter().all(Option::is_some));
		assert_eq!(cache.stats().hot_hits, 20);
	}

	#[tokio::test]
	async fn missing_paths_stay_missing() {
		let cache = manager();
		let ctx = Context::background();
		assert_eq!(cache.get(&ctx, "nope").await.unwrap(), None);
		assert_eq!(cache.stats().cold_misses, 1);
	}

	#[tokio::test]
	async fn hot_eviction_never_loses_data() {
		let store = Arc::new(Store::open("memory:").unwrap());
		let cache = CacheManager::new(
			store,
			CacheOptions {
				memory_budget: Some(2_000),
				..Default::default()
			},
		)
		.unwrap();
		let ctx = Context::background();
		// Overflow the hot tier many times over
		for i in 0..100 {
			cache.set(&ctx, &format!("e/{i}"), Bytes::from(vec![0u8; 100])).await.unwrap();
		}
		let resident = cache.hot.lock().await.entries.len();
		assert!(resident < 100, "eviction never ran: {resident}");
		// Every value is still reachable through the lower tiers
		for i in 0..100 {
			assert!(cache.get(&ctx, &format!("e/{i}")).await.unwrap().is_some());
		}
	}
}
