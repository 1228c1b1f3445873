//! The cache auto-tuner. Purely heuristic: it nudges capacity, eviction,
//! TTL and batching knobs from observed hit ratios and the deployment shape.
//! Correctness never depends on its choices.

use crate::cache::CacheOptions;
use crate::cnf;
use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of the per-tier counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
	pub hot_hits: u64,
	pub hot_misses: u64,
	pub warm_hits: u64,
	pub warm_misses: u64,
	pub cold_hits: u64,
	pub cold_misses: u64,
	pub writes: u64,
}

impl CacheStats {
	/// The overall hit ratio across the in-process tiers.
	pub fn hit_ratio(&self) -> f64 {
		let hits = self.hot_hits + self.warm_hits;
		let total = hits + self.warm_misses;
		if total == 0 {
			0.0
		} else {
			hits as f64 / total as f64
		}
	}

	fn hot_hit_ratio(&self) -> f64 {
		let total = self.hot_hits + self.hot_misses;
		if total == 0 {
			0.0
		} else {
			self.hot_hits as f64 / total as f64
		}
	}

	fn warm_hit_ratio(&self) -> f64 {
		let total = self.warm_hits + self.warm_misses;
		if total == 0 {
			0.0
		} else {
			self.warm_hits as f64 / total as f64
		}
	}
}

#[derive(Default)]
pub(super) struct CacheCounters {
	pub(super) hot_hits: AtomicU64,
	pub(super) hot_misses: AtomicU64,
	pub(super) warm_hits: AtomicU64,
	pub(super) warm_misses: AtomicU64,
	pub(super) cold_hits: AtomicU64,
	pub(super) cold_misses: AtomicU64,
	pub(super) writes: AtomicU64,
}

impl CacheCounters {
	pub(super) fn hot_missed(&self) {
		self.hot_misses.fetch_add(1, Ordering::Relaxed);
	}

	pub(super) fn snapshot(&self) -> CacheStats {
		CacheStats {
			hot_hits: self.hot_hits.load(Ordering::Relaxed),
			hot_misses: self.hot_misses.load(Ordering::Relaxed),
			warm_hits: self.warm_hits.load(Ordering::Relaxed),
			warm_misses: self.warm_misses.load(Ordering::Relaxed),
			cold_hits: self.cold_hits.load(Ordering::Relaxed),
			cold_misses: self.cold_misses.load(Ordering::Relaxed),
			writes: self.writes.load(Ordering::Relaxed),
		}
	}
}

/// The tunable knobs and the state the tuner needs between evaluations.
pub(super) struct TuneState {
	pub(super) hot_max_bytes: usize,
	pub(super) eviction_threshold: f64,
	pub(super) warm_ttl_ms: i64,
	pub(super) batch_size: usize,
	pub(super) last_eval_ms: i64,
	memory_budget: usize,
	read_only: bool,
	remote: bool,
	last_stats: CacheStats,
}

impl TuneState {
	pub(super) fn new(options: &CacheOptions, remote: bool) -> Self {
		let memory_budget = options.memory_budget.unwrap_or(*cnf::CACHE_HOT_MAX_BYTES);
		Self {
			hot_max_bytes: memory_budget / 4,
			eviction_threshold: cnf::HOT_EVICTION_THRESHOLD,
			warm_ttl_ms: cnf::WARM_TTL_HOURS * 60 * 60 * 1_000,
			batch_size: cnf::CACHE_BATCH_SIZE,
			last_eval_ms: chrono::Utc::now().timestamp_millis(),
			memory_budget,
			read_only: options.read_only,
			remote,
			last_stats: CacheStats::default(),
		}
	}

	/// Re-derive the knobs from the counters accumulated since the previous
	/// evaluation.
	pub(super) fn adjust(&mut self, stats: &CacheStats, now_ms: i64) {
		let delta = CacheStats {
			hot_hits: stats.hot_hits - self.last_stats.hot_hits,
			hot_misses: stats.hot_misses - self.last_stats.hot_misses,
			warm_hits: stats.warm_hits - self.last_stats.warm_hits,
			warm_misses: stats.warm_misses - self.last_stats.warm_misses,
			cold_hits: stats.cold_hits - self.last_stats.cold_hits,
			cold_misses: stats.cold_misses - self.last_stats.cold_misses,
			writes: stats.writes - self.last_stats.writes,
		};
		let reads = delta.hot_hits + delta.hot_misses;
		let hot_ratio = delta.hot_hit_ratio();
		let warm_ratio = delta.warm_hit_ratio();
		let update_rate = if reads + delta.writes == 0 {
			0.0
		} else {
			delta.writes as f64 / (reads + delta.writes) as f64
		};

		// Hot capacity: 10% of the budget, stepping towards 40% when the
		// deployment shape rewards residency
		let mut fraction: f64 = 0.10;
		if self.read_only {
			fraction += 0.10;
		}
		if self.remote {
			fraction += 0.10;
		}
		if hot_ratio > 0.5 {
			fraction += 0.10;
		}
		self.hot_max_bytes = (self.memory_budget as f64 * fraction.min(0.40)) as usize;

		// A hot tier that keeps hitting can run fuller before eviction
		self.eviction_threshold = (0.6 + 0.35 * hot_ratio).clamp(0.6, 0.95);

		// Warm TTL between 6h and 72h: longer when warm hits pay off,
		// shorter when the data churns
		let base_hours = 24.0 * (0.5 + warm_ratio) / (0.5 + update_rate);
		self.warm_ttl_ms = ((base_hours.clamp(6.0, 72.0)) * 60.0 * 60.0 * 1_000.0) as i64;

		// Bigger adapter batches against remote storage and poor hit rates
		let miss_pressure = 1.0 - hot_ratio;
		let mut batch = cnf::CACHE_BATCH_SIZE as f64 * (1.0 + 3.0 * miss_pressure);
		if self.remote {
			batch *= 1.5;
		}
		self.batch_size = (batch as usize).clamp(5, 300);

		self.last_eval_ms = now_ms;
		self.last_stats = *stats;
		debug!(
			"Cache tuner: hot_max={}B threshold={:.2} warm_ttl={}ms batch={}",
			self.hot_max_bytes, self.eviction_threshold, self.warm_ttl_ms, self.batch_size
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn knobs_stay_within_their_bounds() {
		let mut tune = TuneState::new(&CacheOptions::default(), true);
		let mut stats = CacheStats::default();
		for round in 0..10u64 {
			stats.hot_hits += round * 100;
			stats.hot_misses += 50;
			stats.warm_hits += 20;
			stats.warm_misses += 30;
			stats.writes += round * 10;
			tune.adjust(&stats, round as i64 * 600_000);
			assert!(tune.eviction_threshold >= 0.6 && tune.eviction_threshold <= 0.95);
			assert!(tune.batch_size >= 5 && tune.batch_size <= 300);
			let six_hours = 6 * 60 * 60 * 1_000;
			assert!(tune.warm_ttl_ms >= six_hours && tune.warm_ttl_ms <= 12 * six_hours);
			assert!(tune.hot_max_bytes <= (tune.memory_budget as f64 * 0.4) as usize);
		}
	}
}
