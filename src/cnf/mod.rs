use once_cell::sync::Lazy;

/// Specifies how many relationships the in-memory write buffer of the
/// adjacency index may accumulate before it is frozen and flushed as a
/// level-0 table.
pub static MEMTABLE_FLUSH_THRESHOLD: Lazy<usize> =
	lazy_env_parse!("CORTEXDB_MEMTABLE_FLUSH_THRESHOLD", usize, 100_000);

/// The multiple of the flush threshold past which new relationship writes
/// block while a flush is already in flight.
pub const MEMTABLE_HIGH_WATER_RATIO: f64 = 1.5;

/// How many tables a level may hold before the whole level is merged into a
/// single table one level down.
pub static COMPACTION_FANIN: Lazy<usize> = lazy_env_parse!("CORTEXDB_COMPACTION_FANIN", usize, 10);

/// The minimum elapsed time between background compaction sweeps. The
/// size-tiered threshold above is authoritative and is also checked after
/// every flush; this interval is a floor between the periodic re-checks, not
/// a schedule that forces merges.
pub static COMPACTION_INTERVAL_MS: Lazy<u64> =
	lazy_env_parse!("CORTEXDB_COMPACTION_INTERVAL_MS", u64, 60_000);

/// The deepest level of the adjacency index.
pub const MAX_LSM_LEVEL: u8 = 6;

/// Target false-positive rate for the per-table and per-chunk bloom filters.
pub const BLOOM_TARGET_FPR: f64 = 0.01;

/// Number of read failures a table may accumulate before it is quarantined.
pub const TABLE_HEALTH_SCORE: i32 = 3;

/// A metadata chunk holding more distinct values than this is split in two
/// at the median value.
pub static CHUNK_SPLIT_THRESHOLD: Lazy<usize> =
	lazy_env_parse!("CORTEXDB_CHUNK_SPLIT_THRESHOLD", usize, 80);

/// Two adjacent metadata chunks whose combined distinct-value count stays
/// below this may be merged.
pub static CHUNK_MERGE_THRESHOLD: Lazy<usize> =
	lazy_env_parse!("CORTEXDB_CHUNK_MERGE_THRESHOLD", usize, 20);

/// How many values of a previously unseen field are sampled before its
/// semantic type is classified.
pub const FIELD_SAMPLE_SIZE: usize = 100;

/// Deadline applied to every storage adapter call.
pub static ADAPTER_DEADLINE_MS: Lazy<u64> =
	lazy_env_parse!("CORTEXDB_ADAPTER_DEADLINE_MS", u64, 30_000);

/// Base delay of the exponential backoff applied to transient adapter
/// failures.
pub const RETRY_BASE_MS: u64 = 1_000;

/// Multiplication factor of the retry backoff.
pub const RETRY_FACTOR: u64 = 2;

/// Upper bound on a single retry delay.
pub const RETRY_CAP_MS: u64 = 30_000;

/// How many attempts are made before a transient failure is surfaced as
/// permanent.
pub static RETRY_ATTEMPTS: Lazy<u32> = lazy_env_parse!("CORTEXDB_RETRY_ATTEMPTS", u32, 3);

/// How long a caller may queue for the cache before the acquire fails.
pub static CACHE_QUEUE_TIMEOUT_MS: Lazy<u64> =
	lazy_env_parse!("CORTEXDB_CACHE_QUEUE_TIMEOUT_MS", u64, 30_000);

/// Upper bound on concurrently queued cache acquisitions; past it new
/// waiters are rejected as overloaded.
pub static CACHE_MAX_QUEUE: Lazy<usize> = lazy_env_parse!("CORTEXDB_CACHE_MAX_QUEUE", usize, 1_024);

/// Fraction of the hot-tier capacity past which eviction starts.
pub const HOT_EVICTION_THRESHOLD: f64 = 0.8;

/// Fraction of hot entries, oldest first, removed by one eviction pass.
pub const HOT_EVICT_FRACTION: f64 = 0.2;

/// Default time-to-live of warm-tier entries.
pub const WARM_TTL_HOURS: i64 = 24;

/// Default size of a batched adapter read issued for coalesced cache misses.
pub const CACHE_BATCH_SIZE: usize = 50;

/// How often the cache tuner re-evaluates its knobs.
pub static CACHE_TUNER_INTERVAL_MS: Lazy<u64> =
	lazy_env_parse!("CORTEXDB_CACHE_TUNER_INTERVAL_MS", u64, 300_000);

/// Default hot-tier capacity in bytes, used when no memory budget is
/// configured on the engine.
pub static CACHE_HOT_MAX_BYTES: Lazy<usize> =
	lazy_env_parse!("CORTEXDB_CACHE_HOT_MAX_BYTES", usize, 256 * 1024 * 1024);

/// Default number of bidirectional links per vector-index node above level
/// zero.
pub const HNSW_DEFAULT_M: u8 = 16;

/// Default beam width used while inserting into the vector index.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: u16 = 200;

/// Default beam width used while searching the vector index.
pub const HNSW_DEFAULT_EF_SEARCH: u16 = 100;
