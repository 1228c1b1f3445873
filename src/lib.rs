//! An embeddable vector-and-graph database core.
//!
//! Nouns are entities carrying an embedding vector, a kind tag and
//! structured metadata; verbs are typed, weighted relationships between
//! them. The engine answers four classes of queries: approximate
//! nearest-neighbour search over vectors, filtered search combining vector
//! similarity with metadata predicates, graph traversal (multi-hop
//! neighbourhoods, shortest paths, PageRank), and exact metadata lookup.
//!
//! Under the hood: an HNSW vector index (optionally partitioned by noun
//! kind), a chunked metadata index over roaring-bitmap posting lists, a
//! log-structured merge tree for the graph adjacency, and a three-tier
//! cache over pluggable object storage, composed by a transactional
//! operation framework with rollback.
//!
//! ```no_run
//! use cortexdb::{Context, Engine, EngineConfig, NounInput, SearchRequest};
//!
//! # async fn example() -> Result<(), cortexdb::Error> {
//! let engine = Engine::open(EngineConfig::new("memory:", 384)).await?;
//! let ctx = Context::background();
//! let id = engine
//! 	.add(
//! 		&ctx,
//! 		NounInput {
//! 			vector: vec![0.1; 384],
//! 			..Default::default()
//! 		},
//! 	)
//! 	.await?;
//! let hits = engine.search(&ctx, SearchRequest::vector(vec![0.1; 384], 5)).await?;
//! assert_eq!(hits[0].id, id);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod cnf;

#[doc(hidden)]
pub mod cache;
#[doc(hidden)]
pub mod ctx;
#[doc(hidden)]
pub mod dbs;
#[doc(hidden)]
pub mod err;
#[doc(hidden)]
pub mod graph;
#[doc(hidden)]
pub mod idx;
#[doc(hidden)]
pub mod lsm;
#[doc(hidden)]
pub mod obs;
#[doc(hidden)]
pub mod txn;
#[doc(hidden)]
pub mod val;

pub use cache::CacheStats;
pub use ctx::Context;
pub use dbs::{
	Embedder, Engine, EngineConfig, NounInput, NounPatch, NounRecord, Query, SearchRequest,
	SearchResult, Stats, VerbInput, VerbRecord,
};
pub use err::{Error, ErrorKind};
pub use graph::{PageRankOptions, PathOptions};
pub use idx::hnsw::HnswParams;
pub use idx::meta::Filter;
pub use lsm::LsmOptions;
pub use txn::Operation;
pub use val::{Distance, Metadata, NounKind, Scalar, Value, Vector, VerbKind};
