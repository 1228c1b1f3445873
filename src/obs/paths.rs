//! The stable path layout of everything the engine persists through the
//! storage adapter. Changing any of these breaks existing databases.

use crate::val::NounKind;

pub fn noun(id: &str) -> String {
	format!("noun/{id}")
}

pub fn noun_meta(id: &str) -> String {
	format!("noun-meta/{id}")
}

pub fn verb(id: &str) -> String {
	format!("verb/{id}")
}

pub fn verb_meta(id: &str) -> String {
	format!("verb-meta/{id}")
}

/// The out-edge directory of a noun: the verb ids leaving it.
pub fn verb_src(id: &str) -> String {
	format!("verb-src/{id}")
}

pub fn lsm_manifest() -> String {
	"lsm/manifest".to_owned()
}

pub fn sstable(id: u64) -> String {
	format!("lsm/sstable/{id}")
}

pub fn chunk(field: &str, chunk_id: u64) -> String {
	format!("chunk/{field}/{chunk_id}")
}

pub fn sparse(field: &str) -> String {
	format!("sparse/{field}")
}

pub fn hnsw_node(kind: Option<NounKind>, element_id: u64) -> String {
	match kind {
		Some(kind) => format!("hnsw/{kind}/node/{element_id}"),
		None => format!("hnsw/all/node/{element_id}"),
	}
}

pub fn hnsw_node_prefix(kind: Option<NounKind>) -> String {
	match kind {
		Some(kind) => format!("hnsw/{kind}/node"),
		None => "hnsw/all/node".to_owned(),
	}
}

pub fn hnsw_manifest(kind: Option<NounKind>) -> String {
	match kind {
		Some(kind) => format!("hnsw/{kind}/manifest"),
		None => "hnsw/all/manifest".to_owned(),
	}
}

pub fn idmap() -> String {
	"idmap".to_owned()
}

pub fn field_type(field: &str) -> String {
	format!("field-types/{field}")
}

/// Relationships removed after being flushed into the append-only adjacency
/// index; subtracted from graph reads.
pub fn graph_removed() -> String {
	"graph/removed".to_owned()
}
