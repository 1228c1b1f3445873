//! The Sorted String Table: an immutable, sorted, bloom-filtered and
//! zone-mapped file of (source id → target set) entries. The binary layout
//! is stable across versions:
//! {magic, version u16, metadata block, entries block, bloom block, sha-256}
//! with every block length-prefixed and MessagePack-encoded, and the
//! checksum computed over the concatenated entry keys.

use crate::cnf;
use crate::err::Error;
use crate::idx::bloom::Bloom;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

const MAGIC: &[u8; 4] = b"CXSS";
const FORMAT_VERSION: u16 = 1;

/// The self-describing header of a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
	pub id: u64,
	/// Level in [0, 6].
	pub level: u8,
	/// Unix milliseconds.
	pub created_at: i64,
	pub entry_count: u32,
	pub relationship_count: u64,
	pub min_source: String,
	pub max_source: String,
	/// Size of the encoded entries block.
	pub size_bytes: u64,
	pub compressed: bool,
}

/// An immutable sorted table. Once built or decoded it never changes.
#[derive(Debug)]
pub struct SsTable {
	meta: TableMeta,
	/// Sorted by source id; target lists are sorted and deduplicated.
	entries: Vec<(String, Vec<String>)>,
	bloom: Bloom,
}

impl SsTable {
	/// Build a table from a frozen source → targets map.
	pub fn build(id: u64, level: u8, map: BTreeMap<String, BTreeSet<String>>) -> Self {
		let mut bloom = Bloom::new(map.len(), cnf::BLOOM_TARGET_FPR);
		let mut relationship_count = 0u64;
		let mut entries = Vec::with_capacity(map.len());
		for (source, targets) in map {
			bloom.insert(source.as_bytes());
			relationship_count += targets.len() as u64;
			entries.push((source, targets.into_iter().collect()));
		}
		let meta = TableMeta {
			id,
			level,
			created_at: chrono::Utc::now().timestamp_millis(),
			entry_count: entries.len() as u32,
			relationship_count,
			min_source: entries.first().map(|(s, _)| s.clone()).unwrap_or_default(),
			max_source: entries.last().map(|(s, _)| s.clone()).unwrap_or_default(),
			size_bytes: 0,
			compressed: false,
		};
		Self {
			meta,
			entries,
			bloom,
		}
	}

	pub fn meta(&self) -> &TableMeta {
		&self.meta
	}

	pub fn id(&self) -> u64 {
		self.meta.id
	}

	pub fn level(&self) -> u8 {
		self.meta.level
	}

	pub fn relationship_count(&self) -> u64 {
		self.meta.relationship_count
	}

	/// Whether a source id could be present: zone-map prune, then the bloom
	/// filter. Both must pass before the entries are worth searching.
	pub fn candidate(&self, source: &str) -> bool {
		if self.entries.is_empty() {
			return false;
		}
		if source < self.meta.min_source.as_str() || source > self.meta.max_source.as_str() {
			return false;
		}
		self.bloom.might_contain(source.as_bytes())
	}

	/// The target list of a source id, if present.
	pub fn get(&self, source: &str) -> Option<&[String]> {
		if !self.candidate(source) {
			return None;
		}
		let idx = self.entries.binary_search_by(|(s, _)| s.as_str().cmp(source)).ok()?;
		Some(&self.entries[idx].1)
	}

	pub fn iter(&self) -> impl Iterator<Item = &(String, Vec<String>)> {
		self.entries.iter()
	}

	/// Union the inputs into a single table at the target level. Target sets
	/// of shared sources merge; header metadata follows the newest input.
	pub fn merge(inputs: &[&SsTable], id: u64, target_level: u8) -> Self {
		let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
		// Oldest first, so that newer inputs win any per-entry difference
		let mut ordered: Vec<&&SsTable> = inputs.iter().collect();
		ordered.sort_by_key(|t| t.meta.created_at);
		for table in ordered {
			for (source, targets) in &table.entries {
				map.entry(source.clone()).or_default().extend(targets.iter().cloned());
			}
		}
		Self::build(id, target_level, map)
	}

	/// The checksum input: every entry key, concatenated in order.
	fn key_digest(entries: &[(String, Vec<String>)]) -> [u8; 32] {
		let mut hasher = Sha256::new();
		for (source, _) in entries {
			hasher.update(source.as_bytes());
		}
		hasher.finalize().into()
	}

	pub fn encode(&self) -> Result<Bytes, Error> {
		let entries_block = rmp_serde::to_vec(&self.entries)?;
		let mut meta = self.meta.clone();
		meta.size_bytes = entries_block.len() as u64;
		let meta_block = rmp_serde::to_vec_named(&meta)?;
		let bloom_block = self.bloom.encode();

		let mut buf = BytesMut::with_capacity(
			MAGIC.len() + 2 + 12 + meta_block.len() + entries_block.len() + bloom_block.len() + 32,
		);
		buf.put_slice(MAGIC);
		buf.put_u16(FORMAT_VERSION);
		buf.put_u32(meta_block.len() as u32);
		buf.put_slice(&meta_block);
		buf.put_u32(entries_block.len() as u32);
		buf.put_slice(&entries_block);
		buf.put_u32(bloom_block.len() as u32);
		buf.put_slice(&bloom_block);
		buf.put_slice(&Self::key_digest(&self.entries));
		Ok(buf.freeze())
	}

	/// Decode a table, verifying the key checksum. A mismatch is permanent
	/// corruption and is never silently ignored.
	pub fn decode(data: &[u8]) -> Result<Self, Error> {
		let mut buf = data;
		if buf.remaining() < MAGIC.len() + 2 || &buf[..MAGIC.len()] != MAGIC {
			return Err(Error::corrupted("sstable", "bad magic"));
		}
		buf.advance(MAGIC.len());
		let version = buf.get_u16();
		if version != FORMAT_VERSION {
			return Err(Error::corrupted("sstable", format!("unknown version {version}")));
		}
		let meta_block = Self::block(&mut buf)?;
		let meta: TableMeta = rmp_serde::from_slice(meta_block)?;
		let entries_block = Self::block(&mut buf)?;
		let entries: Vec<(String, Vec<String>)> = rmp_serde::from_slice(entries_block)?;
		let bloom_block = Self::block(&mut buf)?;
		let bloom = Bloom::decode(bloom_block)?;
		if buf.remaining() != 32 {
			return Err(Error::corrupted("sstable", "truncated checksum"));
		}
		if buf[..32] != Self::key_digest(&entries) {
			return Err(Error::checksum(format!("sstable {}", meta.id)));
		}
		Ok(Self {
			meta,
			entries,
			bloom,
		})
	}

	fn block<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], Error> {
		if buf.remaining() < 4 {
			return Err(Error::corrupted("sstable", "truncated block length"));
		}
		let len = buf.get_u32() as usize;
		if buf.remaining() < len {
			return Err(Error::corrupted("sstable", "truncated block"));
		}
		let block = &buf[..len];
		buf.advance(len);
		Ok(block)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn table(id: u64, pairs: &[(&str, &[&str])]) -> SsTable {
		let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
		for (source, targets) in pairs {
			map.entry((*source).to_owned())
				.or_default()
				.extend(targets.iter().map(|t| (*t).to_owned()));
		}
		SsTable::build(id, 0, map)
	}

	#[test]
	fn lookup_goes_zone_bloom_then_binary_search() {
		let t = table(1, &[("a", &["x"]), ("m", &["y", "z"]), ("z", &["w"])]);
		assert_eq!(t.get("m"), Some(&["y".to_owned(), "z".to_owned()][..]));
		assert_eq!(t.get("a"), Some(&["x".to_owned()][..]));
		// Out of the zone entirely
		assert!(!t.candidate("zz"));
		assert_eq!(t.get("zz"), None);
		// In the zone but absent
		assert_eq!(t.get("b"), None);
	}

	#[test]
	fn encode_decode_round_trips() {
		let t = table(9, &[("a", &["b", "c"]), ("d", &["e"])]);
		let encoded = t.encode().unwrap();
		let decoded = SsTable::decode(&encoded).unwrap();
		assert_eq!(decoded.meta.id, 9);
		assert_eq!(decoded.meta.entry_count, 2);
		assert_eq!(decoded.meta.relationship_count, 3);
		assert_eq!(decoded.meta.min_source, "a");
		assert_eq!(decoded.meta.max_source, "d");
		assert_eq!(decoded.entries, t.entries);
		assert_eq!(decoded.get("d"), Some(&["e".to_owned()][..]));
	}

	#[test]
	fn corruption_is_detected() {
		let t = table(2, &[("key-aa", &["b"]), ("key-zz", &["d"])]);
		let encoded = t.encode().unwrap().to_vec();
		// A corrupted checksum byte fails verification
		let mut corrupted = encoded.clone();
		let last = corrupted.len() - 1;
		corrupted[last] ^= 0xff;
		assert!(SsTable::decode(&corrupted).is_err());
		// So does a corrupted entry key: flip the last occurrence of the
		// key bytes, which sits in the entries block
		let needle = b"key-aa";
		let pos = encoded
			.windows(needle.len())
			.rposition(|w| w == needle)
			.expect("entry key not found in encoding");
		let mut corrupted = encoded.clone();
		corrupted[pos + 4] = b'X';
		assert!(SsTable::decode(&corrupted).is_err());
		// Truncations are rejected too
		assert!(SsTable::decode(&encoded[..encoded.len() - 8]).is_err());
		assert!(SsTable::decode(b"XXXX").is_err());
	}

	#[test]
	fn merge_unions_target_sets() {
		let t1 = table(1, &[("a", &["x"]), ("b", &["y"])]);
		let t2 = table(2, &[("a", &["z"]), ("c", &["w"])]);
		let merged = SsTable::merge(&[&t1, &t2], 3, 1);
		assert_eq!(merged.level(), 1);
		assert_eq!(merged.get("a"), Some(&["x".to_owned(), "z".to_owned()][..]));
		assert_eq!(merged.get("b"), Some(&["y".to_owned()][..]));
		assert_eq!(merged.get("c"), Some(&["w".to_owned()][..]));
		assert_eq!(merged.relationship_count(), 4);
		// The merged zone covers both inputs
		assert_eq!(merged.meta().min_source, "a");
		assert_eq!(merged.meta().max_source, "c");
	}
}
