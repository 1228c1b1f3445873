use std::collections::{BTreeMap, BTreeSet};

/// The in-memory write buffer of the adjacency index: a sorted map of
/// source id → target set, frozen and flushed as a level-0 table once it
/// holds enough relationships.
#[derive(Debug, Default)]
pub(super) struct MemTable {
	map: BTreeMap<String, BTreeSet<String>>,
	relations: usize,
}

impl MemTable {
	/// Record a relationship. Returns false when the exact pair was already
	/// buffered.
	pub(super) fn add(&mut self, source: &str, target: &str) -> bool {
		let added = self.map.entry(source.to_owned()).or_default().insert(target.to_owned());
		if added {
			self.relations += 1;
		}
		added
	}

	pub(super) fn get(&self, source: &str) -> Option<&BTreeSet<String>> {
		self.map.get(source)
	}

	/// Buffered relationships (not distinct sources).
	pub(super) fn relations(&self) -> usize {
		self.relations
	}

	pub(super) fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	/// Freeze the buffer: the caller takes the map, the buffer restarts
	/// empty.
	pub(super) fn take(&mut self) -> BTreeMap<String, BTreeSet<String>> {
		self.relations = 0;
		std::mem::take(&mut self.map)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counts_relations_not_sources() {
		let mut mem = MemTable::default();
		assert!(mem.add("a", "b"));
		assert!(mem.add("a", "c"));
		assert!(!mem.add("a", "b"));
		assert!(mem.add("b", "c"));
		assert_eq!(mem.relations(), 3);
		assert_eq!(mem.get("a").unwrap().len(), 2);
		let frozen = mem.take();
		assert!(mem.is_empty());
		assert_eq!(mem.relations(), 0);
		assert_eq!(frozen.len(), 2);
	}
}
