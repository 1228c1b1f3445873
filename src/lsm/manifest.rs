use crate::ctx::Context;
use crate::err::Error;
use crate::obs::{paths, Store};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The authoritative record of which tables exist and at which level.
///
/// The manifest is the publication point of every flush and compaction:
/// readers see either the pre-merge tables or the post-merge table because
/// the manifest swaps atomically. Tables on storage but absent from the
/// manifest are orphans of an interrupted write; they are ignored at open
/// and never deleted eagerly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(super) struct Manifest {
	pub(super) version: u16,
	/// table id → level.
	pub(super) sstables: BTreeMap<u64, u8>,
	/// Unix milliseconds of the last completed compaction.
	pub(super) last_compaction: i64,
	pub(super) total_relationships: u64,
	pub(super) next_table_id: u64,
}

impl Default for Manifest {
	fn default() -> Self {
		Self {
			version: 1,
			sstables: BTreeMap::new(),
			last_compaction: 0,
			total_relationships: 0,
			next_table_id: 0,
		}
	}
}

impl Manifest {
	pub(super) async fn load(store: &Store, ctx: &Context) -> Result<Self, Error> {
		Ok(store.get_record(ctx, &paths::lsm_manifest()).await?.unwrap_or_default())
	}

	pub(super) async fn save(&self, store: &Store, ctx: &Context) -> Result<(), Error> {
		store.save_record(ctx, &paths::lsm_manifest(), self).await
	}

	/// The table ids referenced at a level, ascending.
	pub(super) fn level(&self, level: u8) -> Vec<u64> {
		self.sstables.iter().filter(|(_, l)| **l == level).map(|(id, _)| *id).collect()
	}

	pub(super) fn tables_per_level(&self) -> BTreeMap<u8, usize> {
		let mut out = BTreeMap::new();
		for level in self.sstables.values() {
			*out.entry(*level).or_insert(0) += 1;
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn round_trips_through_the_store() {
		let store = Store::open("memory:").unwrap();
		let ctx = Context::background();
		assert_eq!(Manifest::load(&store, &ctx).await.unwrap(), Manifest::default());
		let mut manifest = Manifest::default();
		manifest.sstables.insert(1, 0);
		manifest.sstables.insert(2, 0);
		manifest.sstables.insert(3, 1);
		manifest.total_relationships = 42;
		manifest.next_table_id = 4;
		manifest.save(&store, &ctx).await.unwrap();
		let loaded = Manifest::load(&store, &ctx).await.unwrap();
		assert_eq!(loaded, manifest);
		assert_eq!(loaded.level(0), vec![1, 2]);
		assert_eq!(loaded.tables_per_level().get(&0), Some(&2));
	}
}
