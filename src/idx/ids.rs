use crate::ctx::Context;
use crate::err::Error;
use crate::obs::{paths, Store};
use radix_trie::Trie;
use serde::{Deserialize, Serialize};

/// The dense integer id of a noun, used wherever bitmaps address entities.
pub type NounInt = u32;

/// A bijection between string noun ids and dense unsigned 32-bit integers.
///
/// Integers are assigned monotonically on first reference and are never
/// reused, so a bitmap written yesterday still means the same nouns today.
/// Deleting a noun does not free its integer. Exhausting the 2³² id space is
/// a fatal, permanent failure.
pub struct NounIds {
	forward: Trie<String, NounInt>,
	reverse: Vec<String>,
	dirty: bool,
}

#[derive(Serialize, Deserialize)]
struct State {
	version: u16,
	ids: Vec<String>,
}

impl NounIds {
	pub fn new() -> Self {
		Self {
			forward: Trie::new(),
			reverse: Vec::new(),
			dirty: false,
		}
	}

	/// Load the persisted mapping, or start empty.
	pub async fn open(store: &Store, ctx: &Context) -> Result<Self, Error> {
		let mut mapper = Self::new();
		if let Some(state) = store.get_record::<State>(ctx, &paths::idmap()).await? {
			for (int, id) in state.ids.iter().enumerate() {
				mapper.forward.insert(id.clone(), int as NounInt);
			}
			mapper.reverse = state.ids;
		}
		Ok(mapper)
	}

	/// Persist the mapping when it changed since the last save.
	pub async fn save(&mut self, store: &Store, ctx: &Context) -> Result<(), Error> {
		if !self.dirty {
			return Ok(());
		}
		let state = State {
			version: 1,
			ids: self.reverse.clone(),
		};
		store.save_record(ctx, &paths::idmap(), &state).await?;
		self.dirty = false;
		Ok(())
	}

	/// The integer for a noun id, assigning the next free integer on first
	/// reference.
	pub fn get_or_assign(&mut self, id: &str) -> Result<NounInt, Error> {
		if let Some(int) = self.forward.get(&id.to_owned()) {
			return Ok(*int);
		}
		if self.reverse.len() >= NounInt::MAX as usize {
			return Err(Error::IdSpaceExhausted);
		}
		let int = self.reverse.len() as NounInt;
		self.reverse.push(id.to_owned());
		self.forward.insert(id.to_owned(), int);
		self.dirty = true;
		Ok(int)
	}

	/// The integer for a noun id, if one was ever assigned.
	pub fn get_int(&self, id: &str) -> Option<NounInt> {
		self.forward.get(&id.to_owned()).copied()
	}

	/// The noun id behind an integer, if one was ever assigned.
	pub fn get_string(&self, int: NounInt) -> Option<&str> {
		self.reverse.get(int as usize).map(String::as_str)
	}

	/// How many integers have been assigned.
	pub fn len(&self) -> usize {
		self.reverse.len()
	}

	pub fn is_empty(&self) -> bool {
		self.reverse.is_empty()
	}
}

impl Default for NounIds {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn assignment_is_monotonic_and_idempotent() {
		let mut ids = NounIds::new();
		assert_eq!(ids.get_or_assign("a").unwrap(), 0);
		assert_eq!(ids.get_or_assign("b").unwrap(), 1);
		assert_eq!(ids.get_or_assign("a").unwrap(), 0);
		assert_eq!(ids.get_int("b"), Some(1));
		assert_eq!(ids.get_int("c"), None);
		assert_eq!(ids.get_string(0), Some("a"));
		assert_eq!(ids.get_string(7), None);
		assert_eq!(ids.len(), 2);
	}

	#[tokio::test]
	async fn mapping_survives_a_reopen() {
		let store = Store::open("memory:").unwrap();
		let ctx = Context::background();
		{
			let mut ids = NounIds::open(&store, &ctx).await.unwrap();
			ids.get_or_assign("x").unwrap();
			ids.get_or_assign("y").unwrap();
			ids.save(&store, &ctx).await.unwrap();
		}
		let mut ids = NounIds::open(&store, &ctx).await.unwrap();
		assert_eq!(ids.get_int("y"), Some(1));
		// New assignments continue after the persisted ones
		assert_eq!(ids.get_or_assign("z").unwrap(), 2);
	}
}
