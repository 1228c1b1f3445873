//! The transactional operation framework. An operation executes against the
//! engine and hands back an idempotent rollback action; a transaction runs
//! its operations in order and, on the first failure, fires the collected
//! rollbacks in reverse before surfacing the original error. Atomicity is
//! per-process and post-acknowledgement; there are no read snapshots.

use crate::ctx::Context;
use crate::dbs::EngineInner;
use crate::err::Error;
use crate::obs::paths;
use crate::val::{Metadata, Noun, NounKind, SharedVector, Verb};
use async_recursion::async_recursion;
use bytes::Bytes;
use serde::Serialize;

fn to_bytes<T: Serialize>(value: &T) -> Result<Bytes, Error> {
	Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}

/// One composable engine mutation.
///
/// Operations are a closed tagged sum rather than trait objects: every
/// mutation the engine can perform is enumerable, and each knows how to
/// produce the rollback undoing it. The `is_new` flags let a caller that
/// knows a record is a first insert skip the pre-read capturing prior
/// state; misusing the flag on an existing record only degrades that
/// rollback to a no-op, the existing record itself is never harmed.
#[derive(Clone, Debug)]
pub enum Operation {
	SaveNoun {
		noun: Noun,
		is_new: bool,
	},
	DeleteNoun {
		id: String,
	},
	SaveNounMetadata {
		id: String,
		metadata: Metadata,
		is_new: bool,
	},
	DeleteNounMetadata {
		id: String,
	},
	SaveVerb {
		verb: Verb,
		metadata: Metadata,
		is_new: bool,
	},
	DeleteVerb {
		verb: Verb,
	},
	AddToHnsw {
		id: String,
		kind: NounKind,
		vector: SharedVector,
	},
	RemoveFromHnsw {
		id: String,
		kind: NounKind,
	},
	AddToMetadataIndex {
		id: String,
		metadata: Metadata,
	},
	RemoveFromMetadataIndex {
		id: String,
		metadata: Metadata,
	},
	AddVerbEdge {
		source: String,
		target: String,
	},
	RemoveVerbEdge {
		source: String,
		target: String,
	},
	/// Child operations composed under a single combined rollback.
	Batch {
		label: String,
		ops: Vec<Operation>,
	},
}

impl Operation {
	pub fn name(&self) -> &'static str {
		match self {
			Self::SaveNoun {
				..
			} => "save_noun",
			Self::DeleteNoun {
				..
			} => "delete_noun",
			Self::SaveNounMetadata {
				..
			} => "save_noun_metadata",
			Self::DeleteNounMetadata {
				..
			} => "delete_noun_metadata",
			Self::SaveVerb {
				..
			} => "save_verb",
			Self::DeleteVerb {
				..
			} => "delete_verb",
			Self::AddToHnsw {
				..
			} => "add_to_hnsw",
			Self::RemoveFromHnsw {
				..
			} => "remove_from_hnsw",
			Self::AddToMetadataIndex {
				..
			} => "add_to_metadata_index",
			Self::RemoveFromMetadataIndex {
				..
			} => "remove_from_metadata_index",
			Self::AddVerbEdge {
				..
			} => "add_verb_edge",
			Self::RemoveVerbEdge {
				..
			} => "remove_verb_edge",
			Self::Batch {
				..
			} => "batch",
		}
	}

	/// Run the operation, returning the action that undoes it.
	#[async_recursion]
	pub(crate) async fn execute(
		&self,
		inner: &EngineInner,
		ctx: &Context,
	) -> Result<Rollback, Error> {
		ctx.check()?;
		match self {
			Self::SaveNoun {
				noun,
				is_new,
			} => {
				let path = paths::noun(&noun.id);
				let (prior, created) = if *is_new {
					(None, !inner.cache.exists(ctx, &path).await?)
				} else {
					let prior = inner.cache.get(ctx, &path).await?;
					let created = prior.is_none();
					(prior, created)
				};
				inner.cache.set(ctx, &path, to_bytes(noun)?).await?;
				Ok(Rollback::save_undo(path, prior, created))
			}
			Self::DeleteNoun {
				id,
			} => {
				let path = paths::noun(id);
				let prior = inner.cache.get(ctx, &path).await?;
				inner.cache.delete(ctx, &path).await?;
				Ok(Rollback::blob_restore(path, prior))
			}
			Self::SaveNounMetadata {
				id,
				metadata,
				is_new,
			} => {
				let path = paths::noun_meta(id);
				let (prior, created) = if *is_new {
					(None, !inner.cache.exists(ctx, &path).await?)
				} else {
					let prior = inner.cache.get(ctx, &path).await?;
					let created = prior.is_none();
					(prior, created)
				};
				inner.cache.set(ctx, &path, to_bytes(metadata)?).await?;
				Ok(Rollback::save_undo(path, prior, created))
			}
			Self::DeleteNounMetadata {
				id,
			} => {
				let path = paths::noun_meta(id);
				let prior = inner.cache.get(ctx, &path).await?;
				inner.cache.delete(ctx, &path).await?;
				Ok(Rollback::blob_restore(path, prior))
			}
			Self::SaveVerb {
				verb,
				metadata,
				is_new,
			} => {
				let verb_path = paths::verb(&verb.id);
				let meta_path = paths::verb_meta(&verb.id);
				let src_path = paths::verb_src(&verb.source);
				let (prior_verb, prior_meta, created) = if *is_new {
					(None, None, !inner.cache.exists(ctx, &verb_path).await?)
				} else {
					let prior_verb = inner.cache.get(ctx, &verb_path).await?;
					let created = prior_verb.is_none();
					(prior_verb, inner.cache.get(ctx, &meta_path).await?, created)
				};
				let prior_src = inner.cache.get(ctx, &src_path).await?;
				let mut outgoing = inner.verb_src(ctx, &verb.source).await?;
				if !outgoing.contains(&verb.id) {
					outgoing.push(verb.id.clone());
				}
				inner.cache.set(ctx, &verb_path, to_bytes(verb)?).await?;
				inner.cache.set(ctx, &meta_path, to_bytes(metadata)?).await?;
				inner.cache.set(ctx, &src_path, to_bytes(&outgoing)?).await?;
				Ok(Rollback::Multi(vec![
					Rollback::blob_restore(src_path, prior_src),
					Rollback::save_undo(meta_path, prior_meta, created),
					Rollback::save_undo(verb_path, prior_verb, created),
				]))
			}
			Self::DeleteVerb {
				verb,
			} => {
				let verb_path = paths::verb(&verb.id);
				let meta_path = paths::verb_meta(&verb.id);
				let src_path = paths::verb_src(&verb.source);
				let prior_verb = inner.cache.get(ctx, &verb_path).await?;
				let prior_meta = inner.cache.get(ctx, &meta_path).await?;
				let prior_src = inner.cache.get(ctx, &src_path).await?;
				let mut outgoing = inner.verb_src(ctx, &verb.source).await?;
				outgoing.retain(|id| id != &verb.id);
				inner.cache.delete(ctx, &verb_path).await?;
				inner.cache.delete(ctx, &meta_path).await?;
				inner.cache.set(ctx, &src_path, to_bytes(&outgoing)?).await?;
				Ok(Rollback::Multi(vec![
					Rollback::blob_restore(src_path, prior_src),
					Rollback::blob_restore(meta_path, prior_meta),
					Rollback::blob_restore(verb_path, prior_verb),
				]))
			}
			Self::AddToHnsw {
				id,
				kind,
				vector,
			} => {
				let noun = inner.noun_int(id).await?;
				let mut hnsw = inner.hnsw.write().await;
				let prior = hnsw.get_vector(*kind, noun).cloned();
				hnsw.insert(*kind, noun, vector.clone())?;
				Ok(match prior {
					Some(vector) => Rollback::ReAddToHnsw {
						kind: *kind,
						noun,
						vector,
					},
					None => Rollback::RemoveFromHnsw {
						kind: *kind,
						noun,
					},
				})
			}
			Self::RemoveFromHnsw {
				id,
				kind,
			} => {
				let Some(noun) = inner.ids.lock().await.get_int(id) else {
					return Ok(Rollback::Noop);
				};
				let mut hnsw = inner.hnsw.write().await;
				let prior = hnsw.get_vector(*kind, noun).cloned();
				hnsw.remove(*kind, noun);
				Ok(match prior {
					Some(vector) => Rollback::ReAddToHnsw {
						kind: *kind,
						noun,
						vector,
					},
					None => Rollback::Noop,
				})
			}
			Self::AddToMetadataIndex {
				id,
				metadata,
			} => {
				let noun = inner.noun_int(id).await?;
				inner.meta.write().await.insert_metadata(ctx, noun, metadata).await?;
				Ok(Rollback::RemoveMetadata {
					noun,
					metadata: metadata.clone(),
				})
			}
			Self::RemoveFromMetadataIndex {
				id,
				metadata,
			} => {
				let Some(noun) = inner.ids.lock().await.get_int(id) else {
					return Ok(Rollback::Noop);
				};
				inner.meta.write().await.remove_metadata(ctx, noun, metadata).await?;
				Ok(Rollback::ReAddMetadata {
					noun,
					metadata: metadata.clone(),
				})
			}
			Self::AddVerbEdge {
				source,
				target,
			} => {
				// Assign integers on first reference so that bitmaps can
				// address both endpoints
				inner.noun_int(source).await?;
				inner.noun_int(target).await?;
				inner.lsm.add(ctx, source, target).await?;
				inner.exclusions.write().await.unexclude(source, target);
				Ok(Rollback::SyncEdge {
					source: source.clone(),
					target: target.clone(),
				})
			}
			Self::RemoveVerbEdge {
				source,
				target,
			} => {
				inner.sync_edge(ctx, source, target).await?;
				Ok(Rollback::SyncEdge {
					source: source.clone(),
					target: target.clone(),
				})
			}
			Self::Batch {
				label,
				ops,
			} => {
				let mut undo = Vec::with_capacity(ops.len());
				for op in ops {
					match op.execute(inner, ctx).await {
						Ok(rollback) => undo.push(rollback),
						Err(e) => {
							warn!(
								"Operation {} of batch '{label}' failed, undoing {} siblings: {e}",
								op.name(),
								undo.len()
							);
							undo.reverse();
							if let Err(re) = Rollback::Multi(undo).apply(inner, ctx).await {
								error!("Batch '{label}' rollback failed: {re}");
							}
							return Err(e);
						}
					}
				}
				undo.reverse();
				Ok(Rollback::Multi(undo))
			}
		}
	}
}

/// An idempotent undo action. Applying a rollback twice, or applying it
/// after the state it restores has already been restored, is harmless.
#[derive(Clone, Debug)]
pub(crate) enum Rollback {
	Noop,
	PutBlob {
		path: String,
		data: Bytes,
	},
	DeleteBlob {
		path: String,
	},
	ReAddToHnsw {
		kind: NounKind,
		noun: u32,
		vector: SharedVector,
	},
	RemoveFromHnsw {
		kind: NounKind,
		noun: u32,
	},
	ReAddMetadata {
		noun: u32,
		metadata: Metadata,
	},
	RemoveMetadata {
		noun: u32,
		metadata: Metadata,
	},
	/// Recompute whether a (source, target) edge should be visible from the
	/// verbs that still exist between the pair.
	SyncEdge {
		source: String,
		target: String,
	},
	Multi(Vec<Rollback>),
}

impl Rollback {
	/// Undo a save: restore the prior blob, delete the blob the save
	/// created, or do nothing when a caller misdeclared an existing record
	/// as new (the record is then left intact rather than destroyed).
	fn save_undo(path: String, prior: Option<Bytes>, created: bool) -> Self {
		match prior {
			Some(data) => Self::PutBlob {
				path,
				data,
			},
			None if created => Self::DeleteBlob {
				path,
			},
			None => Self::Noop,
		}
	}

	/// Undo a delete: restore the prior blob if there was one.
	fn blob_restore(path: String, prior: Option<Bytes>) -> Self {
		match prior {
			Some(data) => Self::PutBlob {
				path,
				data,
			},
			None => Self::Noop,
		}
	}

	#[async_recursion]
	pub(crate) async fn apply(&self, inner: &EngineInner, ctx: &Context) -> Result<(), Error> {
		match self {
			Self::Noop => Ok(()),
			Self::PutBlob {
				path,
				data,
			} => inner.cache.set(ctx, path, data.clone()).await,
			Self::DeleteBlob {
				path,
			} => inner.cache.delete(ctx, path).await,
			Self::ReAddToHnsw {
				kind,
				noun,
				vector,
			} => inner.hnsw.write().await.insert(*kind, *noun, vector.clone()),
			Self::RemoveFromHnsw {
				kind,
				noun,
			} => {
				inner.hnsw.write().await.remove(*kind, *noun);
				Ok(())
			}
			Self::ReAddMetadata {
				noun,
				metadata,
			} => inner.meta.write().await.insert_metadata(ctx, *noun, metadata).await,
			Self::RemoveMetadata {
				noun,
				metadata,
			} => inner.meta.write().await.remove_metadata(ctx, *noun, metadata).await,
			Self::SyncEdge {
				source,
				target,
			} => inner.sync_edge(ctx, source, target).await,
			Self::Multi(rollbacks) => {
				for rollback in rollbacks {
					// A failing member is logged and skipped; the rest
					// still run
					if let Err(e) = rollback.apply(inner, ctx).await {
						error!("Rollback step failed and was skipped: {e}");
					}
				}
				Ok(())
			}
		}
	}
}

/// An ordered list of operations executed all-or-nothing with respect to
/// visible state after acknowledgement.
pub struct Transaction {
	ops: Vec<Operation>,
}

impl Transaction {
	pub fn new(ops: Vec<Operation>) -> Self {
		Self {
			ops,
		}
	}

	pub(crate) async fn execute(&self, inner: &EngineInner, ctx: &Context) -> Result<(), Error> {
		let mut undo: Vec<(&'static str, Rollback)> = Vec::with_capacity(self.ops.len());
		for op in &self.ops {
			trace!("Executing operation {}", op.name());
			match op.execute(inner, ctx).await {
				Ok(rollback) => undo.push((op.name(), rollback)),
				Err(e) => {
					warn!(
						"Operation {} failed, rolling back {} completed operations: {e}",
						op.name(),
						undo.len()
					);
					for (name, rollback) in undo.iter().rev() {
						if let Err(re) = rollback.apply(inner, ctx).await {
							error!("Rollback of {name} failed and was skipped: {re}");
						}
					}
					return Err(e);
				}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dbs::{Engine, EngineConfig};
	use crate::val::Vector;
	use std::sync::Arc;

	fn metadata(v: i64) -> Metadata {
		map! { "v".to_owned() => crate::val::Value::from(v) }
	}

	async fn engine() -> Engine {
		Engine::open(EngineConfig::new("memory:", 4)).await.unwrap()
	}

	#[tokio::test]
	async fn executing_then_rolling_back_restores_the_prior_state() {
		let engine = engine().await;
		let ctx = Context::background();
		let inner = &engine.inner;
		inner
			.cache
			.set(&ctx, &paths::noun_meta("x"), to_bytes(&metadata(1)).unwrap())
			.await
			.unwrap();
		let op = Operation::SaveNounMetadata {
			id: "x".to_owned(),
			metadata: metadata(2),
			is_new: false,
		};
		let rollback = op.execute(inner, &ctx).await.unwrap();
		let read = inner.cache.get(&ctx, &paths::noun_meta("x")).await.unwrap().unwrap();
		assert_eq!(rmp_serde::from_slice::<Metadata>(&read).unwrap(), metadata(2));
		rollback.apply(inner, &ctx).await.unwrap();
		let read = inner.cache.get(&ctx, &paths::noun_meta("x")).await.unwrap().unwrap();
		assert_eq!(rmp_serde::from_slice::<Metadata>(&read).unwrap(), metadata(1));
		// Rollbacks tolerate repeated invocation
		rollback.apply(inner, &ctx).await.unwrap();
		let read = inner.cache.get(&ctx, &paths::noun_meta("x")).await.unwrap().unwrap();
		assert_eq!(rmp_serde::from_slice::<Metadata>(&read).unwrap(), metadata(1));
	}

	#[tokio::test]
	async fn first_insert_rollbacks_delete_and_stay_idempotent() {
		let engine = engine().await;
		let ctx = Context::background();
		let inner = &engine.inner;
		let op = Operation::SaveNounMetadata {
			id: "y".to_owned(),
			metadata: metadata(7),
			is_new: true,
		};
		let rollback = op.execute(inner, &ctx).await.unwrap();
		rollback.apply(inner, &ctx).await.unwrap();
		assert!(inner.cache.get(&ctx, &paths::noun_meta("y")).await.unwrap().is_none());
		// Applying it again, with the state already gone, is harmless
		rollback.apply(inner, &ctx).await.unwrap();
		assert!(inner.cache.get(&ctx, &paths::noun_meta("y")).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn misdeclared_is_new_degrades_to_a_noop_without_data_loss() {
		let engine = engine().await;
		let ctx = Context::background();
		let inner = &engine.inner;
		inner
			.cache
			.set(&ctx, &paths::noun_meta("z"), to_bytes(&metadata(1)).unwrap())
			.await
			.unwrap();
		// The caller wrongly declares the record new: the content pre-read
		// is skipped, and the rollback degrades to a no-op instead of
		// destroying the record that was already there
		let op = Operation::SaveNounMetadata {
			id: "z".to_owned(),
			metadata: metadata(2),
			is_new: true,
		};
		let rollback = op.execute(inner, &ctx).await.unwrap();
		rollback.apply(inner, &ctx).await.unwrap();
		let read = inner.cache.get(&ctx, &paths::noun_meta("z")).await.unwrap().unwrap();
		assert_eq!(rmp_serde::from_slice::<Metadata>(&read).unwrap(), metadata(2));
	}

	#[tokio::test]
	async fn batches_expose_one_combined_rollback() {
		let engine = engine().await;
		let ctx = Context::background();
		let inner = &engine.inner;
		let batch = Operation::Batch {
			label: "bulk".to_owned(),
			ops: vec![
				Operation::SaveNounMetadata {
					id: "a".to_owned(),
					metadata: metadata(1),
					is_new: true,
				},
				Operation::SaveNounMetadata {
					id: "b".to_owned(),
					metadata: metadata(2),
					is_new: true,
				},
			],
		};
		let rollback = batch.execute(inner, &ctx).await.unwrap();
		assert!(inner.cache.get(&ctx, &paths::noun_meta("a")).await.unwrap().is_some());
		assert!(inner.cache.get(&ctx, &paths::noun_meta("b")).await.unwrap().is_some());
		rollback.apply(inner, &ctx).await.unwrap();
		assert!(inner.cache.get(&ctx, &paths::noun_meta("a")).await.unwrap().is_none());
		assert!(inner.cache.get(&ctx, &paths::noun_meta("b")).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn a_failing_batch_undoes_its_completed_siblings() {
		let engine = engine().await;
		let ctx = Context::background();
		let inner = &engine.inner;
		let batch = Operation::Batch {
			label: "bulk".to_owned(),
			ops: vec![
				Operation::SaveNounMetadata {
					id: "a".to_owned(),
					metadata: metadata(1),
					is_new: true,
				},
				Operation::AddToHnsw {
					id: "a".to_owned(),
					kind: NounKind::Concept,
					vector: Arc::new(Vector::new(vec![1.0])),
				},
			],
		};
		assert!(batch.execute(inner, &ctx).await.is_err());
		assert!(inner.cache.get(&ctx, &paths::noun_meta("a")).await.unwrap().is_none());
	}
}
