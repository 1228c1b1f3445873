//! The storage adapter: byte-level get/put/delete/list of opaque blobs keyed
//! by path strings, built on the [object_store](https://docs.rs/object_store)
//! crate so that the same engine runs over memory, the local filesystem, or
//! S3-compatible object storage.
//!
//! The adapter provides read-your-writes within a single process. Transient
//! failures are retried with exponential backoff; every call observes the
//! cancellation context and the configured deadline.

pub mod paths;

use crate::cnf;
use crate::ctx::Context;
use crate::err::Error;
use crate::val::{Metadata, Noun, Verb};
use bytes::Bytes;
use futures::StreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{parse_url, ObjectStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A pluggable blob store addressed by URL.
pub struct Store {
	backend: Arc<dyn ObjectStore>,
	base: Path,
	remote: bool,
}

impl Store {
	/// Open a store for the given location.
	///
	/// Supported locations: `memory:` for an in-memory store, `file:///path`
	/// for the local filesystem, and any URL the object_store crate can
	/// parse (e.g. `s3://bucket/prefix`) for remote storage.
	pub fn open(location: &str) -> Result<Self, Error> {
		if location == "memory:" || location == "memory" {
			return Ok(Self {
				backend: Arc::new(InMemory::new()),
				base: Path::default(),
				remote: false,
			});
		}
		let url = Url::parse(location).map_err(|e| Error::InvalidUrl {
			url: location.to_owned(),
			message: e.to_string(),
		})?;
		match url.scheme() {
			"file" => {
				let path = url.path();
				if !std::path::Path::new(path).is_dir() {
					fs::create_dir_all(path)?;
				}
				Ok(Self {
					backend: Arc::new(
						LocalFileSystem::new_with_prefix(path).map_err(Error::ObjectStore)?,
					),
					base: Path::default(),
					remote: false,
				})
			}
			_ => {
				let (backend, base) = parse_url(&url).map_err(|e| Error::InvalidUrl {
					url: location.to_owned(),
					message: e.to_string(),
				})?;
				Ok(Self {
					backend: backend.into(),
					base,
					remote: true,
				})
			}
		}
	}

	/// Whether this store talks to remote object storage. The cache tuner
	/// caches more aggressively against remote backends.
	pub fn is_remote(&self) -> bool {
		self.remote
	}

	fn path(&self, path: &str) -> Path {
		if self.base.as_ref().is_empty() {
			Path::from(path)
		} else {
			Path::from(format!("{}/{}", self.base.as_ref(), path))
		}
	}

	/// Run an adapter call with deadline enforcement and retries on
	/// transient failures. Exhaustion surfaces as a permanent failure
	/// carrying the retry history.
	async fn with_retry<T, F, Fut>(&self, ctx: &Context, what: &'static str, f: F) -> Result<T, Error>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T, Error>>,
	{
		let deadline = Duration::from_millis(*cnf::ADAPTER_DEADLINE_MS);
		let attempts = (*cnf::RETRY_ATTEMPTS).max(1);
		let mut history = Vec::new();
		let mut delay = cnf::RETRY_BASE_MS;
		for attempt in 1..=attempts {
			ctx.check()?;
			let res = match tokio::time::timeout(ctx.remaining(deadline), f()).await {
				Ok(res) => res,
				Err(_) => Err(Error::Timedout),
			};
			match res {
				Ok(v) => return Ok(v),
				Err(e) if e.is_transient() => {
					if attempt == attempts {
						warn!("{what} failed after {attempts} attempts: {e}");
						return Err(Error::RetriesExhausted {
							attempts,
							last: Box::new(e),
							history,
						});
					}
					debug!("{what} attempt {attempt} failed, retrying in {delay}ms: {e}");
					history.push(format!("attempt {attempt}: {e}"));
					tokio::time::sleep(Duration::from_millis(delay)).await;
					delay = (delay * cnf::RETRY_FACTOR).min(cnf::RETRY_CAP_MS);
				}
				Err(e) => return Err(e),
			}
		}
		Err(Error::Unreachable("Store::with_retry"))
	}

	/// Fetch the blob stored at a path, if any.
	pub async fn get_blob(&self, ctx: &Context, path: &str) -> Result<Option<Bytes>, Error> {
		let location = self.path(path);
		self.with_retry(ctx, "get_blob", || {
			let location = location.clone();
			async move {
				match self.backend.get(&location).await {
					Ok(data) => Ok(Some(data.bytes().await?)),
					Err(object_store::Error::NotFound {
						..
					}) => Ok(None),
					Err(e) => Err(e.into()),
				}
			}
		})
		.await
	}

	/// Whether a blob exists at a path, without fetching its body.
	pub async fn exists(&self, ctx: &Context, path: &str) -> Result<bool, Error> {
		let location = self.path(path);
		self.with_retry(ctx, "exists", || {
			let location = location.clone();
			async move {
				match self.backend.head(&location).await {
					Ok(_) => Ok(true),
					Err(object_store::Error::NotFound {
						..
					}) => Ok(false),
					Err(e) => Err(e.into()),
				}
			}
		})
		.await
	}

	/// Store a blob at a path, replacing any previous value.
	pub async fn put_blob(&self, ctx: &Context, path: &str, data: Bytes) -> Result<(), Error> {
		let location = self.path(path);
		self.with_retry(ctx, "put_blob", || {
			let location = location.clone();
			let data = data.clone();
			async move {
				let _ = self.backend.put(&location, data).await?;
				Ok(())
			}
		})
		.await
	}

	/// Delete the blob at a path. Deleting a missing blob is not an error.
	pub async fn delete_blob(&self, ctx: &Context, path: &str) -> Result<(), Error> {
		let location = self.path(path);
		self.with_retry(ctx, "delete_blob", || {
			let location = location.clone();
			async move {
				match self.backend.delete(&location).await {
					Ok(()) => Ok(()),
					Err(object_store::Error::NotFound {
						..
					}) => Ok(()),
					Err(e) => Err(e.into()),
				}
			}
		})
		.await
	}

	/// List every path under a prefix.
	pub async fn list_prefix(&self, ctx: &Context, prefix: &str) -> Result<Vec<String>, Error> {
		let location = self.path(prefix);
		self.with_retry(ctx, "list_prefix", || {
			let location = location.clone();
			async move {
				let mut stream = self.backend.list(Some(&location));
				let mut out = Vec::new();
				while let Some(meta) = stream.next().await {
					let meta = meta?;
					let full = meta.location.as_ref();
					let rel = match self.base.as_ref() {
						"" => full,
						base => {
							full.strip_prefix(base).map(|s| s.trim_start_matches('/')).unwrap_or(full)
						}
					};
					out.push(rel.to_owned());
				}
				Ok(out)
			}
		})
		.await
	}

	/// Store a serialisable record at a path.
	pub async fn save_record<T: Serialize>(
		&self,
		ctx: &Context,
		path: &str,
		record: &T,
	) -> Result<(), Error> {
		let data = rmp_serde::to_vec_named(record)?;
		self.put_blob(ctx, path, Bytes::from(data)).await
	}

	/// Fetch and decode the record at a path, if any.
	pub async fn get_record<T: DeserializeOwned>(
		&self,
		ctx: &Context,
		path: &str,
	) -> Result<Option<T>, Error> {
		match self.get_blob(ctx, path).await? {
			Some(data) => Ok(Some(rmp_serde::from_slice(&data)?)),
			None => Ok(None),
		}
	}

	pub async fn save_noun(&self, ctx: &Context, noun: &Noun) -> Result<(), Error> {
		self.save_record(ctx, &paths::noun(&noun.id), noun).await
	}

	pub async fn get_noun(&self, ctx: &Context, id: &str) -> Result<Option<Noun>, Error> {
		self.get_record(ctx, &paths::noun(id)).await
	}

	pub async fn delete_noun(&self, ctx: &Context, id: &str) -> Result<(), Error> {
		self.delete_blob(ctx, &paths::noun(id)).await
	}

	pub async fn save_noun_metadata(
		&self,
		ctx: &Context,
		id: &str,
		metadata: &Metadata,
	) -> Result<(), Error> {
		self.save_record(ctx, &paths::noun_meta(id), metadata).await
	}

	pub async fn get_noun_metadata(&self, ctx: &Context, id: &str) -> Result<Option<Metadata>, Error> {
		self.get_record(ctx, &paths::noun_meta(id)).await
	}

	pub async fn delete_noun_metadata(&self, ctx: &Context, id: &str) -> Result<(), Error> {
		self.delete_blob(ctx, &paths::noun_meta(id)).await
	}

	pub async fn save_verb(&self, ctx: &Context, verb: &Verb) -> Result<(), Error> {
		self.save_record(ctx, &paths::verb(&verb.id), verb).await
	}

	pub async fn get_verb(&self, ctx: &Context, id: &str) -> Result<Option<Verb>, Error> {
		self.get_record(ctx, &paths::verb(id)).await
	}

	pub async fn delete_verb(&self, ctx: &Context, id: &str) -> Result<(), Error> {
		self.delete_blob(ctx, &paths::verb(id)).await
	}

	pub async fn save_verb_metadata(
		&self,
		ctx: &Context,
		id: &str,
		metadata: &Metadata,
	) -> Result<(), Error> {
		self.save_record(ctx, &paths::verb_meta(id), metadata).await
	}

	pub async fn get_verb_metadata(&self, ctx: &Context, id: &str) -> Result<Option<Metadata>, Error> {
		self.get_record(ctx, &paths::verb_meta(id)).await
	}

	pub async fn delete_verb_metadata(&self, ctx: &Context, id: &str) -> Result<(), Error> {
		self.delete_blob(ctx, &paths::verb_meta(id)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::val::{NounKind, Vector};

	#[tokio::test]
	async fn blobs_round_trip_in_memory() {
		let store = Store::open("memory:").unwrap();
		let ctx = Context::background();
		assert_eq!(store.get_blob(&ctx, "a/b").await.unwrap(), None);
		store.put_blob(&ctx, "a/b", Bytes::from_static(b"hello")).await.unwrap();
		assert_eq!(store.get_blob(&ctx, "a/b").await.unwrap(), Some(Bytes::from_static(b"hello")));
		store.delete_blob(&ctx, "a/b").await.unwrap();
		assert_eq!(store.get_blob(&ctx, "a/b").await.unwrap(), None);
		// Deleting again is fine
		store.delete_blob(&ctx, "a/b").await.unwrap();
	}

	#[tokio::test]
	async fn list_prefix_only_returns_matching_paths() {
		let store = Store::open("memory:").unwrap();
		let ctx = Context::background();
		for path in ["noun/1", "noun/2", "verb/1"] {
			store.put_blob(&ctx, path, Bytes::from_static(b"x")).await.unwrap();
		}
		let mut listed = store.list_prefix(&ctx, "noun").await.unwrap();
		listed.sort();
		assert_eq!(listed, vec!["noun/1".to_owned(), "noun/2".to_owned()]);
	}

	#[tokio::test]
	async fn typed_noun_helpers_round_trip() {
		let store = Store::open("memory:").unwrap();
		let ctx = Context::background();
		let noun = Noun {
			id: "n1".to_owned(),
			kind: NounKind::Person,
			vector: Vector::new(vec![0.5, 0.5]),
			created_at: 1_700_000_000_000,
		};
		store.save_noun(&ctx, &noun).await.unwrap();
		assert_eq!(store.get_noun(&ctx, "n1").await.unwrap(), Some(noun));
		assert_eq!(store.get_noun(&ctx, "n2").await.unwrap(), None);
	}

	#[tokio::test]
	async fn cancelled_contexts_abort_before_io() {
		let store = Store::open("memory:").unwrap();
		let ctx = Context::background();
		ctx.cancel();
		let res = store.get_blob(&ctx, "a").await;
		assert!(matches!(res, Err(Error::Cancelled)));
	}

	#[tokio::test]
	async fn filesystem_store_round_trips() {
		let dir = temp_dir::TempDir::new().unwrap();
		let url = format!("file://{}", dir.path().display());
		let store = Store::open(&url).unwrap();
		let ctx = Context::background();
		store.put_blob(&ctx, "lsm/manifest", Bytes::from_static(b"m")).await.unwrap();
		assert_eq!(
			store.get_blob(&ctx, "lsm/manifest").await.unwrap(),
			Some(Bytes::from_static(b"m"))
		);
	}
}
