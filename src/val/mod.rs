mod kind;
mod record;
mod vector;

pub use kind::{NounKind, VerbKind};
pub use record::{Noun, Verb};
pub use vector::{Distance, SharedVector, Vector};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A free-form metadata object attached to a noun or verb.
pub type Metadata = BTreeMap<String, Value>;

/// A primitive metadata leaf.
///
/// Leaf values are pinned to this closed sum; anything else is rejected at
/// the API boundary rather than smuggled through as an opaque blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Scalar {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Str(String),
}

impl Scalar {
	pub fn is_null(&self) -> bool {
		matches!(self, Self::Null)
	}

	/// The numeric value, when this scalar is a number.
	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Self::Int(i) => Some(*i as f64),
			Self::Float(f) => Some(*f),
			_ => None,
		}
	}

	fn discriminant(&self) -> u8 {
		match self {
			Self::Null => 0,
			Self::Bool(_) => 1,
			Self::Int(_) => 2,
			Self::Float(_) => 3,
			Self::Str(_) => 4,
		}
	}
}

impl PartialEq for Scalar {
	fn eq(&self, other: &Self) -> bool {
		self.cmp(other) == Ordering::Equal
	}
}

impl Eq for Scalar {}

impl PartialOrd for Scalar {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Scalar {
	/// A total order over all scalars: nulls, then booleans, then numbers in
	/// numeric order (integers before floats on numeric ties), then strings.
	/// This is the routing order of the chunked metadata index, so it must be
	/// stable across versions.
	fn cmp(&self, other: &Self) -> Ordering {
		use Scalar::*;
		match (self, other) {
			(Null, Null) => Ordering::Equal,
			(Bool(a), Bool(b)) => a.cmp(b),
			(Int(a), Int(b)) => a.cmp(b),
			(Float(a), Float(b)) => a.total_cmp(b),
			(Int(a), Float(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
			(Float(a), Int(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
			(Str(a), Str(b)) => a.cmp(b),
			_ => self.discriminant().cmp(&other.discriminant()),
		}
	}
}

impl fmt::Display for Scalar {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Scalar::Null => write!(f, "null"),
			Scalar::Bool(v) => write!(f, "{v}"),
			Scalar::Int(v) => write!(f, "{v}"),
			Scalar::Float(v) => write!(f, "{v}"),
			Scalar::Str(v) => write!(f, "{v}"),
		}
	}
}

impl From<bool> for Scalar {
	fn from(v: bool) -> Self {
		Self::Bool(v)
	}
}

impl From<i64> for Scalar {
	fn from(v: i64) -> Self {
		Self::Int(v)
	}
}

impl From<f64> for Scalar {
	fn from(v: f64) -> Self {
		Self::Float(v)
	}
}

impl From<&str> for Scalar {
	fn from(v: &str) -> Self {
		Self::Str(v.to_owned())
	}
}

impl From<String> for Scalar {
	fn from(v: String) -> Self {
		Self::Str(v)
	}
}

/// A metadata value: a scalar, an array of scalars, or a nested object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
	Scalar(Scalar),
	Array(Vec<Scalar>),
	Object(BTreeMap<String, Value>),
}

impl Value {
	/// Walk the leaves of this value, yielding the scalars to index together
	/// with their dot-joined sub-path relative to the owning field.
	pub fn leaves<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Scalar)>) {
		match self {
			Value::Scalar(s) => out.push((prefix.to_owned(), s)),
			Value::Array(items) => {
				for s in items {
					out.push((prefix.to_owned(), s));
				}
			}
			Value::Object(map) => {
				for (k, v) in map {
					let sub = if prefix.is_empty() {
						k.clone()
					} else {
						format!("{prefix}.{k}")
					};
					v.leaves(&sub, out);
				}
			}
		}
	}
}

impl From<Scalar> for Value {
	fn from(s: Scalar) -> Self {
		Self::Scalar(s)
	}
}

impl TryFrom<serde_json::Value> for Value {
	type Error = crate::err::Error;

	/// Convert a JSON value into the closed metadata sum. Arrays may only
	/// hold primitives; numbers outside the i64 range become floats.
	fn try_from(v: serde_json::Value) -> Result<Self, Self::Error> {
		fn scalar(v: serde_json::Value) -> Result<Scalar, crate::err::Error> {
			match v {
				serde_json::Value::Null => Ok(Scalar::Null),
				serde_json::Value::Bool(b) => Ok(Scalar::Bool(b)),
				serde_json::Value::Number(n) => {
					if let Some(i) = n.as_i64() {
						Ok(Scalar::Int(i))
					} else {
						Ok(Scalar::Float(n.as_f64().unwrap_or(f64::NAN)))
					}
				}
				serde_json::Value::String(s) => Ok(Scalar::Str(s)),
				other => Err(crate::err::Error::InvalidArgument {
					name: "metadata",
					message: format!("{other} is not a primitive value"),
				}),
			}
		}
		match v {
			serde_json::Value::Array(items) => {
				Ok(Value::Array(items.into_iter().map(scalar).collect::<Result<_, _>>()?))
			}
			serde_json::Value::Object(map) => {
				let mut out = BTreeMap::new();
				for (k, v) in map {
					out.insert(k, Value::try_from(v)?);
				}
				Ok(Value::Object(out))
			}
			other => Ok(Value::Scalar(scalar(other)?)),
		}
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Self::Scalar(Scalar::from(v))
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Self::Scalar(Scalar::Int(v))
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Self::Scalar(Scalar::Float(v))
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Self::Scalar(Scalar::Bool(v))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scalar_order_is_total_and_stable() {
		let mut values = vec![
			Scalar::Str("b".into()),
			Scalar::Float(1.5),
			Scalar::Null,
			Scalar::Int(2),
			Scalar::Bool(true),
			Scalar::Bool(false),
			Scalar::Int(-3),
			Scalar::Str("a".into()),
		];
		values.sort();
		assert_eq!(
			values,
			vec![
				Scalar::Null,
				Scalar::Bool(false),
				Scalar::Bool(true),
				Scalar::Int(-3),
				Scalar::Float(1.5),
				Scalar::Int(2),
				Scalar::Str("a".into()),
				Scalar::Str("b".into()),
			]
		);
	}

	#[test]
	fn mixed_numbers_never_compare_equal() {
		assert_ne!(Scalar::Int(1), Scalar::Float(1.0));
		assert!(Scalar::Int(1) < Scalar::Float(1.0));
		assert!(Scalar::Float(0.5) < Scalar::Int(1));
	}

	#[test]
	fn json_values_convert_into_the_closed_sum() {
		let json = serde_json::json!({
			"name": "Alice",
			"age": 34,
			"score": 0.5,
			"tags": ["x", "y"],
			"nested": { "ok": true }
		});
		let value = Value::try_from(json).unwrap();
		let Value::Object(map) = value else {
			panic!("expected an object");
		};
		assert_eq!(map.get("age"), Some(&Value::from(34i64)));
		assert_eq!(map.get("score"), Some(&Value::from(0.5)));
		assert_eq!(
			map.get("tags"),
			Some(&Value::Array(vec![Scalar::from("x"), Scalar::from("y")]))
		);
		// Arrays of arrays are not representable
		let bad = serde_json::json!([[1, 2]]);
		assert!(Value::try_from(bad).is_err());
	}

	#[test]
	fn leaves_flatten_nested_objects_and_arrays() {
		let value = Value::Object(map! {
			"name".to_owned() => Value::from("Alice"),
			"tags".to_owned() => Value::Array(vec![Scalar::from("x"), Scalar::from("y")]),
		});
		let mut out = Vec::new();
		value.leaves("profile", &mut out);
		let paths: Vec<&str> = out.iter().map(|(p, _)| p.as_str()).collect();
		assert_eq!(paths, vec!["profile.name", "profile.tags", "profile.tags"]);
	}
}
