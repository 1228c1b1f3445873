//! Value-sampling field-type inference. The index observes samples of every
//! newly seen metadata field and classifies the field into a semantic type
//! by applying predicates in decreasing specificity. Detection is strictly
//! value-based; field names are never consulted.

use crate::cnf;
use crate::ctx::Context;
use crate::err::Error;
use crate::obs::{paths, Store};
use crate::val::{Scalar, Value};
use chrono::{DateTime, NaiveDate};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Plausible bounds for epoch-based timestamps, 1990-01-01 to 2100-01-01.
const UNIX_SECONDS_RANGE: std::ops::Range<i64> = 631_152_000..4_102_444_800;
const UNIX_MILLIS_RANGE: std::ops::Range<i64> = 631_152_000_000..4_102_444_800_000;

/// How confident and well-sampled a record must be, and how fresh, before it
/// is served without re-classification.
const AUTHORITATIVE_CONFIDENCE: f64 = 0.9;
const AUTHORITATIVE_SAMPLES: u32 = 50;
const AUTHORITATIVE_AGE_MS: i64 = 24 * 60 * 60 * 1_000;

/// The semantic type of an indexed metadata field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FieldType {
	Boolean,
	Uuid,
	IsoDateTime,
	IsoDate,
	UnixMillis,
	UnixSeconds,
	Integer,
	Float,
	Array,
	Object,
	String,
}

impl FieldType {
	/// Classification order, most specific first.
	const LADDER: [FieldType; 11] = [
		Self::Boolean,
		Self::Uuid,
		Self::IsoDateTime,
		Self::IsoDate,
		Self::UnixMillis,
		Self::UnixSeconds,
		Self::Integer,
		Self::Float,
		Self::Array,
		Self::Object,
		Self::String,
	];

	pub fn is_temporal(&self) -> bool {
		matches!(self, Self::IsoDateTime | Self::IsoDate | Self::UnixMillis | Self::UnixSeconds)
	}

	fn matches(&self, value: &Value) -> bool {
		match (self, value) {
			(Self::Array, Value::Array(_)) => true,
			(Self::Object, Value::Object(_)) => true,
			(_, Value::Scalar(s)) => self.matches_scalar(s),
			_ => false,
		}
	}

	fn matches_scalar(&self, s: &Scalar) -> bool {
		match self {
			Self::Boolean => matches!(s, Scalar::Bool(_)),
			Self::Uuid => matches!(s, Scalar::Str(v) if Uuid::parse_str(v).is_ok()),
			Self::IsoDateTime => {
				matches!(s, Scalar::Str(v) if DateTime::parse_from_rfc3339(v).is_ok())
			}
			Self::IsoDate => {
				matches!(s, Scalar::Str(v) if NaiveDate::parse_from_str(v, "%Y-%m-%d").is_ok())
			}
			Self::UnixMillis => matches!(s, Scalar::Int(v) if UNIX_MILLIS_RANGE.contains(v)),
			Self::UnixSeconds => matches!(s, Scalar::Int(v) if UNIX_SECONDS_RANGE.contains(v)),
			Self::Integer => matches!(s, Scalar::Int(_)),
			Self::Float => matches!(s, Scalar::Float(_) | Scalar::Int(_)),
			Self::String => matches!(s, Scalar::Str(_)),
			Self::Array | Self::Object => false,
		}
	}
}

/// The cached classification of one field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldTypeRecord {
	pub field: String,
	pub inferred: FieldType,
	pub confidence: f64,
	pub sample_size: u32,
	/// Unix milliseconds.
	pub last_updated: i64,
	pub format: Option<String>,
	/// Bucket size for temporal fields, in the field's own unit.
	pub bucket_size: Option<i64>,
	pub min_value: Option<f64>,
	pub max_value: Option<f64>,
}

impl FieldTypeRecord {
	/// Whether this record can be served without re-classification.
	pub fn authoritative(&self, now_ms: i64) -> bool {
		self.confidence >= AUTHORITATIVE_CONFIDENCE
			&& self.sample_size >= AUTHORITATIVE_SAMPLES
			&& now_ms - self.last_updated < AUTHORITATIVE_AGE_MS
	}
}

/// The classifier: keeps bounded samples per field and the inferred records.
pub struct FieldTypes {
	samples: HashMap<String, Vec<Value>>,
	records: HashMap<String, FieldTypeRecord>,
	dirty: HashSet<String>,
}

impl FieldTypes {
	pub fn new() -> Self {
		Self {
			samples: HashMap::default(),
			records: HashMap::default(),
			dirty: HashSet::default(),
		}
	}

	pub async fn open(store: &Store, ctx: &Context) -> Result<Self, Error> {
		let mut types = Self::new();
		for path in store.list_prefix(ctx, "field-types").await? {
			if let Some(record) = store.get_record::<FieldTypeRecord>(ctx, &path).await? {
				types.records.insert(record.field.clone(), record);
			}
		}
		Ok(types)
	}

	pub async fn save(&mut self, store: &Store, ctx: &Context) -> Result<(), Error> {
		for field in std::mem::take(&mut self.dirty) {
			if let Some(record) = self.records.get(&field) {
				store.save_record(ctx, &paths::field_type(&field), record).await?;
			}
		}
		Ok(())
	}

	pub fn get(&self, field: &str) -> Option<&FieldTypeRecord> {
		self.records.get(field)
	}

	/// Feed one observed value of a field into the sampler, re-classifying
	/// unless the cached record is authoritative.
	pub fn observe(&mut self, field: &str, value: &Value, now_ms: i64) {
		if let Some(record) = self.records.get(field) {
			if record.authoritative(now_ms) {
				return;
			}
		}
		let samples = self.samples.entry(field.to_owned()).or_default();
		if samples.len() < cnf::FIELD_SAMPLE_SIZE {
			samples.push(value.clone());
		}
		let record = Self::classify(field, samples, now_ms);
		self.records.insert(field.to_owned(), record);
		self.dirty.insert(field.to_owned());
	}

	/// Classify a sample set: the first type in the specificity ladder
	/// matching at least 90% of the samples wins; otherwise the best match
	/// wins with its observed fraction as the confidence.
	fn classify(field: &str, samples: &[Value], now_ms: i64) -> FieldTypeRecord {
		let total = samples.len().max(1) as f64;
		let mut best = (FieldType::String, 0.0);
		let mut chosen = None;
		for t in FieldType::LADDER {
			let matching = samples.iter().filter(|v| t.matches(v)).count() as f64;
			let fraction = matching / total;
			if fraction >= AUTHORITATIVE_CONFIDENCE {
				chosen = Some((t, fraction));
				break;
			}
			if fraction > best.1 {
				best = (t, fraction);
			}
		}
		let (inferred, confidence) = chosen.unwrap_or(best);
		let mut record = FieldTypeRecord {
			field: field.to_owned(),
			inferred,
			confidence,
			sample_size: samples.len() as u32,
			last_updated: now_ms,
			format: None,
			bucket_size: None,
			min_value: None,
			max_value: None,
		};
		match inferred {
			FieldType::IsoDate => record.format = Some("%Y-%m-%d".to_owned()),
			FieldType::IsoDateTime => {
				record.format = Some("rfc3339".to_owned());
				// Minute-aligned datetimes bucket to 60s
				let aligned = samples.iter().all(|v| match v {
					Value::Scalar(Scalar::Str(s)) => DateTime::parse_from_rfc3339(s)
						.map(|d| d.timestamp() % 60 == 0)
						.unwrap_or(false),
					_ => false,
				});
				record.bucket_size = Some(if aligned {
					60
				} else {
					1
				});
			}
			FieldType::UnixSeconds | FieldType::UnixMillis => {
				let unit = if inferred == FieldType::UnixMillis {
					1_000
				} else {
					1
				};
				let ints: Vec<i64> = samples
					.iter()
					.filter_map(|v| match v {
						Value::Scalar(Scalar::Int(i)) => Some(*i),
						_ => None,
					})
					.collect();
				record.min_value = ints.iter().min().map(|&v| v as f64);
				record.max_value = ints.iter().max().map(|&v| v as f64);
				let aligned = !ints.is_empty() && ints.iter().all(|v| v % (60 * unit) == 0);
				record.bucket_size = Some(if aligned {
					60 * unit
				} else {
					unit
				});
			}
			_ => {}
		}
		record
	}
}

impl Default for FieldTypes {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn observe_all(types: &mut FieldTypes, field: &str, values: Vec<Value>) {
		for v in values {
			types.observe(field, &v, 0);
		}
	}

	#[test]
	fn classifies_by_value_not_by_name() {
		let mut types = FieldTypes::new();
		// A field named "timestamp" holding booleans is a boolean field
		observe_all(&mut types, "timestamp", vec![Value::from(true), Value::from(false)]);
		assert_eq!(types.get("timestamp").unwrap().inferred, FieldType::Boolean);
	}

	#[test]
	fn recognises_uuids_dates_and_epochs() {
		let mut types = FieldTypes::new();
		observe_all(
			&mut types,
			"ref",
			vec![Value::from("b4cf4cbb-f24e-49b9-a1b4-d6ced3e63a45")],
		);
		assert_eq!(types.get("ref").unwrap().inferred, FieldType::Uuid);

		observe_all(&mut types, "day", vec![Value::from("2024-03-01"), Value::from("2024-03-02")]);
		assert_eq!(types.get("day").unwrap().inferred, FieldType::IsoDate);

		observe_all(&mut types, "at", vec![Value::from("2024-03-01T10:30:00Z")]);
		let at = types.get("at").unwrap();
		assert_eq!(at.inferred, FieldType::IsoDateTime);
		assert_eq!(at.bucket_size, Some(60));

		observe_all(&mut types, "seen", vec![Value::from(1_700_000_061i64)]);
		let seen = types.get("seen").unwrap();
		assert_eq!(seen.inferred, FieldType::UnixSeconds);
		assert_eq!(seen.bucket_size, Some(1));

		observe_all(&mut types, "seen_ms", vec![Value::from(1_700_000_061_000i64)]);
		assert_eq!(types.get("seen_ms").unwrap().inferred, FieldType::UnixMillis);
	}

	#[test]
	fn plain_numbers_and_strings_fall_through() {
		let mut types = FieldTypes::new();
		observe_all(&mut types, "count", vec![Value::from(3i64), Value::from(-7i64)]);
		assert_eq!(types.get("count").unwrap().inferred, FieldType::Integer);

		observe_all(&mut types, "score", vec![Value::from(0.5), Value::from(0.9)]);
		assert_eq!(types.get("score").unwrap().inferred, FieldType::Float);

		observe_all(&mut types, "name", vec![Value::from("Alice"), Value::from("Bob")]);
		assert_eq!(types.get("name").unwrap().inferred, FieldType::String);
	}

	#[test]
	fn authoritative_records_stop_sampling() {
		let mut types = FieldTypes::new();
		for _ in 0..60 {
			types.observe("flag", &Value::from(true), 0);
		}
		let record = types.get("flag").unwrap().clone();
		assert!(record.authoritative(1_000));
		assert!(!record.authoritative(AUTHORITATIVE_AGE_MS + 1));
		// Served from cache: a contradictory observation does not flip it
		types.observe("flag", &Value::from("no"), 1_000);
		assert_eq!(types.get("flag").unwrap().inferred, FieldType::Boolean);
	}

	#[tokio::test]
	async fn records_round_trip_through_storage() {
		let store = Store::open("memory:").unwrap();
		let ctx = Context::background();
		{
			let mut types = FieldTypes::new();
			observe_all(&mut types, "day", vec![Value::from("2024-01-31")]);
			types.save(&store, &ctx).await.unwrap();
		}
		let types = FieldTypes::open(&store, &ctx).await.unwrap();
		assert_eq!(types.get("day").unwrap().inferred, FieldType::IsoDate);
	}
}
