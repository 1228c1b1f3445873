use crate::err::Error;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An embedding vector.
///
/// Vectors can be very large, so they are shared rather than cloned; see
/// [`SharedVector`]. Equality and hashing are bitwise so that a vector can
/// key a map without losing NaN payloads or negative zeros.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vector(Vec<f32>);

/// Multiple ownership of a vector across index, cache and in-flight queries.
pub type SharedVector = Arc<Vector>;

impl Vector {
	pub fn new(components: Vec<f32>) -> Self {
		Self(components)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_slice(&self) -> &[f32] {
		&self.0
	}

	/// Fail unless this vector has the expected dimensionality.
	pub fn check_dimension(&self, expected: usize) -> Result<(), Error> {
		if self.0.len() == expected {
			Ok(())
		} else {
			Err(Error::VectorDimension {
				expected,
				found: self.0.len(),
			})
		}
	}

	fn magnitude(&self) -> f64 {
		self.0
			.iter()
			.map(|&x| {
				let x = x as f64;
				x * x
			})
			.sum::<f64>()
			.sqrt()
	}

	/// An ℓ2-normalised copy of this vector. A zero vector normalises to
	/// itself.
	pub fn normalized(&self) -> Self {
		let mag = self.magnitude();
		if mag == 0.0 || mag.is_nan() {
			return self.clone();
		}
		Self(self.0.iter().map(|&x| (x as f64 / mag) as f32).collect())
	}

	fn dot(&self, other: &Self) -> f64 {
		self.0.iter().zip(other.0.iter()).map(|(&x, &y)| x as f64 * y as f64).sum()
	}

	/// Cosine distance in [0, 2], assuming both vectors are normalised.
	pub fn cosine_distance(&self, other: &Self) -> f64 {
		let s = self.dot(other).clamp(-1.0, 1.0);
		1.0 - s
	}

	pub fn euclidean_distance(&self, other: &Self) -> f64 {
		self.0
			.iter()
			.zip(other.0.iter())
			.map(|(&a, &b)| {
				let d = a as f64 - b as f64;
				d * d
			})
			.sum::<f64>()
			.sqrt()
	}
}

impl PartialEq for Vector {
	fn eq(&self, other: &Self) -> bool {
		self.0.len() == other.0.len()
			&& self.0.iter().zip(other.0.iter()).all(|(a, b)| a.to_bits() == b.to_bits())
	}
}

impl Eq for Vector {}

impl Hash for Vector {
	fn hash<H: Hasher>(&self, state: &mut H) {
		for v in &self.0 {
			state.write_u32(v.to_bits());
		}
	}
}

impl From<Vec<f32>> for Vector {
	fn from(v: Vec<f32>) -> Self {
		Self(v)
	}
}

/// The distance metric of a vector index.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Distance {
	/// Cosine distance over ℓ2-normalised vectors. The default.
	#[default]
	Cosine,
	Euclidean,
}

impl Distance {
	pub fn calculate(&self, a: &Vector, b: &Vector) -> f64 {
		match self {
			Self::Cosine => a.cosine_distance(b),
			Self::Euclidean => a.euclidean_distance(b),
		}
	}

	/// Whether vectors should be ℓ2-normalised on ingestion for this metric.
	pub fn normalizes(&self) -> bool {
		matches!(self, Self::Cosine)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalisation_yields_unit_length() {
		let v = Vector::new(vec![3.0, 4.0]).normalized();
		assert!((v.magnitude() - 1.0).abs() < 1e-6);
	}

	#[test]
	fn cosine_distance_of_identical_vectors_is_zero() {
		let v = Vector::new(vec![0.1; 384]).normalized();
		assert!(v.cosine_distance(&v) < 1e-9);
	}

	#[test]
	fn euclidean_distance_matches_geometry() {
		let a = Vector::new(vec![0.0, 0.0]);
		let b = Vector::new(vec![3.0, 4.0]);
		assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-12);
	}

	#[test]
	fn dimension_check_rejects_mismatches() {
		let v = Vector::new(vec![1.0, 2.0, 3.0]);
		assert!(v.check_dimension(3).is_ok());
		assert!(v.check_dimension(384).is_err());
	}
}
