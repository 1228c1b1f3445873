//! A bloom filter parameterised by expected element count and target
//! false-positive rate, hashed by double hashing over MurmurHash3-32 under
//! two fixed seeds. The serialised layout is fixed so that filters round-trip
//! through the storage adapter and across language implementations.

use crate::err::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const SEED_H1: u32 = 0x9747_b28c;
const SEED_H2: u32 = 0x5bd1_e995;

const LAYOUT_VERSION: u8 = 1;

/// Serialised header size: version, m, k, count, target fpr.
const HEADER_LEN: usize = 1 + 4 + 4 + 4 + 8;

/// A probabilistic set with no false negatives.
#[derive(Clone, Debug, PartialEq)]
pub struct Bloom {
	/// Bit array size.
	m: u32,
	/// Number of probe positions per key.
	k: u32,
	/// How many keys were added.
	count: u32,
	/// The configured false-positive rate.
	target_fpr: f64,
	bits: Vec<u8>,
}

impl Bloom {
	/// Create a filter sized for `expected` elements at the target
	/// false-positive rate: m = ⌈−n·ln(p)/(ln 2)²⌉ bits and
	/// k = ⌈(m/n)·ln 2⌉ probes clamped to [1, 10].
	pub fn new(expected: usize, target_fpr: f64) -> Self {
		let n = expected.max(1) as f64;
		let ln2 = std::f64::consts::LN_2;
		let m = ((-n * target_fpr.ln()) / (ln2 * ln2)).ceil().max(8.0) as u32;
		let k = (((m as f64 / n) * ln2).ceil() as u32).clamp(1, 10);
		Self {
			m,
			k,
			count: 0,
			target_fpr,
			bits: vec![0u8; (m as usize + 7) / 8],
		}
	}

	/// Add a key to the filter.
	pub fn insert(&mut self, key: &[u8]) {
		let (h1, h2) = Self::hashes(key);
		for i in 0..self.k {
			let pos = Self::position(h1, h2, i, self.m);
			self.bits[pos / 8] |= 1 << (pos % 8);
		}
		self.count += 1;
	}

	/// Whether the key may have been added. False negatives never occur.
	pub fn might_contain(&self, key: &[u8]) -> bool {
		let (h1, h2) = Self::hashes(key);
		for i in 0..self.k {
			let pos = Self::position(h1, h2, i, self.m);
			if self.bits[pos / 8] & (1 << (pos % 8)) == 0 {
				return false;
			}
		}
		true
	}

	fn hashes(key: &[u8]) -> (u32, u32) {
		let h1 = murmur3_32(key, SEED_H1);
		let mut h2 = murmur3_32(key, SEED_H2);
		// A zero stride would probe a single position
		if h2 == 0 {
			h2 = 1;
		}
		(h1, h2)
	}

	fn position(h1: u32, h2: u32, i: u32, m: u32) -> usize {
		(h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize
	}

	/// How many keys were added.
	pub fn count(&self) -> u32 {
		self.count
	}

	/// Serialise into the fixed layout:
	/// {version u8, m u32, k u32, count u32, target_fpr f64, bit bytes}.
	/// All integers big-endian.
	pub fn encode(&self) -> Bytes {
		let mut buf = BytesMut::with_capacity(HEADER_LEN + self.bits.len());
		buf.put_u8(LAYOUT_VERSION);
		buf.put_u32(self.m);
		buf.put_u32(self.k);
		buf.put_u32(self.count);
		buf.put_f64(self.target_fpr);
		buf.put_slice(&self.bits);
		buf.freeze()
	}

	/// Deserialise from the fixed layout, validating the declared sizes.
	pub fn decode(mut data: &[u8]) -> Result<Self, Error> {
		if data.len() < HEADER_LEN {
			return Err(Error::corrupted("bloom filter", "truncated header"));
		}
		let version = data.get_u8();
		if version != LAYOUT_VERSION {
			return Err(Error::corrupted("bloom filter", format!("unknown version {version}")));
		}
		let m = data.get_u32();
		let k = data.get_u32();
		let count = data.get_u32();
		let target_fpr = data.get_f64();
		let expected = (m as usize + 7) / 8;
		if data.remaining() != expected || !(1..=10).contains(&k) || m == 0 {
			return Err(Error::corrupted("bloom filter", "inconsistent layout"));
		}
		Ok(Self {
			m,
			k,
			count,
			target_fpr,
			bits: data.to_vec(),
		})
	}
}

/// MurmurHash3, x86 32-bit variant.
pub(crate) fn murmur3_32(data: &[u8], seed: u32) -> u32 {
	const C1: u32 = 0xcc9e_2d51;
	const C2: u32 = 0x1b87_3593;
	let mut h = seed;
	let mut chunks = data.chunks_exact(4);
	for chunk in &mut chunks {
		let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
		k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
		h ^= k;
		h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
	}
	let tail = chunks.remainder();
	if !tail.is_empty() {
		let mut k = 0u32;
		for (i, &b) in tail.iter().enumerate() {
			k ^= (b as u32) << (8 * i);
		}
		k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
		h ^= k;
	}
	h ^= data.len() as u32;
	h ^= h >> 16;
	h = h.wrapping_mul(0x85eb_ca6b);
	h ^= h >> 13;
	h = h.wrapping_mul(0xc2b2_ae35);
	h ^= h >> 16;
	h
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn murmur3_reference_vectors() {
		assert_eq!(murmur3_32(b"", 0), 0);
		assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
		assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
		assert_eq!(murmur3_32(b"hello, world", 0), 0x149b_bb7f);
		assert_eq!(murmur3_32(b"test", 0), 0xba6b_d213);
	}

	#[test]
	fn no_false_negatives() {
		let mut bloom = Bloom::new(1_000, 0.01);
		for i in 0..1_000u32 {
			bloom.insert(format!("key-{i}").as_bytes());
		}
		for i in 0..1_000u32 {
			assert!(bloom.might_contain(format!("key-{i}").as_bytes()));
		}
	}

	#[test]
	fn false_positive_rate_stays_near_target() {
		let mut bloom = Bloom::new(1_000, 0.01);
		for i in 0..1_000u32 {
			bloom.insert(format!("key-{i}").as_bytes());
		}
		let mut positives = 0;
		let samples = 10_000;
		for i in 0..samples {
			if bloom.might_contain(format!("absent-{i}").as_bytes()) {
				positives += 1;
			}
		}
		let fpr = positives as f64 / samples as f64;
		// Within 2x of the configured target
		assert!(fpr <= 0.02, "observed fpr {fpr}");
	}

	#[test]
	fn serialisation_round_trips() {
		let mut bloom = Bloom::new(100, 0.01);
		for key in [b"alpha".as_ref(), b"beta", b"gamma"] {
			bloom.insert(key);
		}
		let encoded = bloom.encode();
		let decoded = Bloom::decode(&encoded).unwrap();
		assert_eq!(decoded, bloom);
		assert!(decoded.might_contain(b"alpha"));
		assert_eq!(decoded.count(), 3);
	}

	#[test]
	fn truncated_or_versioned_data_is_rejected() {
		let mut bloom = Bloom::new(10, 0.01);
		bloom.insert(b"x");
		let encoded = bloom.encode();
		assert!(Bloom::decode(&encoded[..8]).is_err());
		let mut wrong = encoded.to_vec();
		wrong[0] = 9;
		assert!(Bloom::decode(&wrong).is_err());
		let mut short = encoded.to_vec();
		short.pop();
		assert!(Bloom::decode(&short).is_err());
	}
}
