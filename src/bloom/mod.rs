//! Bloom filter guarding runs against pointless disk reads.
//!
//! ## Design Overview
//!
//! The filter is sized from an expected item count `n` and a target false
//! positive rate `p` (default 1%):
//!
//! - bit count `m = ceil(-n * ln(p) / ln(2)^2)`
//! - hash count `k = floor((m / n) * ln(2))`
//!
//! `k` is floored to keep the number of hash evaluations low; both `m` and
//! `k` are clamped to at least 1 so that a run emptied down to zero records
//! (every key tombstoned away during a merge) still has a well-formed
//! filter. Membership hashing folds `k` seeded xxh32 digests modulo `m`.
//!
//! ## Envelope
//!
//! Filters are persisted as a JSON envelope next to their run file:
//!
//! ```json
//! { "bytes": "<base64 packed bits>", "len": 42, "endian": "big",
//!   "n": 5, "p": 0.01 }
//! ```
//!
//! Bits are packed most-significant-bit first ("big" endian); the little
//! endian layout is accepted on read and normalised. `n` and `p` ride along
//! so a deserialized filter recomputes the same `k` and keeps its item
//! estimate for merge-time sizing.
//!
//! ## Guarantees
//!
//! - No false negatives, ever.
//! - False positives at roughly the configured rate.
//! - Serialize/deserialize reconstructs a bit-identical filter.


use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh32::xxh32;

/// Default false positive rate.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Errors produced while encoding or decoding a filter envelope.
#[derive(Debug, Error)]
pub enum BloomError {
    /// Envelope was not valid JSON.
    #[error("envelope parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The `bytes` field was not valid base64.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The `endian` tag was neither `"big"` nor `"little"`.
    #[error("unsupported bit endianness: {0:?}")]
    UnsupportedEndian(String),

    /// The declared bit length does not fit the decoded bytes.
    #[error("bit length {bits} exceeds decoded payload of {bytes} bytes")]
    LengthMismatch { bits: u64, bytes: usize },
}

#[derive(Serialize, Deserialize)]
struct BloomEnvelope {
    bytes: String,
    len: u64,
    endian: String,
    n: u64,
    p: f64,
}

/// A serializable bloom filter with seeded 32-bit hashing.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    /// Packed bit array, most-significant-bit first.
    bits: Vec<u8>,
    /// Number of usable bits in `bits`.
    num_bits: u64,
    /// Number of seeded hash functions folded per item.
    num_hashes: u32,
    /// Item count the filter was sized for.
    est_num_items: u64,
    /// Target false positive rate the filter was sized for.
    false_positive_rate: f64,
}

impl BloomFilter {
    /// Builds a filter sized for `num_items` at the default 1% rate.
    pub fn new(num_items: u64) -> Self {
        Self::with_rate(num_items, DEFAULT_FALSE_POSITIVE_RATE)
    }

    /// Builds a filter sized for `num_items` at the given rate.
    pub fn with_rate(num_items: u64, false_positive_rate: f64) -> Self {
        let (num_bits, num_hashes) = dimensions(num_items, false_positive_rate);
        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
            est_num_items: num_items,
            false_positive_rate,
        }
    }

    /// Item count this filter was sized for.
    ///
    /// Merges sum these estimates to size the output run's filter.
    pub fn est_num_items(&self) -> u64 {
        self.est_num_items
    }

    /// Inserts an item.
    pub fn add(&mut self, item: &[u8]) {
        for seed in 0..self.num_hashes {
            let bit = u64::from(xxh32(item, seed)) % self.num_bits;
            self.bits[(bit / 8) as usize] |= 0x80 >> (bit % 8);
        }
    }

    /// Membership test: `true` for every inserted item, and spuriously
    /// `true` at roughly the configured false positive rate.
    pub fn contains(&self, item: &[u8]) -> bool {
        (0..self.num_hashes).all(|seed| {
            let bit = u64::from(xxh32(item, seed)) % self.num_bits;
            self.bits[(bit / 8) as usize] & (0x80 >> (bit % 8)) != 0
        })
    }

    /// Encodes the filter into its JSON envelope.
    pub fn serialize(&self) -> Result<String, BloomError> {
        let envelope = BloomEnvelope {
            bytes: BASE64.encode(&self.bits),
            len: self.num_bits,
            endian: "big".to_string(),
            n: self.est_num_items,
            p: self.false_positive_rate,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decodes a filter from its JSON envelope.
    pub fn deserialize(data: &str) -> Result<Self, BloomError> {
        let envelope: BloomEnvelope = serde_json::from_str(data)?;
        let mut bits = BASE64.decode(envelope.bytes.as_bytes())?;

        if envelope.len > bits.len() as u64 * 8 {
            return Err(BloomError::LengthMismatch {
                bits: envelope.len,
                bytes: bits.len(),
            });
        }
        match envelope.endian.as_str() {
            "big" => {}
            "little" => {
                for byte in &mut bits {
                    *byte = byte.reverse_bits();
                }
            }
            other => return Err(BloomError::UnsupportedEndian(other.to_string())),
        }
        // The envelope's bit length is authoritative; `n` and `p` only
        // determine the hash count.
        let num_bits = envelope.len.max(1);
        bits.resize(num_bits.div_ceil(8) as usize, 0);

        let (_, num_hashes) = dimensions(envelope.n, envelope.p);
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
            est_num_items: envelope.n,
            false_positive_rate: envelope.p,
        })
    }
}

/// Bit and hash counts for `(n, p)`, both clamped to at least 1.
fn dimensions(num_items: u64, false_positive_rate: f64) -> (u64, u32) {
    if num_items == 0 {
        return (1, 1);
    }
    let n = num_items as f64;
    let ln2 = std::f64::consts::LN_2;
    let num_bits = ((-(n * false_positive_rate.ln())) / (ln2 * ln2)).ceil() as u64;
    let num_bits = num_bits.max(1);
    let num_hashes = ((num_bits as f64 / n) * ln2).floor() as u32;
    (num_bits, num_hashes.max(1))
}
