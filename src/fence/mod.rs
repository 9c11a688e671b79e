//! Fence pointers: a sparse index from sampled keys to run-file offsets.
//!
//! During run construction every record is offered through [`FencePointers::add`];
//! one pointer is kept per `density_factor` records (the first record is
//! always kept). A lookup bisects the sampled keys to the group that could
//! hold the query and the caller scans at most `density_factor` records
//! from the group's byte offset.
//!
//! Persisted as a JSON envelope next to the run file:
//!
//! ```json
//! { "density_factor": 20, "pointers": { "<base64 key>": 1234 } }
//! ```

#[cfg(test)]
mod tests;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors produced while encoding or decoding a fence envelope.
#[derive(Debug, Error)]
pub enum FenceError {
    /// Envelope was not valid JSON.
    #[error("envelope parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A pointer key was not valid base64.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Serialize, Deserialize)]
struct FenceEnvelope {
    density_factor: usize,
    pointers: BTreeMap<String, u64>,
}

/// Ordered `(key, offset)` samples over one immutable run.
#[derive(Debug, Clone)]
pub struct FencePointers {
    /// Scan budget per group; also the sampling period.
    density_factor: usize,
    /// Records offered so far (drives sampling; not persisted).
    records_seen: usize,
    /// Samples sorted by key.
    pointers: Vec<(Vec<u8>, u64)>,
}

/// Equality is over the persisted state: sampling period and pointer map.
/// The transient record counter is construction-only bookkeeping.
impl PartialEq for FencePointers {
    fn eq(&self, other: &Self) -> bool {
        self.density_factor == other.density_factor && self.pointers == other.pointers
    }
}

impl Eq for FencePointers {}

impl FencePointers {
    /// Empty pointer set with the given sampling period.
    ///
    /// `density_factor` must be non-zero; engine configs validate it.
    pub fn new(density_factor: usize) -> Self {
        Self {
            density_factor,
            records_seen: 0,
            pointers: Vec::new(),
        }
    }

    /// Scan budget per sampled group.
    pub fn density_factor(&self) -> usize {
        self.density_factor
    }

    /// Number of sampled pointers.
    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    /// True when no record was ever sampled.
    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    /// Offers one record at `offset`. Every `density_factor`-th record
    /// (starting with the first) is kept as a pointer.
    ///
    /// Run construction feeds keys in ascending order; out-of-order keys
    /// are inserted at their sorted position.
    pub fn add(&mut self, key: &[u8], offset: u64) {
        if self.records_seen % self.density_factor == 0 {
            match self.pointers.last() {
                Some((last, _)) if last.as_slice() >= key => {
                    let at = self.pointers.partition_point(|(k, _)| k.as_slice() < key);
                    self.pointers.insert(at, (key.to_vec(), offset));
                }
                _ => self.pointers.push((key.to_vec(), offset)),
            }
        }
        self.records_seen += 1;
    }

    /// Index of the first sampled key strictly greater than `key`.
    pub fn bisect(&self, key: &[u8]) -> usize {
        self.pointers.partition_point(|(k, _)| k.as_slice() <= key)
    }

    /// The `idx`-th sampled `(key, offset)` pair in key order.
    pub fn peek(&self, idx: usize) -> Option<(&[u8], u64)> {
        self.pointers.get(idx).map(|(k, o)| (k.as_slice(), *o))
    }

    /// Byte offset of the group that could contain `key`: the sample at
    /// `bisect(key) - 1`, clamped to the first group.
    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        if self.pointers.is_empty() {
            return None;
        }
        let idx = self.bisect(key).saturating_sub(1);
        self.peek(idx).map(|(_, offset)| offset)
    }

    /// Encodes the pointers into their JSON envelope.
    pub fn serialize(&self) -> Result<String, FenceError> {
        let envelope = FenceEnvelope {
            density_factor: self.density_factor,
            pointers: self
                .pointers
                .iter()
                .map(|(k, o)| (BASE64.encode(k), *o))
                .collect(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decodes pointers from their JSON envelope.
    pub fn deserialize(data: &str) -> Result<Self, FenceError> {
        let envelope: FenceEnvelope = serde_json::from_str(data)?;
        let mut pointers = Vec::with_capacity(envelope.pointers.len());
        for (key, offset) in envelope.pointers {
            pointers.push((BASE64.decode(key.as_bytes())?, offset));
        }
        pointers.sort();
        Ok(Self {
            density_factor: envelope.density_factor,
            records_seen: 0,
            pointers,
        })
    }
}
