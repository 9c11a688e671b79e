//! Binary record codec shared by every engine.
//!
//! A record is a key-value pair serialized as:
//!
//! ```text
//! [key_len][key][value_len][value]
//! ```
//!
//! Length prefixes are little-endian and their width is derived from the
//! configured maximum key/value length: the smallest number of bytes able
//! to represent it (1 byte for the default limit of 255).
//!
//! An empty value is a tombstone. Keys are never empty in a valid stream.
//!
//! Durability is best-effort per write: a crash can leave a half-written
//! record at the end of a file. [`RecordCodec::read_record`] treats such a
//! torn trailing record the same as end-of-file, so recovery simply drops
//! it.

#[cfg(test)]
mod tests;

use std::io::{self, Read, Write};

/// Number of little-endian bytes needed to encode lengths up to `max_len`.
///
/// This is the smallest `w` with `256^w > max_len`; both default limits
/// (255) fit in a single byte.
pub fn len_width(max_len: usize) -> usize {
    let mut width = 1usize;
    while (1u128 << (8 * width)) <= max_len as u128 {
        width += 1;
    }
    width
}

/// Reads and writes length-prefixed key-value records.
///
/// The codec is a pair of length-prefix widths; it carries no buffers and
/// is freely copyable.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    key_width: usize,
    val_width: usize,
}

impl RecordCodec {
    /// Builds a codec for the given key/value length limits.
    pub fn new(max_key_len: usize, max_value_len: usize) -> Self {
        Self {
            key_width: len_width(max_key_len),
            val_width: len_width(max_value_len),
        }
    }

    /// Encoded size of one record, in bytes.
    pub fn encoded_len(&self, key: &[u8], value: &[u8]) -> u64 {
        (self.key_width + key.len() + self.val_width + value.len()) as u64
    }

    /// Appends one record to `w`. Returns the number of bytes written.
    ///
    /// The caller is responsible for key/value length validation; lengths
    /// beyond the widths configured here would be silently truncated.
    pub fn write_record(&self, w: &mut impl Write, key: &[u8], value: &[u8]) -> io::Result<u64> {
        w.write_all(&(key.len() as u64).to_le_bytes()[..self.key_width])?;
        w.write_all(key)?;
        w.write_all(&(value.len() as u64).to_le_bytes()[..self.val_width])?;
        w.write_all(value)?;
        Ok(self.encoded_len(key, value))
    }

    /// Reads one record from `r`.
    ///
    /// Returns `Ok(None)` at end-of-file. A torn trailing record (header
    /// or payload cut short) is also reported as `Ok(None)`; only genuine
    /// I/O failures surface as errors.
    pub fn read_record(&self, r: &mut impl Read) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut key_len_buf = vec![0u8; self.key_width];
        if !read_full(r, &mut key_len_buf)? {
            return Ok(None);
        }
        let key_len = decode_len(&key_len_buf);
        if key_len == 0 {
            // Keys are never empty; a zero header is trailing garbage.
            return Ok(None);
        }

        let mut key = vec![0u8; key_len];
        if !read_full(r, &mut key)? {
            return Ok(None);
        }

        let mut val_len_buf = vec![0u8; self.val_width];
        if !read_full(r, &mut val_len_buf)? {
            return Ok(None);
        }
        let val_len = decode_len(&val_len_buf);

        let mut value = vec![0u8; val_len];
        if !read_full(r, &mut value)? {
            return Ok(None);
        }

        Ok(Some((key, value)))
    }
}

/// Little-endian integer from a short prefix buffer.
fn decode_len(buf: &[u8]) -> usize {
    let mut bytes = [0u8; 8];
    bytes[..buf.len()].copy_from_slice(buf);
    u64::from_le_bytes(bytes) as usize
}

/// Fills `buf` from `r`. Returns `Ok(false)` if the reader ran out of
/// bytes first (clean EOF or torn record).
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
