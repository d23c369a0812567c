//! Byte-level codecs for everything rookdb persists.
//!
//! Two dialects cover the crate's disk artifacts:
//!
//! - the **record dialect** — little-endian fixed integers with
//!   `u32`-length-prefixed byte fields — used by the catalog's meta
//!   files and the table storage/replica blobs.  Reads go through the
//!   cursor-style [`Reader`]; writes append to a `Vec<u8>` via the
//!   `put_*` helpers and the [`Encode`] trait.
//! - the **varint dialect** — LEB128 `u64`s — required by the SSTable
//!   block layout, where entry headers, index offsets, and bloom
//!   geometry are all varints.  [`read_uvarint`] is offset-based rather
//!   than cursor-based because SSTable readers jump into blocks at
//!   index-supplied positions.
//!
//! Both dialects are deterministic — a value has exactly one encoding,
//! so checksums and byte comparisons are meaningful — and defensive:
//! every declared length is bounded ([`MAX_FIELD_BYTES`],
//! [`MAX_SEQ_ITEMS`]) before anything is allocated, and no code path in
//! this module panics on hostile input.

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Cap on a single length-prefixed byte or string field (256 MiB).
/// Anything larger in a length prefix is treated as corruption.
pub const MAX_FIELD_BYTES: usize = 256 << 20;

/// Cap on the element count of an encoded sequence (16M entries).
pub const MAX_SEQ_ITEMS: u32 = 1 << 24;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Ways a decode (or, rarely, an encode) can go wrong.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The input ran out mid-value.
    #[error("input ends {missing} byte(s) short")]
    Truncated {
        /// How many more bytes the current value needed.
        missing: usize,
    },

    /// A length or count field is beyond its cap.
    #[error("declared length {len} is over the cap of {limit}")]
    OverCap {
        /// The length that was declared.
        len: u64,
        /// The cap it violated.
        limit: u64,
    },

    /// A field holds a value its format cannot mean.
    #[error("field out of range: {0}")]
    OutOfRange(&'static str),

    /// A varint ran past ten bytes or spilled over 64 bits.
    #[error("varint does not fit in 64 bits")]
    MalformedVarint,

    /// A string field held bytes that are not UTF-8.
    #[error("string bytes are not UTF-8: {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// A value that can append its record-dialect encoding to a buffer.
///
/// Encoding only fails when a field is too large for its `u32` length
/// prefix, so most implementations are a straight sequence of `put_*`
/// calls.
pub trait Encode {
    /// Append the encoding of `self` to `out`.
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// A value that can be decoded from a [`Reader`] cursor.
pub trait Decode: Sized {
    /// Consume one value from the cursor.
    fn decode(r: &mut Reader<'_>) -> Result<Self, EncodingError>;
}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        put_str(self, out)
    }
}

impl Decode for String {
    fn decode(r: &mut Reader<'_>) -> Result<Self, EncodingError> {
        r.read_string()
    }
}

// ------------------------------------------------------------------------------------------------
// Writing
// ------------------------------------------------------------------------------------------------

/// Appends a length-prefixed byte field: `[u32 len][bytes]`.
pub fn put_bytes(field: &[u8], out: &mut Vec<u8>) -> Result<(), EncodingError> {
    let len = u32::try_from(field.len()).map_err(|_| EncodingError::OverCap {
        len: field.len() as u64,
        limit: u64::from(u32::MAX),
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(field);
    Ok(())
}

/// Appends a length-prefixed UTF-8 string field.
pub fn put_str(field: &str, out: &mut Vec<u8>) -> Result<(), EncodingError> {
    put_bytes(field.as_bytes(), out)
}

/// Appends a counted sequence: `[u32 count][item…]`.
pub fn encode_slice<T: Encode>(items: &[T], out: &mut Vec<u8>) -> Result<(), EncodingError> {
    let count = u32::try_from(items.len()).map_err(|_| EncodingError::OverCap {
        len: items.len() as u64,
        limit: u64::from(MAX_SEQ_ITEMS),
    })?;
    if count > MAX_SEQ_ITEMS {
        return Err(EncodingError::OverCap {
            len: u64::from(count),
            limit: u64::from(MAX_SEQ_ITEMS),
        });
    }
    out.extend_from_slice(&count.to_le_bytes());
    for item in items {
        item.encode(out)?;
    }
    Ok(())
}

/// Appends `value` as an unsigned LEB128 varint (1–10 bytes).
pub fn put_uvarint(value: u64, out: &mut Vec<u8>) {
    let mut v = value;
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

// ------------------------------------------------------------------------------------------------
// Reading
// ------------------------------------------------------------------------------------------------

/// Decoding cursor over a byte slice.
///
/// Tracks its own position so multi-field records read as a sequence of
/// method calls; [`Reader::position`] lets callers that interleave with
/// other formats know how far the cursor got.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Cursor over `buf`, starting at the first byte.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consumes the next `n` bytes.
    fn take(&mut self, n: usize) -> Result<&'a [u8], EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::Truncated {
                missing: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads one raw byte (version tags and the like).
    pub fn read_u8(&mut self) -> Result<u8, EncodingError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian `u32` length or count.
    fn read_len(&mut self) -> Result<u32, EncodingError> {
        let raw = self.take(4)?;
        // take() yielded exactly four bytes.
        let mut word = [0u8; 4];
        word.copy_from_slice(raw);
        Ok(u32::from_le_bytes(word))
    }

    /// Reads a `[u32 len][bytes]` field into an owned vector.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, EncodingError> {
        let len = self.read_len()? as usize;
        if len > MAX_FIELD_BYTES {
            return Err(EncodingError::OverCap {
                len: len as u64,
                limit: MAX_FIELD_BYTES as u64,
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a length-prefixed UTF-8 string field.
    pub fn read_string(&mut self) -> Result<String, EncodingError> {
        Ok(String::from_utf8(self.read_bytes()?)?)
    }

    /// Reads a LEB128 varint, advancing the cursor past it.
    pub fn read_uvarint(&mut self) -> Result<u64, EncodingError> {
        let (value, consumed) = read_uvarint(&self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(value)
    }
}

/// Decodes a counted sequence written by [`encode_slice`].
pub fn decode_seq<T: Decode>(r: &mut Reader<'_>) -> Result<Vec<T>, EncodingError> {
    let count = r.read_len()?;
    if count > MAX_SEQ_ITEMS {
        return Err(EncodingError::OverCap {
            len: u64::from(count),
            limit: u64::from(MAX_SEQ_ITEMS),
        });
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(T::decode(r)?);
    }
    Ok(items)
}

/// Decodes an unsigned LEB128 varint from the start of `buf`.
///
/// Returns `(value, bytes_consumed)`.  Offset-based on purpose: SSTable
/// readers scan blocks from index-supplied positions and keep their own
/// cursors.
pub fn read_uvarint(buf: &[u8]) -> Result<(u64, usize), EncodingError> {
    let mut value = 0u64;
    let mut consumed = 0usize;
    loop {
        let Some(&byte) = buf.get(consumed) else {
            // A continuation bit promised at least one more byte.
            return Err(EncodingError::Truncated { missing: 1 });
        };
        let shift = 7 * consumed as u32;
        consumed += 1;
        // The tenth byte may only carry the final bit of a u64.
        if shift == 63 && byte & 0x7E != 0 {
            return Err(EncodingError::MalformedVarint);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, consumed));
        }
        if consumed == 10 {
            // Ten continuation bytes cannot be a u64.
            return Err(EncodingError::MalformedVarint);
        }
    }
}
