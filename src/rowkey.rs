//! Zero-copy view over row-key bytes.
//!
//! A [`RowKeySlice`] borrows a byte range owned by the host-provided WAL
//! batch and carries a precomputed content hash, which makes it cheap to use
//! as a map key when grouping cells by row.  The borrow ties the slice to the
//! batch-processing scope; callers that need the key beyond that scope must
//! materialize it with [`RowKeySlice::to_vec`].

use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use thiserror::Error;

/// Maximum number of bytes rendered by the diagnostic preview.
const PREVIEW_MAX: usize = 16;

static EMPTY: &[u8] = &[];

/// Requested byte range does not fit in the backing array.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("row key range out of bounds: offset={offset}, len={len}, backing array len={backing}")]
pub struct RowKeyBoundsError {
    pub offset: usize,
    pub len: usize,
    pub backing: usize,
}

/// Borrowed row-key byte range with a cached content hash.
///
/// Equality and hashing follow the content, not the backing array: two
/// slices over different arrays compare equal when their bytes match.
#[derive(Clone, Copy)]
pub struct RowKeySlice<'a> {
    bytes: &'a [u8],
    hash: u32,
}

impl<'a> RowKeySlice<'a> {
    /// View over `array[offset..offset + len]`.
    ///
    /// Fails when the range does not fit in `array` (overflow-checked).
    pub fn of(array: &'a [u8], offset: usize, len: usize) -> Result<Self, RowKeyBoundsError> {
        let end = offset.checked_add(len).ok_or(RowKeyBoundsError {
            offset,
            len,
            backing: array.len(),
        })?;
        if end > array.len() {
            return Err(RowKeyBoundsError {
                offset,
                len,
                backing: array.len(),
            });
        }
        Ok(Self::whole(&array[offset..end]))
    }

    /// View over the whole array.
    pub fn whole(array: &'a [u8]) -> Self {
        Self {
            bytes: array,
            hash: content_hash(array),
        }
    }

    /// The zero-length slice.
    pub fn empty() -> RowKeySlice<'static> {
        RowKeySlice::whole(EMPTY)
    }

    /// Borrowed bytes of the slice.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Cached content hash; the same value feeds the `Hash` impl.
    pub fn content_hash(&self) -> u32 {
        self.hash
    }

    /// Freshly allocated copy of the key bytes.
    ///
    /// The only way to keep a row key alive past the WAL batch that owns the
    /// backing buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

/// 31-based polynomial hash over the slice content.
///
/// Stable across processes; used wherever a row-key hash is needed so that
/// the cached value and ad-hoc computations agree.
fn content_hash(bytes: &[u8]) -> u32 {
    let mut h: u32 = 1;
    for &b in bytes {
        h = h.wrapping_mul(31).wrapping_add(u32::from(b));
    }
    h
}

impl PartialEq for RowKeySlice<'_> {
    fn eq(&self, other: &Self) -> bool {
        // Cheap rejections first: cached hash, then length, then bytes.
        self.hash == other.hash
            && self.bytes.len() == other.bytes.len()
            && self.bytes == other.bytes
    }
}

impl Eq for RowKeySlice<'_> {}

impl Hash for RowKeySlice<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

impl Display for RowKeySlice<'_> {
    /// Short diagnostic form: length, hash and a hex preview of the first
    /// bytes, truncated with `..`.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RowKeySlice{{len={}, hash={:#x}, preview=[", self.len(), self.hash)?;
        let n = self.bytes.len().min(PREVIEW_MAX);
        for (i, b) in self.bytes[..n].iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
        }
        if self.bytes.len() > n {
            write!(f, " ..")?;
        }
        write!(f, "]}}")
    }
}

impl Debug for RowKeySlice<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
