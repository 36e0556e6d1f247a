use std::fmt;
use std::ops::Range;

/// An inclusive byte range within a remote object
///
/// Both boundaries are part of the range which matches the
/// semantics of an HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InclusiveRange(pub u64, pub u64);

impl InclusiveRange {
    pub fn start(&self) -> u64 {
        self.0
    }

    pub fn end_incl(&self) -> u64 {
        self.1
    }

    pub fn len(&self) -> u64 {
        self.1 - self.0 + 1
    }

    pub fn is_empty(&self) -> bool {
        self.1 < self.0
    }

    /// Creates the range from an offset and a length
    ///
    /// # Panics
    ///
    /// If `len` is 0 since an inclusive range can not be empty.
    pub fn from_offset_and_len(offset: u64, len: u64) -> Self {
        if len == 0 {
            panic!("an InclusiveRange must not be empty. This is a bug somewhere else.");
        }
        Self(offset, offset + len - 1)
    }

    /// The value of an HTTP `Range` header for this range
    pub fn http_bytes_range_value(&self) -> String {
        format!("bytes={}-{}", self.0, self.1)
    }

    /// Turns this into an exclusive `Range` for slicing
    pub fn to_std_range_excl(self) -> Range<u64> {
        self.0..self.1 + 1
    }
}

impl fmt::Display for InclusiveRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}..{}]", self.0, self.1)
    }
}
