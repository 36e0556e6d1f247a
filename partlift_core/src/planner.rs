//! Splitting a transfer into parts
//!
//! A [TransferPlan] is pure arithmetic over the total size and the
//! part size bounds. It is computed once up front so that workers
//! only ever see fully determined [PartDescriptor]s.

use std::fmt;

use crate::{errors::TransferError, object_client::PartSizeHints, InclusiveRange};

/// Remote stores commonly refuse objects with more parts than this
pub const MAX_PART_COUNT: u64 = 10_000;

/// A single part of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1 based index of this part
    pub part_number: u32,
    /// Offset of the first byte of this part within the object
    pub offset: u64,
    /// Length of this part in bytes
    pub len: u64,
}

impl PartDescriptor {
    pub fn range(&self) -> InclusiveRange {
        InclusiveRange::from_offset_and_len(self.offset, self.len)
    }
}

impl fmt::Display for PartDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "part {} {}", self.part_number, self.range())
    }
}

/// The fully determined splitting of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    total_size: u64,
    part_size: u64,
    final_part_size: u64,
    part_count: u64,
}

impl TransferPlan {
    /// Split `total_size` bytes into parts
    ///
    /// All parts have the same size except the final one which
    /// holds the remainder. A transfer smaller than twice the
    /// recommended part size is not worth splitting and becomes
    /// a single part.
    pub fn new(total_size: u64, hints: PartSizeHints) -> Result<Self, TransferError> {
        if total_size == 0 {
            return Err(TransferError::new_invalid_plan(
                "cannot plan a transfer of 0 bytes",
            ));
        }

        if hints.min_part_size == 0 || hints.recommended_part_size == 0 {
            return Err(TransferError::new_invalid_plan(format!(
                "part sizes must not be 0 (min: {}, recommended: {})",
                hints.min_part_size, hints.recommended_part_size
            )));
        }

        if total_size < 2 * hints.recommended_part_size {
            return Ok(Self {
                total_size,
                part_size: total_size,
                final_part_size: total_size,
                part_count: 1,
            });
        }

        let mut part_size = hints.recommended_part_size.max(hints.min_part_size);

        // Grow the part size until the count fits the store's limit
        while div_ceil(total_size, part_size) > MAX_PART_COUNT {
            part_size = div_ceil(total_size, MAX_PART_COUNT);
        }

        let mut part_count = total_size / part_size;
        let remainder = total_size % part_size;
        let final_part_size = if remainder == 0 {
            part_size
        } else {
            part_count += 1;
            remainder
        };

        Ok(Self {
            total_size,
            part_size,
            final_part_size,
            part_count,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn final_part_size(&self) -> u64 {
        self.final_part_size
    }

    pub fn part_count(&self) -> u64 {
        self.part_count
    }

    pub fn is_single_part(&self) -> bool {
        self.part_count == 1
    }

    /// How many workers actually make sense for this plan
    pub fn effective_concurrency(&self, desired: usize) -> usize {
        (desired.max(1) as u64).min(self.part_count) as usize
    }

    /// The descriptor for the given 1 based part number
    pub fn part(&self, part_number: u32) -> Option<PartDescriptor> {
        if part_number == 0 || u64::from(part_number) > self.part_count {
            return None;
        }

        let index = u64::from(part_number) - 1;
        let len = if u64::from(part_number) == self.part_count {
            self.final_part_size
        } else {
            self.part_size
        };

        Some(PartDescriptor {
            part_number,
            offset: index * self.part_size,
            len,
        })
    }

    pub fn parts(&self) -> PartIterator {
        PartIterator {
            plan: *self,
            next_part_number: 1,
        }
    }
}

/// Iterates the [PartDescriptor]s of a plan in ascending order
#[derive(Debug, Clone)]
pub struct PartIterator {
    plan: TransferPlan,
    next_part_number: u32,
}

impl Iterator for PartIterator {
    type Item = PartDescriptor;

    fn next(&mut self) -> Option<PartDescriptor> {
        let part = self.plan.part(self.next_part_number)?;
        self.next_part_number += 1;
        Some(part)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining =
            (self.plan.part_count + 1).saturating_sub(u64::from(self.next_part_number)) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PartIterator {}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}
