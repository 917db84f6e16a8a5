//! Splits a record batch into bounded, contiguous chunks.

use crate::core::errors::{FanoutError, Result};
use crate::model::{Chunk, Record, RecordBatch};

/// What to do with the first row of a collected batch
///
/// The header is removed once, before splitting, so chunk `i` always covers
/// data rows `[i*capacity, (i+1)*capacity)` and nothing downstream has to
/// re-apply an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderPolicy {
    /// Every row is data
    #[default]
    None,
    /// The first row is a header and is not processed
    SkipFirst,
}

impl HeaderPolicy {
    pub fn from_flag(skip_header: bool) -> Self {
        if skip_header {
            HeaderPolicy::SkipFirst
        } else {
            HeaderPolicy::None
        }
    }

    /// The data rows of `batch` under this policy
    pub fn data_rows<'a>(&self, batch: &'a RecordBatch) -> &'a [Record] {
        match self {
            HeaderPolicy::None => batch.records(),
            HeaderPolicy::SkipFirst => batch.records().get(1..).unwrap_or(&[]),
        }
    }
}

/// Number of chunks needed for `len` records: `ceil(len / capacity)`
pub fn chunk_count(len: usize, capacity: usize) -> Result<usize> {
    if capacity == 0 {
        return Err(FanoutError::configuration_field(
            "capacity must be at least 1",
            "capacity",
        ));
    }
    Ok(len.div_ceil(capacity))
}

/// Partition `records` into chunks of at most `capacity` records
pub fn split(records: &[Record], capacity: usize) -> Result<Vec<Chunk>> {
    let count = chunk_count(records.len(), capacity)?;
    let chunks = records
        .chunks(capacity)
        .enumerate()
        .map(|(index, slice)| Chunk {
            index,
            records: slice.to_vec(),
        })
        .collect::<Vec<_>>();
    debug_assert_eq!(chunks.len(), count);
    Ok(chunks)
}

/// Apply `policy` to `batch`, then split the remaining rows
pub fn split_batch(batch: &RecordBatch, capacity: usize, policy: HeaderPolicy) -> Result<Vec<Chunk>> {
    split(policy.data_rows(batch), capacity)
}
