use std::ops::Range;

use crate::{config::WriteOptions, error::BulkWriteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// The whole input is written by one statement.
    Single,
    Chunked { chunk_size: usize },
}

/// Decides how a write of `total` records is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    total: usize,
    mode: BatchMode,
}

impl BatchPlan {
    pub fn new(total: usize, options: &WriteOptions) -> Result<Self, BulkWriteError> {
        if options.chunk_size == 0 {
            return Err(BulkWriteError::InvalidChunkSize);
        }

        let chunked =
            if options.auto_chunk { total > options.chunk_size } else { options.force_chunk };

        let mode = if chunked {
            BatchMode::Chunked { chunk_size: options.chunk_size }
        } else {
            BatchMode::Single
        };

        Ok(BatchPlan { total, mode })
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.mode, BatchMode::Chunked { .. })
    }

    pub fn chunk_count(&self) -> usize {
        match self.mode {
            _ if self.total == 0 => 0,
            BatchMode::Single => 1,
            BatchMode::Chunked { chunk_size } => self.total.div_ceil(chunk_size),
        }
    }

    fn step(&self, total: usize) -> usize {
        match self.mode {
            BatchMode::Single => total.max(1),
            BatchMode::Chunked { chunk_size } => chunk_size,
        }
    }

    pub fn boundaries(&self) -> ChunkBoundaries {
        ChunkBoundaries { next: 0, total: self.total, step: self.step(self.total) }
    }

    /// Lazily slices `items` into batches. Iterating again means calling this again.
    pub fn batches<'a, T>(&self, items: &'a [T]) -> Batches<'a, T> {
        debug_assert_eq!(items.len(), self.total, "plan was made for a different input");

        Batches {
            items,
            boundaries: ChunkBoundaries {
                next: 0,
                total: items.len(),
                step: self.step(items.len()),
            },
            index: 0,
        }
    }
}

/// Half open ranges `[i, min(i + step, total))` covering `0..total`.
#[derive(Debug, Clone)]
pub struct ChunkBoundaries {
    next: usize,
    total: usize,
    step: usize,
}

impl Iterator for ChunkBoundaries {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.step).min(self.total);
        self.next = end;
        Some(start..end)
    }
}

#[derive(Debug)]
pub struct Batch<'a, T> {
    pub index: usize,
    pub range: Range<usize>,
    pub items: &'a [T],
}

#[derive(Debug)]
pub struct Batches<'a, T> {
    items: &'a [T],
    boundaries: ChunkBoundaries,
    index: usize,
}

impl<'a, T> Iterator for Batches<'a, T> {
    type Item = Batch<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        let range = self.boundaries.next()?;
        let batch = Batch { index: self.index, items: &self.items[range.clone()], range };
        self.index += 1;
        Some(batch)
    }
}
