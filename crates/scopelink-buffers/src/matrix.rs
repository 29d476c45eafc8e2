// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Matrix buffer: a ring of fixed-width `f64` rows
//!
//! Used for tracking results and hardware telemetry. The column count is
//! fixed at creation (`[128:132]`, u32 LE) and each record is one row of
//! little-endian `f64`s. One write may carry 1..=capacity rows and is applied
//! atomically.

use ndarray::{Array1, Array2, ArrayView2};

use crate::error::{BufferError, Result};
use crate::handle::{BufferHandle, SegmentKind};
use crate::ring::{OverflowPolicy, Record, RingBuffer, WriteOutcome};
use crate::segment::offsets;

const N_COLS: usize = offsets::GEOMETRY;

/// Ring buffer of numeric rows
#[derive(Debug)]
pub struct MatrixBuffer {
    ring: RingBuffer,
    n_cols: usize,
}

impl MatrixBuffer {
    pub fn create(handle: &BufferHandle, capacity: usize, n_cols: usize) -> Result<Self> {
        expect_kind(handle)?;
        if n_cols == 0 {
            return Err(BufferError::InvalidGeometry(format!(
                "matrix '{}' needs at least one column",
                handle.name()
            )));
        }
        let ring = RingBuffer::create(handle, capacity, n_cols * 8)?;
        ring.segment().write_u32(N_COLS, n_cols as u32);
        Ok(Self { ring, n_cols })
    }

    pub fn attach(handle: &BufferHandle) -> Result<Self> {
        expect_kind(handle)?;
        let ring = RingBuffer::attach(handle)?;
        let n_cols = ring.segment().read_u32(N_COLS) as usize;
        if n_cols == 0 || n_cols * 8 != ring.record_size() {
            return Err(BufferError::InvalidHeader {
                path: handle.path().to_path_buf(),
                reason: format!("{} columns do not fit {}-byte rows", n_cols, ring.record_size()),
            });
        }
        Ok(Self { ring, n_cols })
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn handle(&self) -> &BufferHandle {
        self.ring.handle()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn get_level(&self) -> f64 {
        self.ring.get_level()
    }

    pub fn purge_count(&self) -> u64 {
        self.ring.purge_count()
    }

    /// Append 1..=capacity rows as one group
    ///
    /// Strict: all rows or none. Purge: as many oldest rows as needed are
    /// dropped and reported once with the total.
    pub fn write_rows(
        &self,
        rows: ArrayView2<'_, f64>,
        timestamp: f64,
        policy: OverflowPolicy,
    ) -> Result<WriteOutcome> {
        if rows.ncols() != self.n_cols {
            return Err(BufferError::ShapeMismatch {
                expected: format!("{} columns", self.n_cols),
                actual: format!("{} columns", rows.ncols()),
            });
        }
        if rows.nrows() == 0 || rows.nrows() > self.capacity() {
            return Err(BufferError::ShapeMismatch {
                expected: format!("1..={} rows", self.capacity()),
                actual: format!("{} rows", rows.nrows()),
            });
        }
        let mut bytes = Vec::with_capacity(rows.len() * 8);
        for value in rows.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.ring.write_records(&bytes, timestamp, policy)
    }

    /// Append one row
    pub fn write_row(&self, row: &[f64], timestamp: f64, policy: OverflowPolicy) -> Result<WriteOutcome> {
        let view = ArrayView2::from_shape((1, row.len()), row).map_err(|e| BufferError::ShapeMismatch {
            expected: format!("{} columns", self.n_cols),
            actual: e.to_string(),
        })?;
        self.write_rows(view, timestamp, policy)
    }

    /// Consume the oldest row
    pub fn read_row(&self) -> Result<Array1<f64>> {
        self.ring.read_with(|bytes, _| Array1::from(decode_row(bytes)))
    }

    /// Consume every unread row, oldest first (zero rows when empty)
    pub fn read_all(&self) -> Array2<f64> {
        self.to_matrix(self.ring.drain())
    }

    /// Copy the newest `n` rows without consuming them, oldest first
    pub fn latest_rows(&self, n: usize) -> Array2<f64> {
        self.to_matrix(self.ring.latest(n))
    }

    fn to_matrix(&self, records: Vec<Record>) -> Array2<f64> {
        let n_rows = records.len();
        let mut values = Vec::with_capacity(n_rows * self.n_cols);
        for record in &records {
            values.extend(decode_row(&record.data));
        }
        Array2::from_shape_vec((n_rows, self.n_cols), values)
            .unwrap_or_else(|_| Array2::zeros((0, self.n_cols)))
    }

    pub fn discard(&self, n: usize) -> usize {
        self.ring.discard(n)
    }

    pub fn unlink(&self) -> Result<()> {
        self.ring.unlink()
    }
}

fn expect_kind(handle: &BufferHandle) -> Result<()> {
    if handle.kind() != SegmentKind::Matrix {
        return Err(BufferError::KindMismatch {
            path: handle.path().to_path_buf(),
            expected: SegmentKind::Matrix,
            found: handle.kind(),
        });
    }
    Ok(())
}

fn decode_row(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn matrix(dir: &std::path::Path, capacity: usize, n_cols: usize) -> MatrixBuffer {
        let handle = BufferHandle::new(dir, "tracks", SegmentKind::Matrix);
        MatrixBuffer::create(&handle, capacity, n_cols).unwrap()
    }

    #[test]
    fn test_rows_round_trip_in_order() {
        let dir = tempdir().unwrap();
        let m = matrix(dir.path(), 5, 3);
        m.write_rows(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].view(), 0.0, OverflowPolicy::Strict)
            .unwrap();
        m.write_row(&[7.0, 8.0, 9.0], 0.0, OverflowPolicy::Strict).unwrap();

        assert_eq!(m.read_row().unwrap(), array![1.0, 2.0, 3.0]);
        assert_eq!(m.read_all(), array![[4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        assert_eq!(m.read_all().nrows(), 0);
    }

    #[test]
    fn test_batch_purge_reports_total_once() {
        let dir = tempdir().unwrap();
        let m = matrix(dir.path(), 3, 1);
        m.write_rows(array![[1.0], [2.0], [3.0]].view(), 0.0, OverflowPolicy::PurgeOldest)
            .unwrap();

        let outcome = m
            .write_rows(array![[4.0], [5.0]].view(), 0.0, OverflowPolicy::PurgeOldest)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Purged { dropped: 2 });
        assert_eq!(m.purge_count(), 2);
        assert_eq!(m.read_all(), array![[3.0], [4.0], [5.0]]);
    }

    #[test]
    fn test_too_many_rows_or_columns_rejected() {
        let dir = tempdir().unwrap();
        let m = matrix(dir.path(), 2, 2);
        let three_rows = Array2::<f64>::zeros((3, 2));
        assert!(m.write_rows(three_rows.view(), 0.0, OverflowPolicy::PurgeOldest).is_err());
        assert!(m.write_row(&[1.0, 2.0, 3.0], 0.0, OverflowPolicy::Strict).is_err());
        assert!(m.is_empty());
    }

    #[test]
    fn test_latest_rows_does_not_consume() {
        let dir = tempdir().unwrap();
        let m = matrix(dir.path(), 4, 2);
        for i in 0..4 {
            m.write_row(&[i as f64, -(i as f64)], 0.0, OverflowPolicy::Strict).unwrap();
        }
        assert_eq!(m.latest_rows(2), array![[2.0, -2.0], [3.0, -3.0]]);
        assert_eq!(m.latest_rows(10).nrows(), 4);
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn test_attach_reads_column_count() {
        let dir = tempdir().unwrap();
        let owner = matrix(dir.path(), 4, 7);
        let attached = MatrixBuffer::attach(owner.handle()).unwrap();
        assert_eq!(attached.n_cols(), 7);
        assert_eq!(attached.capacity(), 4);
    }
}
