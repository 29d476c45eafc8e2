// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Video buffer: a ring of image stacks
//!
//! Geometry lives in the header so an attaching process rebuilds its array
//! views from the segment alone:
//! ```text
//! [128:132] stack depth (u32 LE)
//! [132:136] frame height (u32 LE)
//! [136:140] frame width (u32 LE)
//! [140:144] bits per pixel (u32 LE)
//! ```
//! Records are `stack_depth x height x width` pixels in (frame, y, x) order.

use bytemuck::{Pod, Zeroable};
use ndarray::{Array2, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::{BufferError, Result};
use crate::handle::{BufferHandle, SegmentKind};
use crate::ring::{OverflowPolicy, Record, RingBuffer, WriteOutcome};
use crate::segment::offsets;

const DEPTH: usize = offsets::GEOMETRY;
const HEIGHT: usize = offsets::GEOMETRY + 4;
const WIDTH: usize = offsets::GEOMETRY + 8;
const BITS: usize = offsets::GEOMETRY + 12;

/// Unsigned pixel types a video buffer can hold
pub trait Pixel: Pod + Send + Sync + 'static {
    const BITS: u32;
}

impl Pixel for u8 {
    const BITS: u32 = 8;
}

impl Pixel for u16 {
    const BITS: u32 = 16;
}

impl Pixel for u32 {
    const BITS: u32 = 32;
}

impl Pixel for u64 {
    const BITS: u32 = 64;
}

/// Shape and dtype of one image stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackGeometry {
    pub stack_depth: usize,
    pub height: usize,
    pub width: usize,
    pub bits: u32,
}

impl StackGeometry {
    pub fn new(stack_depth: usize, height: usize, width: usize, bits: u32) -> Result<Self> {
        let geometry = Self {
            stack_depth,
            height,
            width,
            bits,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.bits, 8 | 16 | 32 | 64) {
            return Err(BufferError::InvalidGeometry(format!(
                "unsupported bit depth {}",
                self.bits
            )));
        }
        if self.stack_depth == 0 || self.height == 0 || self.width == 0 {
            return Err(BufferError::InvalidGeometry(format!(
                "empty stack shape {:?}",
                self.shape()
            )));
        }
        Ok(())
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.stack_depth, self.height, self.width)
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bits as usize / 8
    }

    pub fn frame_bytes(&self) -> usize {
        self.height * self.width * self.bytes_per_pixel()
    }

    pub fn stack_bytes(&self) -> usize {
        self.stack_depth * self.frame_bytes()
    }
}

/// Ring buffer of image stacks
#[derive(Debug)]
pub struct VideoBuffer {
    ring: RingBuffer,
    geometry: StackGeometry,
}

impl VideoBuffer {
    pub fn create(handle: &BufferHandle, capacity: usize, geometry: StackGeometry) -> Result<Self> {
        geometry.validate()?;
        expect_kind(handle)?;
        let ring = RingBuffer::create(handle, capacity, geometry.stack_bytes())?;
        let segment = ring.segment();
        segment.write_u32(DEPTH, geometry.stack_depth as u32);
        segment.write_u32(HEIGHT, geometry.height as u32);
        segment.write_u32(WIDTH, geometry.width as u32);
        segment.write_u32(BITS, geometry.bits);
        Ok(Self { ring, geometry })
    }

    /// Map an existing video buffer and rebuild its geometry from the header
    pub fn attach(handle: &BufferHandle) -> Result<Self> {
        expect_kind(handle)?;
        let ring = RingBuffer::attach(handle)?;
        let segment = ring.segment();
        let geometry = StackGeometry {
            stack_depth: segment.read_u32(DEPTH) as usize,
            height: segment.read_u32(HEIGHT) as usize,
            width: segment.read_u32(WIDTH) as usize,
            bits: segment.read_u32(BITS),
        };
        geometry.validate()?;
        if geometry.stack_bytes() != ring.record_size() {
            return Err(BufferError::InvalidHeader {
                path: handle.path().to_path_buf(),
                reason: format!(
                    "geometry {:?} needs {} bytes per stack, slots hold {}",
                    geometry,
                    geometry.stack_bytes(),
                    ring.record_size()
                ),
            });
        }
        Ok(Self { ring, geometry })
    }

    pub fn geometry(&self) -> StackGeometry {
        self.geometry
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

    fn check_dtype<T: Pixel>(&self) -> Result<()> {
        if T::BITS != self.geometry.bits {
            return Err(BufferError::ShapeMismatch {
                expected: format!("{}-bit pixels", self.geometry.bits),
                actual: format!("{}-bit pixels", T::BITS),
            });
        }
        Ok(())
    }

    /// Append one stack shaped (frame, y, x)
    pub fn write_stack<T: Pixel>(
        &self,
        stack: ArrayView3<'_, T>,
        timestamp: f64,
        policy: OverflowPolicy,
    ) -> Result<WriteOutcome> {
        self.check_dtype::<T>()?;
        let (d, h, w) = self.geometry.shape();
        if stack.shape() != &[d, h, w][..] {
            return Err(BufferError::ShapeMismatch {
                expected: format!("{:?}", [d, h, w]),
                actual: format!("{:?}", stack.shape()),
            });
        }
        match stack.as_slice() {
            Some(pixels) => self.ring.write(bytemuck::cast_slice(pixels), timestamp, policy),
            None => {
                let owned: Vec<T> = stack.iter().copied().collect();
                self.ring.write(bytemuck::cast_slice(&owned), timestamp, policy)
            }
        }
    }

    /// Append one stack of raw camera bytes (opaque to the buffer)
    pub fn write_stack_bytes(
        &self,
        bytes: &[u8],
        timestamp: f64,
        policy: OverflowPolicy,
    ) -> Result<WriteOutcome> {
        self.ring.write(bytes, timestamp, policy)
    }

    /// Consume the oldest stack
    pub fn read_stack<T: Pixel>(&self) -> Result<(Array3<T>, f64)> {
        self.check_dtype::<T>()?;
        let (pixels, timestamp) = self
            .ring
            .read_with(|bytes, timestamp| (decode::<T>(bytes), timestamp))?;
        let stack = Array3::from_shape_vec(self.geometry.shape(), pixels).map_err(|e| {
            BufferError::ShapeMismatch {
                expected: format!("{:?}", self.geometry.shape()),
                actual: e.to_string(),
            }
        })?;
        Ok((stack, timestamp))
    }

    /// Consume the oldest stack as raw bytes
    pub fn read_stack_bytes(&self) -> Result<Record> {
        self.ring.read()
    }

    /// Whether a complete stack is waiting to be read
    pub fn check_read_stack(&self) -> bool {
        !self.ring.is_empty()
    }

    /// Last frame of the newest stack, read without the lock (preview only)
    pub fn peek_latest_frame<T: Pixel>(&self) -> Result<Option<(Array2<T>, f64)>> {
        self.check_dtype::<T>()?;
        let Some(record) = self.ring.peek_latest() else {
            return Ok(None);
        };
        let frame_bytes = self.geometry.frame_bytes();
        let start = record.data.len() - frame_bytes;
        let pixels = decode::<T>(&record.data[start..]);
        let frame = Array2::from_shape_vec((self.geometry.height, self.geometry.width), pixels)
            .map_err(|e| BufferError::ShapeMismatch {
                expected: format!("{:?}", (self.geometry.height, self.geometry.width)),
                actual: e.to_string(),
            })?;
        Ok(Some((frame, record.timestamp)))
    }

    /// Drop up to `n` oldest stacks
    pub fn discard(&self, n: usize) -> usize {
        self.ring.discard(n)
    }

    pub fn unlink(&self) -> Result<()> {
        self.ring.unlink()
    }
}

fn expect_kind(handle: &BufferHandle) -> Result<()> {
    if handle.kind() != SegmentKind::Video {
        return Err(BufferError::KindMismatch {
            path: handle.path().to_path_buf(),
            expected: SegmentKind::Video,
            found: handle.kind(),
        });
    }
    Ok(())
}

/// Copy bytes into a correctly aligned pixel vector
fn decode<T: Pixel>(bytes: &[u8]) -> Vec<T> {
    let mut pixels = vec![T::zeroed(); bytes.len() / std::mem::size_of::<T>()];
    bytemuck::cast_slice_mut::<T, u8>(&mut pixels).copy_from_slice(bytes);
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;
    use tempfile::tempdir;

    fn stack(depth: usize, h: usize, w: usize, seed: u16) -> Array3<u16> {
        Array3::from_shape_fn((depth, h, w), |(f, y, x)| seed * 1000 + (f * 100 + y * 10 + x) as u16)
    }

    #[test]
    fn test_attach_rebuilds_geometry_from_header() {
        let dir = tempdir().unwrap();
        let handle = BufferHandle::new(dir.path(), "video", SegmentKind::Video);
        let geometry = StackGeometry::new(2, 8, 8, 16).unwrap();
        let owner = VideoBuffer::create(&handle, 4, geometry).unwrap();

        owner
            .write_stack(stack(2, 8, 8, 1).view(), 1.5, OverflowPolicy::Strict)
            .unwrap();

        let attached = VideoBuffer::attach(&handle).unwrap();
        assert_eq!(attached.geometry(), geometry);
        let (read, ts) = attached.read_stack::<u16>().unwrap();
        assert_eq!(read, stack(2, 8, 8, 1));
        assert_eq!(ts, 1.5);
        assert!(owner.is_empty());
    }

    #[test]
    fn test_wrong_dtype_and_shape_rejected() {
        let dir = tempdir().unwrap();
        let handle = BufferHandle::new(dir.path(), "video", SegmentKind::Video);
        let video = VideoBuffer::create(&handle, 2, StackGeometry::new(2, 4, 4, 16).unwrap()).unwrap();

        let bytes8 = Array3::<u8>::zeros((2, 4, 4));
        assert!(matches!(
            video.write_stack(bytes8.view(), 0.0, OverflowPolicy::Strict),
            Err(BufferError::ShapeMismatch { .. })
        ));
        let wrong_shape = Array3::<u16>::zeros((1, 4, 4));
        assert!(matches!(
            video.write_stack(wrong_shape.view(), 0.0, OverflowPolicy::Strict),
            Err(BufferError::ShapeMismatch { .. })
        ));
        assert!(video.read_stack::<u32>().is_err());
    }

    #[test]
    fn test_non_contiguous_view_is_copied_in_order() {
        let dir = tempdir().unwrap();
        let handle = BufferHandle::new(dir.path(), "video", SegmentKind::Video);
        let video = VideoBuffer::create(&handle, 2, StackGeometry::new(2, 3, 3, 16).unwrap()).unwrap();

        let big = stack(2, 6, 6, 2);
        let strided = big.slice(s![.., ..;2, ..;2]);
        video.write_stack(strided, 0.0, OverflowPolicy::Strict).unwrap();
        let (read, _) = video.read_stack::<u16>().unwrap();
        assert_eq!(read, strided.to_owned());
    }

    #[test]
    fn test_peek_latest_frame_is_last_frame_of_newest_stack() {
        let dir = tempdir().unwrap();
        let handle = BufferHandle::new(dir.path(), "video", SegmentKind::Video);
        let video = VideoBuffer::create(&handle, 3, StackGeometry::new(2, 4, 4, 16).unwrap()).unwrap();
        assert!(video.peek_latest_frame::<u16>().unwrap().is_none());

        video.write_stack(stack(2, 4, 4, 1).view(), 1.0, OverflowPolicy::Strict).unwrap();
        video.write_stack(stack(2, 4, 4, 2).view(), 2.0, OverflowPolicy::Strict).unwrap();

        let (frame, ts) = video.peek_latest_frame::<u16>().unwrap().unwrap();
        assert_eq!(frame, stack(2, 4, 4, 2).slice(s![1, .., ..]).to_owned());
        assert_eq!(ts, 2.0);
        assert_eq!(video.len(), 2);
    }

    #[test]
    fn test_attach_as_wrong_kind_fails() {
        let dir = tempdir().unwrap();
        let handle = BufferHandle::new(dir.path(), "video", SegmentKind::Video);
        VideoBuffer::create(&handle, 2, StackGeometry::new(1, 2, 2, 8).unwrap()).unwrap();

        let as_matrix = BufferHandle::new(dir.path(), "video", SegmentKind::Matrix);
        assert!(matches!(
            RingBuffer::attach(&as_matrix),
            Err(BufferError::KindMismatch { .. })
        ));
    }
}
