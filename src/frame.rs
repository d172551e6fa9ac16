//! Camera frame data model
//!
//! A [`Frame`] is what the camera hands us once per capture: a format tag,
//! the full buffer dimensions, a crop rectangle and one [`Plane`] per channel.
//! Every plane carries its own row and pixel stride, so nothing here assumes
//! the data is tightly packed.

use std::fmt;

/// Pixel format reported by the frame source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// YUV 4:2:0 with three independently strided planes (Y, U, V)
    Yuv420,
    /// Already-encoded JPEG bytes in a single plane
    Jpeg,
    /// Anything else, identified by its raw format code
    Other(u32),
}

impl FrameFormat {
    /// Bits per pixel of the contiguous representation of this format
    pub fn bits_per_pixel(&self) -> Option<usize> {
        match self {
            FrameFormat::Yuv420 => Some(12),
            FrameFormat::Jpeg | FrameFormat::Other(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameFormat::Yuv420 => "YUV_420",
            FrameFormat::Jpeg => "JPEG",
            FrameFormat::Other(_) => "OTHER",
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFormat::Other(code) => write!(f, "OTHER(0x{:x})", code),
            other => f.write_str(other.name()),
        }
    }
}

/// Region of interest inside the sensor buffer, half-open on right/bottom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

impl CropRect {
    pub fn new(left: usize, top: usize, right: usize, bottom: usize) -> Self {
        Self { left, top, right, bottom }
    }

    /// Crop covering a whole `width` x `height` buffer
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> usize {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> usize {
        self.bottom.saturating_sub(self.top)
    }

    pub fn area(&self) -> usize {
        self.width().saturating_mul(self.height())
    }

    /// Crop for a plane subsampled 2:1 in both axes
    pub fn halved(&self) -> Self {
        Self::new(self.left / 2, self.top / 2, self.right / 2, self.bottom / 2)
    }
}

/// One channel of a frame
#[derive(Clone)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes between the start of consecutive rows
    pub row_stride: usize,
    /// Bytes between consecutive samples within a row
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }

    /// Bytes available for reading
    pub fn remaining(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("len", &self.data.len())
            .field("row_stride", &self.row_stride)
            .field("pixel_stride", &self.pixel_stride)
            .finish()
    }
}

/// A captured frame. The pipeline owns it for the whole of
/// remap + decode + rectify; dropping it hands the buffers back.
#[derive(Debug, Clone)]
pub struct Frame {
    pub format: FrameFormat,
    pub width: usize,
    pub height: usize,
    pub crop: CropRect,
    pub planes: Vec<Plane>,
    /// Monotonic sequence number assigned by the source
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        format: FrameFormat,
        width: usize,
        height: usize,
        crop: CropRect,
        planes: Vec<Plane>,
    ) -> Self {
        Self {
            format,
            width,
            height,
            crop,
            planes,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Number of luma samples inside the crop
    pub fn pixel_count(&self) -> usize {
        self.crop.area()
    }
}
