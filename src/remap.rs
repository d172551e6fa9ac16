//! YUV 4:2:0 plane remapping
//!
//! Camera hardware delivers YUV 4:2:0 as three planes, each with its own row
//! stride and pixel stride. Image codecs want NV21 instead: one contiguous
//! luma plane followed by a half-resolution chroma plane with V and U
//! interleaved byte by byte.
//!
//! ```text
//! Y plane            U plane    V plane
//! ===============    =======    =======
//! Y Y Y Y Y Y Y Y    U U U U    V V V V
//! Y Y Y Y Y Y Y Y    U U U U    V V V V
//! Y Y Y Y Y Y Y Y    U U U U    V V V V
//! Y Y Y Y Y Y Y Y    U U U U    V V V V
//! Y Y Y Y Y Y Y Y
//! Y Y Y Y Y Y Y Y
//! Y Y Y Y Y Y Y Y
//! Y Y Y Y Y Y Y Y
//!
//! NV21 output
//! ===============    ===============
//! Y Y Y Y Y Y Y Y    V U V U V U V U
//! Y Y Y Y Y Y Y Y    V U V U V U V U
//! Y Y Y Y Y Y Y Y    V U V U V U V U
//! Y Y Y Y Y Y Y Y    V U V U V U V U
//! Y Y Y Y Y Y Y Y
//! Y Y Y Y Y Y Y Y
//! Y Y Y Y Y Y Y Y
//! Y Y Y Y Y Y Y Y
//! ```
//!
//! V always lands on the even chroma offsets and U on the odd ones.

use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::frame::{CropRect, Frame, FrameFormat, Plane};

/// Which channel a plane carries, in the order the camera delivers them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneRole {
    Luma,
    /// Cb, written to odd chroma offsets
    ChromaU,
    /// Cr, written to even chroma offsets
    ChromaV,
}

impl PlaneRole {
    /// Roles in plane order. Planes past the third have no role.
    pub const ORDER: [PlaneRole; 3] = [PlaneRole::Luma, PlaneRole::ChromaU, PlaneRole::ChromaV];

    /// Output bytes advanced per sample written
    pub fn output_stride(&self) -> usize {
        match self {
            PlaneRole::Luma => 1,
            PlaneRole::ChromaU | PlaneRole::ChromaV => 2,
        }
    }

    /// Where the first sample of this channel goes in the NV21 buffer
    pub fn output_offset(&self, pixel_count: usize) -> usize {
        match self {
            PlaneRole::Luma => 0,
            PlaneRole::ChromaV => pixel_count,
            PlaneRole::ChromaU => pixel_count + 1,
        }
    }

    /// Crop of this plane given the crop of the full-resolution frame
    pub fn plane_crop(&self, crop: &CropRect) -> CropRect {
        match self {
            PlaneRole::Luma => *crop,
            PlaneRole::ChromaU | PlaneRole::ChromaV => crop.halved(),
        }
    }
}

impl fmt::Display for PlaneRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaneRole::Luma => "Y",
            PlaneRole::ChromaU => "U",
            PlaneRole::ChromaV => "V",
        })
    }
}

#[derive(Debug, Error)]
pub enum RemapError {
    #[error("unsupported frame format {0}, expected YUV_420")]
    UnsupportedFormat(FrameFormat),

    #[error("YUV_420 frame needs 3 planes, got {0}")]
    MissingPlanes(usize),

    #[error("crop {width}x{height} must have even dimensions")]
    OddCrop { width: usize, height: usize },

    #[error("crop {crop:?} exceeds frame bounds {width}x{height}")]
    CropOutOfBounds {
        crop: CropRect,
        width: usize,
        height: usize,
    },

    #[error("{role} plane strides (row {row_stride}, pixel {pixel_stride}) cannot hold {samples} samples per row")]
    InvalidStride {
        role: PlaneRole,
        row_stride: usize,
        pixel_stride: usize,
        samples: usize,
    },

    #[error("{role} plane holds {available} bytes but its geometry needs {required}")]
    PlaneTooShort {
        role: PlaneRole,
        required: usize,
        available: usize,
    },

    #[error("output buffer holds {available} bytes, need {required}")]
    OutputTooSmall { required: usize, available: usize },

    #[error("failed to allocate {0} bytes for NV21 output")]
    AllocationFailed(usize),
}

/// Size in bytes of the NV21 buffer for a crop
pub fn nv21_len(crop: &CropRect) -> usize {
    crop.area() * 12 / 8
}

/// Convert a YUV 4:2:0 frame into a freshly allocated NV21 buffer
pub fn yuv420_to_nv21(frame: &Frame) -> Result<Vec<u8>, RemapError> {
    validate_frame(frame)?;

    let bits_per_pixel = frame.format.bits_per_pixel().unwrap_or(12);
    let len = frame.pixel_count() * bits_per_pixel / 8;

    let mut out = Vec::new();
    out.try_reserve_exact(len)
        .map_err(|_| RemapError::AllocationFailed(len))?;
    out.resize(len, 0);

    remap(frame, &mut out, true)?;
    Ok(out)
}

/// Convert a YUV 4:2:0 frame into a caller-provided buffer.
///
/// Every plane is checked before the first byte is written, so on error
/// `out` is left untouched.
pub fn yuv420_to_nv21_into(frame: &Frame, out: &mut [u8]) -> Result<(), RemapError> {
    validate_frame(frame)?;
    remap(frame, out, true)
}

fn validate_frame(frame: &Frame) -> Result<(), RemapError> {
    if frame.format != FrameFormat::Yuv420 {
        return Err(RemapError::UnsupportedFormat(frame.format));
    }
    if frame.planes.len() < PlaneRole::ORDER.len() {
        return Err(RemapError::MissingPlanes(frame.planes.len()));
    }
    if frame.planes.len() > PlaneRole::ORDER.len() {
        debug!(
            "Frame {} has {} planes, ignoring the extra {}",
            frame.sequence,
            frame.planes.len(),
            frame.planes.len() - PlaneRole::ORDER.len()
        );
    }

    let crop = frame.crop;
    if crop.right > frame.width || crop.bottom > frame.height || crop.left > crop.right || crop.top > crop.bottom {
        return Err(RemapError::CropOutOfBounds {
            crop,
            width: frame.width,
            height: frame.height,
        });
    }
    if crop.width() % 2 != 0 || crop.height() % 2 != 0 {
        return Err(RemapError::OddCrop {
            width: crop.width(),
            height: crop.height(),
        });
    }
    // nv21_len and every output offset stay below area * 12 / 8
    if crop.width().checked_mul(crop.height()).and_then(|a| a.checked_mul(12)).is_none() {
        return Err(RemapError::CropOutOfBounds {
            crop,
            width: frame.width,
            height: frame.height,
        });
    }
    Ok(())
}

/// Bytes to read per row so that all of its samples are covered.
///
/// The stride may include data from other channels between samples:
///
/// ```text
/// |---- Pixel stride ----|                    Row ends here --> |
/// | Pixel 1 | Other Data | Pixel 2 | Other Data | ... | Pixel N |
/// ```
///
/// so we need (N-1) * pixel stride bytes plus one for the last sample.
/// `None` when that does not fit in a `usize`.
fn row_length(samples: usize, pixel_stride: usize, output_stride: usize) -> Option<usize> {
    if pixel_stride == 1 && output_stride == 1 {
        Some(samples)
    } else {
        samples
            .checked_sub(1)?
            .checked_mul(pixel_stride)?
            .checked_add(1)
    }
}

/// Check a plane can satisfy every row read its crop implies
fn check_plane(role: PlaneRole, plane: &Plane, crop: &CropRect) -> Result<(), RemapError> {
    let samples = crop.width();
    let rows = crop.height();
    if samples == 0 || rows == 0 {
        return Ok(());
    }

    let invalid_stride = || RemapError::InvalidStride {
        role,
        row_stride: plane.row_stride,
        pixel_stride: plane.pixel_stride,
        samples,
    };
    let row_len = row_length(samples, plane.pixel_stride, role.output_stride())
        .ok_or_else(invalid_stride)?;
    if plane.pixel_stride == 0 || plane.row_stride < row_len {
        return Err(invalid_stride());
    }

    // Rows are read in increasing order, so the last one bounds them all.
    // Geometry that overflows cannot fit in any buffer.
    let required = (rows - 1 + crop.top)
        .checked_mul(plane.row_stride)
        .and_then(|r| r.checked_add(crop.left.checked_mul(plane.pixel_stride)?))
        .and_then(|start| start.checked_add(row_len))
        .unwrap_or(usize::MAX);
    if required > plane.remaining() {
        return Err(RemapError::PlaneTooShort {
            role,
            required,
            available: plane.remaining(),
        });
    }
    Ok(())
}

/// `allow_fast_path` is only turned off by tests comparing both copy paths
fn remap(frame: &Frame, out: &mut [u8], allow_fast_path: bool) -> Result<(), RemapError> {
    let pixel_count = frame.pixel_count();
    let required = nv21_len(&frame.crop);
    if out.len() < required {
        return Err(RemapError::OutputTooSmall {
            required,
            available: out.len(),
        });
    }

    for (role, plane) in PlaneRole::ORDER.iter().zip(&frame.planes) {
        check_plane(*role, plane, &role.plane_crop(&frame.crop))?;
    }

    for (role, plane) in PlaneRole::ORDER.iter().zip(&frame.planes) {
        copy_plane(*role, plane, &frame.crop, pixel_count, out, allow_fast_path);
    }
    Ok(())
}

fn copy_plane(
    role: PlaneRole,
    plane: &Plane,
    frame_crop: &CropRect,
    pixel_count: usize,
    out: &mut [u8],
    allow_fast_path: bool,
) {
    let crop = role.plane_crop(frame_crop);
    let samples = crop.width();
    if samples == 0 || crop.height() == 0 {
        return;
    }

    let output_stride = role.output_stride();
    let pixel_stride = plane.pixel_stride;
    let contiguous = allow_fast_path && pixel_stride == 1 && output_stride == 1;
    // check_plane has already bounded every read below
    let Some(row_len) = row_length(samples, pixel_stride, output_stride) else {
        return;
    };
    let mut output_offset = role.output_offset(pixel_count);

    for row in 0..crop.height() {
        let start = (row + crop.top) * plane.row_stride + crop.left * pixel_stride;
        let src = &plane.data[start..start + row_len];

        if contiguous {
            // Single stride on both sides, the row goes across in one copy
            out[output_offset..output_offset + row_len].copy_from_slice(src);
            output_offset += row_len;
        } else {
            for &sample in src.iter().step_by(pixel_stride) {
                out[output_offset] = sample;
                output_offset += output_stride;
            }
        }
    }
}
