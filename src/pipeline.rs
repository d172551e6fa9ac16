//! Per-frame processing: remap -> decode -> rectify -> blur
//!
//! Each call handles exactly one frame and keeps no state between frames.
//! Any error drops that frame only; the caller moves on to the next one.

use image::RgbImage;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

use crate::blur::{self, BlurConfig};
use crate::config::Config;
use crate::decode::{DecodeError, FrameDecoder};
use crate::frame::{Frame, FrameFormat};
use crate::rectify::{Rectifier, RectifyError};
use crate::remap::{self, RemapError};

/// Coarse classification used for logging and stats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Plane data does not match its declared geometry
    CorruptedFrame,
    /// Frame format the pipeline cannot take
    UnsupportedFormat,
    /// No valid transform for this frame
    DegenerateGeometry,
    /// Output buffer could not be allocated
    ResourceExhausted,
    /// Image codec failure
    Codec,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::CorruptedFrame => "corrupted frame",
            FailureKind::UnsupportedFormat => "unsupported format",
            FailureKind::DegenerateGeometry => "degenerate geometry",
            FailureKind::ResourceExhausted => "resource exhausted",
            FailureKind::Codec => "codec",
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("remap failed: {0}")]
    Remap(#[from] RemapError),

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("rectification failed: {0}")]
    Rectify(#[from] RectifyError),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Remap(RemapError::UnsupportedFormat(_)) => FailureKind::UnsupportedFormat,
            PipelineError::Remap(RemapError::AllocationFailed(_)) => FailureKind::ResourceExhausted,
            PipelineError::Remap(_) => FailureKind::CorruptedFrame,
            PipelineError::Decode(DecodeError::EmptyImage { .. }) => FailureKind::DegenerateGeometry,
            PipelineError::Decode(_) => FailureKind::Codec,
            PipelineError::Rectify(RectifyError::InvalidGeometry(_)) => FailureKind::DegenerateGeometry,
        }
    }
}

/// Stage timings in microseconds
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTimings {
    pub remap_us: u64,
    pub decode_us: u64,
    pub rectify_us: u64,
    pub blur_us: u64,
}

impl FrameTimings {
    pub fn total_us(&self) -> u64 {
        self.remap_us + self.decode_us + self.rectify_us + self.blur_us
    }
}

/// Result of one frame, handed to the display side
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub sequence: u64,
    pub rectified: RgbImage,
    pub blurred: Option<RgbImage>,
    pub timings: FrameTimings,
}

pub struct FramePipeline {
    decoder: FrameDecoder,
    rectifier: Rectifier,
    blur: BlurConfig,
}

impl FramePipeline {
    pub fn new(config: &Config) -> Result<Self, RectifyError> {
        Ok(Self {
            decoder: FrameDecoder::new(config.decoder.clone()),
            rectifier: Rectifier::new(config.rectifier.clone())?,
            blur: config.blur.clone(),
        })
    }

    pub fn rectifier(&self) -> &Rectifier {
        &self.rectifier
    }

    /// Process one frame. The frame is owned here until rectification has
    /// finished (or failed); only then are its buffers released.
    pub fn process(&self, frame: Frame) -> Result<ProcessedFrame, PipelineError> {
        let mut timings = FrameTimings::default();
        let sequence = frame.sequence;

        let empty = match frame.format {
            FrameFormat::Yuv420 => frame.crop.area() == 0,
            FrameFormat::Jpeg => frame.width == 0 || frame.height == 0,
            FrameFormat::Other(_) => false,
        };
        if empty {
            return Err(RectifyError::InvalidGeometry(format!(
                "frame {} is {}x{} with a {}x{} crop",
                sequence,
                frame.width,
                frame.height,
                frame.crop.width(),
                frame.crop.height()
            ))
            .into());
        }

        let start = Instant::now();
        let decoded = match frame.format {
            FrameFormat::Yuv420 => {
                let nv21 = remap::yuv420_to_nv21(&frame)?;
                timings.remap_us = start.elapsed().as_micros() as u64;

                let decode_start = Instant::now();
                let rgb = self.decoder.decode_nv21(
                    &nv21,
                    frame.crop.width() as u32,
                    frame.crop.height() as u32,
                )?;
                timings.decode_us = decode_start.elapsed().as_micros() as u64;
                rgb
            }
            FrameFormat::Jpeg => {
                let plane = frame
                    .planes
                    .first()
                    .ok_or(RemapError::MissingPlanes(0))?;
                let rgb = self.decoder.decode_jpeg(&plane.data)?;
                timings.decode_us = start.elapsed().as_micros() as u64;
                rgb
            }
            other => return Err(RemapError::UnsupportedFormat(other).into()),
        };

        let rectify_start = Instant::now();
        let rectified = self.rectifier.rectify(&decoded)?;
        timings.rectify_us = rectify_start.elapsed().as_micros() as u64;

        drop(frame);

        let blur_start = Instant::now();
        let blurred = blur::blur(&decoded, &self.blur);
        timings.blur_us = blur_start.elapsed().as_micros() as u64;

        Ok(ProcessedFrame {
            sequence,
            rectified,
            blurred,
            timings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CropRect, Plane};
    use crate::source::SyntheticSource;

    fn pipeline() -> FramePipeline {
        let mut config = Config::default();
        config.decoder.jpeg_round_trip = false;
        config.blur.radius = 2.0;
        FramePipeline::new(&config).unwrap()
    }

    #[test]
    fn test_processes_synthetic_frame() {
        let mut source = SyntheticSource::new(64, 48);
        let frame = source.next_frame();
        let out = pipeline().process(frame).unwrap();
        assert_eq!(out.rectified.dimensions(), (64, 48));
        assert_eq!(out.blurred.as_ref().map(|b| b.dimensions()), Some((64, 48)));
    }

    #[test]
    fn test_semi_planar_frame_matches_planar() {
        let planar = SyntheticSource::new(32, 24).next_frame();
        let semi = SyntheticSource::new(32, 24)
            .semi_planar(true)
            .row_padding(8)
            .next_frame();

        let p = pipeline();
        let a = p.process(planar).unwrap();
        let b = p.process(semi).unwrap();
        assert_eq!(a.rectified, b.rectified);
    }

    #[test]
    fn test_cropped_frame_uses_crop_size() {
        let frame = SyntheticSource::new(64, 48)
            .crop(CropRect::new(8, 8, 40, 32))
            .next_frame();
        let out = pipeline().process(frame).unwrap();
        // 32x24 is exactly 4:3
        assert_eq!(out.rectified.dimensions(), (32, 24));
    }

    #[test]
    fn test_corrupted_frame_kind() {
        let mut frame = SyntheticSource::new(16, 16).next_frame();
        frame.planes[0].data.truncate(20);
        let err = pipeline().process(frame).unwrap_err();
        assert_eq!(err.kind(), FailureKind::CorruptedFrame);
    }

    #[test]
    fn test_unsupported_format_kind() {
        let mut frame = SyntheticSource::new(16, 16).next_frame();
        frame.format = FrameFormat::Other(0x20203859);
        let err = pipeline().process(frame).unwrap_err();
        assert_eq!(err.kind(), FailureKind::UnsupportedFormat);
    }

    #[test]
    fn test_zero_sized_frame_is_degenerate() {
        let frame = Frame::new(
            FrameFormat::Yuv420,
            0,
            0,
            CropRect::full(0, 0),
            vec![
                Plane::new(Vec::new(), 0, 1),
                Plane::new(Vec::new(), 0, 2),
                Plane::new(Vec::new(), 0, 2),
            ],
        );
        let err = pipeline().process(frame).unwrap_err();
        assert_eq!(err.kind(), FailureKind::DegenerateGeometry);
    }

    #[test]
    fn test_jpeg_frame_bypasses_remap() {
        use image::ImageOutputFormat;
        use std::io::Cursor;

        let img = RgbImage::from_pixel(40, 30, image::Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Jpeg(90))
            .unwrap();
        let len = bytes.len();
        let frame = Frame::new(
            FrameFormat::Jpeg,
            40,
            30,
            CropRect::full(40, 30),
            vec![Plane::new(bytes, len, 1)],
        );

        let out = pipeline().process(frame).unwrap();
        assert_eq!(out.rectified.dimensions(), (40, 30));
    }

    #[test]
    fn test_zero_sized_jpeg_is_degenerate() {
        let frame = Frame::new(
            FrameFormat::Jpeg,
            0,
            0,
            CropRect::full(0, 0),
            vec![Plane::new(vec![0xFF, 0xD8], 2, 1)],
        );
        let err = pipeline().process(frame).unwrap_err();
        assert_eq!(err.kind(), FailureKind::DegenerateGeometry);

        let decoded_empty = PipelineError::from(DecodeError::EmptyImage { width: 0, height: 30 });
        assert_eq!(decoded_empty.kind(), FailureKind::DegenerateGeometry);

        let garbage = Frame::new(
            FrameFormat::Jpeg,
            4,
            4,
            CropRect::full(4, 4),
            vec![Plane::new(vec![1, 2, 3], 3, 1)],
        );
        assert_eq!(pipeline().process(garbage).unwrap_err().kind(), FailureKind::Codec);
    }

    #[test]
    fn test_jpeg_frame_without_planes() {
        let frame = Frame::new(FrameFormat::Jpeg, 4, 4, CropRect::full(4, 4), Vec::new());
        let err = pipeline().process(frame).unwrap_err();
        assert_eq!(err.kind(), FailureKind::CorruptedFrame);
    }
}
