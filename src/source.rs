//! Frame sources
//!
//! Stand-ins for the camera: raw I420 / JPEG files on disk, and a synthetic
//! generator that can reproduce the plane layouts real sensors hand out
//! (padded rows, U and V sharing one interleaved buffer).

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::frame::{CropRect, Frame, FrameFormat, Plane};

const FRAME_EXTENSIONS: &[&str] = &["yuv", "i420", "jpg", "jpeg"];

fn is_jpeg(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()),
        Some(ref e) if e == "jpg" || e == "jpeg"
    )
}

/// Load one frame from disk.
///
/// `.jpg`/`.jpeg` files become single-plane JPEG frames; anything else is
/// read as tightly packed I420 of the given size.
pub fn load_frame(path: &Path, width: usize, height: usize) -> Result<Frame> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read frame from {:?}", path))?;

    if is_jpeg(path) {
        let len = data.len();
        return Ok(Frame::new(
            FrameFormat::Jpeg,
            width,
            height,
            CropRect::full(width, height),
            vec![Plane::new(data, len, 1)],
        ));
    }

    i420_frame(data, width, height).with_context(|| format!("Invalid I420 frame {:?}", path))
}

/// Split a packed I420 buffer into Y, U and V planes
pub fn i420_frame(mut data: Vec<u8>, width: usize, height: usize) -> Result<Frame> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        bail!("I420 needs non-zero even dimensions, got {}x{}", width, height);
    }
    let luma_len = width * height;
    let chroma_len = luma_len / 4;
    let expected = luma_len + 2 * chroma_len;
    if data.len() != expected {
        bail!(
            "expected {} bytes for {}x{} I420, file has {}",
            expected,
            width,
            height,
            data.len()
        );
    }

    let v = data.split_off(luma_len + chroma_len);
    let u = data.split_off(luma_len);
    let y = data;

    Ok(Frame::new(
        FrameFormat::Yuv420,
        width,
        height,
        CropRect::full(width, height),
        vec![
            Plane::new(y, width, 1),
            Plane::new(u, width / 2, 1),
            Plane::new(v, width / 2, 1),
        ],
    ))
}

/// Frame files in a directory, sorted by name
pub fn list_frame_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        let known = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && known {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Generates a moving test pattern as YUV 4:2:0 frames
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    width: usize,
    height: usize,
    row_padding: usize,
    semi_planar: bool,
    crop: Option<CropRect>,
    sequence: u64,
}

impl SyntheticSource {
    /// `width` and `height` should be even, as for any 4:2:0 sensor mode
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            row_padding: 0,
            semi_planar: false,
            crop: None,
            sequence: 0,
        }
    }

    /// Extra bytes at the end of every luma row
    pub fn row_padding(mut self, bytes: usize) -> Self {
        self.row_padding = bytes;
        self
    }

    /// Store U and V interleaved in one buffer with pixel stride 2
    pub fn semi_planar(mut self, enabled: bool) -> Self {
        self.semi_planar = enabled;
        self
    }

    pub fn crop(mut self, crop: CropRect) -> Self {
        self.crop = Some(crop);
        self
    }

    fn luma(&self, x: usize, y: usize) -> u8 {
        let seq = self.sequence as usize;
        ((x * 255 / self.width.max(1) + y * 3 + seq * 4) % 256) as u8
    }

    fn chroma(&self, x: usize, y: usize) -> (u8, u8) {
        let u = (64 + x * 8) % 256;
        let v = (96 + y * 8) % 256;
        (u as u8, v as u8)
    }

    pub fn next_frame(&mut self) -> Frame {
        let (w, h) = (self.width, self.height);
        let (cw, ch) = (w / 2, h / 2);

        let y_stride = w + self.row_padding;
        let mut y_plane = vec![0u8; y_stride * h];
        for row in 0..h {
            for col in 0..w {
                y_plane[row * y_stride + col] = self.luma(col, row);
            }
        }

        let planes = if self.semi_planar {
            // One buffer, U V U V ...; the V plane starts one byte in
            let uv_stride = y_stride;
            let mut uv = vec![0u8; uv_stride * ch];
            for row in 0..ch {
                for col in 0..cw {
                    let (u, v) = self.chroma(col, row);
                    uv[row * uv_stride + col * 2] = u;
                    uv[row * uv_stride + col * 2 + 1] = v;
                }
            }
            let v_view = uv.get(1..).map(<[u8]>::to_vec).unwrap_or_default();
            vec![
                Plane::new(y_plane, y_stride, 1),
                Plane::new(uv, uv_stride, 2),
                Plane::new(v_view, uv_stride, 2),
            ]
        } else {
            let c_stride = cw + self.row_padding / 2;
            let mut u_plane = vec![0u8; c_stride * ch];
            let mut v_plane = vec![0u8; c_stride * ch];
            for row in 0..ch {
                for col in 0..cw {
                    let (u, v) = self.chroma(col, row);
                    u_plane[row * c_stride + col] = u;
                    v_plane[row * c_stride + col] = v;
                }
            }
            vec![
                Plane::new(y_plane, y_stride, 1),
                Plane::new(u_plane, c_stride, 1),
                Plane::new(v_plane, c_stride, 1),
            ]
        };

        let frame = Frame::new(
            FrameFormat::Yuv420,
            w,
            h,
            self.crop.unwrap_or(CropRect::full(w, h)),
            planes,
        )
        .with_sequence(self.sequence);

        self.sequence += 1;
        frame
    }
}
