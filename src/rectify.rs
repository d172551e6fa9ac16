//! Perspective (keystone) rectification
//!
//! Four anchor points, calibrated against a nominal 1200x1600 capture, are
//! scaled to the actual frame size and mapped onto the corners of an upright
//! rectangle with the target aspect ratio. The image is then resampled
//! through the inverse homography.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use image::RgbImage;

#[derive(Debug, Error, PartialEq)]
pub enum RectifyError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

fn invalid(reason: impl Into<String>) -> RectifyError {
    RectifyError::InvalidGeometry(reason.into())
}

/// A point in calibration coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Width:height ratio of the rectified output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Bilinear,
    Nearest,
}

/// Pixel format of the rectified raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 5-6-5 bit precision, as shown on the device display
    #[default]
    Rgb565,
    Rgb888,
}

/// Geometry policy for the rectifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RectifierConfig {
    /// Resolution the anchors were calibrated against
    pub calibration_width: f64,
    pub calibration_height: f64,

    /// Source anchors in calibration order: bottom-right, bottom-left,
    /// top-left, top-right. They are matched index for index against the
    /// destination corners (top-left, top-right, bottom-right, bottom-left).
    pub anchors: [Point; 4],

    pub target_aspect: AspectRatio,

    pub output_format: OutputFormat,

    pub interpolation: Interpolation,
}

impl Default for RectifierConfig {
    fn default() -> Self {
        Self {
            calibration_width: 1200.0,
            calibration_height: 1600.0,
            anchors: [
                Point::new(1100.0, 1400.0),
                Point::new(50.0, 1400.0),
                Point::new(300.0, 200.0),
                Point::new(850.0, 200.0),
            ],
            target_aspect: AspectRatio::new(4, 3),
            output_format: OutputFormat::default(),
            interpolation: Interpolation::default(),
        }
    }
}

impl RectifierConfig {
    /// Anchors scaled from calibration resolution to `width` x `height`
    pub fn source_quad(&self, width: u32, height: u32) -> [(f64, f64); 4] {
        let ratio_w = width as f64 / self.calibration_width;
        let ratio_h = height as f64 / self.calibration_height;
        self.anchors.map(|p| (p.x * ratio_w, p.y * ratio_h))
    }

    fn validate(&self) -> Result<(), RectifyError> {
        if !(self.calibration_width > 0.0 && self.calibration_height > 0.0) {
            return Err(invalid(format!(
                "calibration resolution {}x{} must be positive",
                self.calibration_width, self.calibration_height
            )));
        }
        if self.target_aspect.width == 0 || self.target_aspect.height == 0 {
            return Err(invalid(format!(
                "target aspect {}:{} has a zero term",
                self.target_aspect.width, self.target_aspect.height
            )));
        }
        if self.anchors.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(invalid("anchor coordinates must be finite"));
        }
        Ok(())
    }
}

/// Best-fit output rectangle with the target aspect ratio.
///
/// A frame wider than the target keeps its width, otherwise it keeps its
/// height. The other side is truncated to a whole pixel.
pub fn output_size(width: u32, height: u32, aspect: AspectRatio) -> Result<(u32, u32), RectifyError> {
    if width == 0 || height == 0 {
        return Err(invalid(format!("input is {}x{}", width, height)));
    }
    if aspect.width == 0 || aspect.height == 0 {
        return Err(invalid(format!("aspect {}:{}", aspect.width, aspect.height)));
    }

    let (w, h) = (width as u64, height as u64);
    let (aw, ah) = (aspect.width as u64, aspect.height as u64);

    // w/h > aw/ah, kept in integers so an exact match takes the else branch
    let (out_w, out_h) = if w * ah > h * aw {
        (w, w * ah / aw)
    } else {
        (h * aw / ah, h)
    };

    if out_w == 0 || out_h == 0 || out_w > u32::MAX as u64 || out_h > u32::MAX as u64 {
        return Err(invalid(format!("output size {}x{} out of range", out_w, out_h)));
    }
    Ok((out_w as u32, out_h as u32))
}

/// Output rectangle corners: top-left, top-right, bottom-right, bottom-left
pub fn destination_quad(width: u32, height: u32) -> [(f64, f64); 4] {
    let (w, h) = (width as f64, height as f64);
    [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)]
}

/// Perspective transformation matrix (3x3 homography)
#[derive(Debug, Clone)]
pub struct PerspectiveTransform {
    matrix: Matrix3<f64>,
    /// Used for inverse warping
    inverse: Matrix3<f64>,
}

impl PerspectiveTransform {
    /// Exact homography taking each `src[i]` to `dst[i]`
    pub fn compute(src: [(f64, f64); 4], dst: [(f64, f64); 4]) -> Result<Self, RectifyError> {
        check_quad(&src, "source")?;
        check_quad(&dst, "destination")?;

        let matrix = compute_homography(&src, &dst)?;
        let inverse = matrix
            .try_inverse()
            .ok_or_else(|| invalid("homography is not invertible"))?;

        Ok(Self { matrix, inverse })
    }

    /// Row-major matrix entries, normalised so the last one is 1
    pub fn matrix(&self) -> [[f64; 3]; 3] {
        let m = &self.matrix;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }

    #[inline]
    pub fn transform_point(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        apply_homography(&self.matrix, x, y)
    }

    #[inline]
    pub fn inverse_transform_point(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        apply_homography(&self.inverse, x, y)
    }

    /// Resample `src` into a `width` x `height` raster by inverse mapping
    /// every output pixel. Pixels mapping outside `src` are black.
    pub fn warp_rgb(&self, src: &RgbImage, width: u32, height: u32, interpolation: Interpolation) -> RgbImage {
        let mut out = RgbImage::new(width, height);
        if width == 0 || height == 0 {
            return out;
        }
        let stride = width as usize * 3;
        let buf: &mut [u8] = &mut out;

        buf.par_chunks_mut(stride).enumerate().for_each(|(dst_y, row)| {
            for (dst_x, px) in row.chunks_exact_mut(3).enumerate() {
                let Some((sx, sy)) = self.inverse_transform_point(dst_x as f64, dst_y as f64) else {
                    continue;
                };
                let pixel = match interpolation {
                    Interpolation::Bilinear => bilinear_sample(src, sx, sy),
                    Interpolation::Nearest => nearest_sample(src, sx, sy),
                };
                px.copy_from_slice(&pixel);
            }
        });

        out
    }
}

/// Reject quads with three collinear (or coincident) points
fn check_quad(quad: &[(f64, f64); 4], which: &str) -> Result<(), RectifyError> {
    if quad.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(invalid(format!("{} quad has non-finite points", which)));
    }
    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    for [a, b, c] in TRIPLES {
        let (ax, ay) = quad[a];
        let (bx, by) = quad[b];
        let (cx, cy) = quad[c];
        let cross = (bx - ax) * (cy - ay) - (by - ay) * (cx - ax);
        if cross.abs() < 1e-9 {
            return Err(invalid(format!(
                "{} points {}, {} and {} are collinear",
                which, a, b, c
            )));
        }
    }
    Ok(())
}

/// Solve the 8 unknowns of a homography (h33 fixed to 1) from 4 correspondences.
///
/// Each (x, y) -> (x', y') contributes two rows:
///   x*h11 + y*h12 + h13 - x'*x*h31 - x'*y*h32 = x'
///   x*h21 + y*h22 + h23 - y'*x*h31 - y'*y*h32 = y'
fn compute_homography(src: &[(f64, f64); 4], dst: &[(f64, f64); 4]) -> Result<Matrix3<f64>, RectifyError> {
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for (i, (&(x, y), &(xp, yp))) in src.iter().zip(dst.iter()).enumerate() {
        let r = i * 2;

        a[(r, 0)] = x;
        a[(r, 1)] = y;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -xp * x;
        a[(r, 7)] = -xp * y;
        b[r] = xp;

        a[(r + 1, 3)] = x;
        a[(r + 1, 4)] = y;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -yp * x;
        a[(r + 1, 7)] = -yp * y;
        b[r + 1] = yp;
    }

    let h = a
        .lu()
        .solve(&b)
        .ok_or_else(|| invalid("point correspondences are degenerate"))?;
    if h.iter().any(|v| !v.is_finite()) {
        return Err(invalid("homography has non-finite entries"));
    }

    Ok(Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0))
}

#[inline]
fn apply_homography(h: &Matrix3<f64>, x: f64, y: f64) -> Option<(f64, f64)> {
    let p = h * Vector3::new(x, y, 1.0);
    if p.z.abs() < 1e-10 {
        return None;
    }
    Some((p.x / p.z, p.y / p.z))
}

#[inline]
fn pixel_or_black(src: &RgbImage, x: i64, y: i64) -> [f64; 3] {
    if x < 0 || y < 0 || x >= src.width() as i64 || y >= src.height() as i64 {
        return [0.0; 3];
    }
    let p = src.get_pixel(x as u32, y as u32);
    [p[0] as f64, p[1] as f64, p[2] as f64]
}

#[inline]
fn bilinear_sample(src: &RgbImage, x: f64, y: f64) -> [u8; 3] {
    if x < -1.0 || y < -1.0 || x > src.width() as f64 || y > src.height() as f64 {
        return [0; 3];
    }

    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = pixel_or_black(src, x0, y0);
    let p10 = pixel_or_black(src, x0 + 1, y0);
    let p01 = pixel_or_black(src, x0, y0 + 1);
    let p11 = pixel_or_black(src, x0 + 1, y0 + 1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let value = p00[c] * (1.0 - fx) * (1.0 - fy)
            + p10[c] * fx * (1.0 - fy)
            + p01[c] * (1.0 - fx) * fy
            + p11[c] * fx * fy;
        result[c] = value.round().clamp(0.0, 255.0) as u8;
    }
    result
}

#[inline]
fn nearest_sample(src: &RgbImage, x: f64, y: f64) -> [u8; 3] {
    let p = pixel_or_black(src, x.round() as i64, y.round() as i64);
    [p[0] as u8, p[1] as u8, p[2] as u8]
}

/// Drop each channel to 5-6-5 bit precision, replicating the high bits
pub fn quantize_rgb565(img: &mut RgbImage) {
    for px in img.pixels_mut() {
        px[0] = (px[0] & 0xF8) | (px[0] >> 5);
        px[1] = (px[1] & 0xFC) | (px[1] >> 6);
        px[2] = (px[2] & 0xF8) | (px[2] >> 5);
    }
}

/// Everything derived for one input size
#[derive(Debug, Clone)]
pub struct RectifyPlan {
    pub source: [(f64, f64); 4],
    pub destination: [(f64, f64); 4],
    pub width: u32,
    pub height: u32,
    pub transform: PerspectiveTransform,
}

/// Applies the configured keystone correction to decoded frames
#[derive(Debug, Clone)]
pub struct Rectifier {
    config: RectifierConfig,
}

impl Rectifier {
    pub fn new(config: RectifierConfig) -> Result<Self, RectifyError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Source/destination quads, output size and transform for an input size
    pub fn plan(&self, width: u32, height: u32) -> Result<RectifyPlan, RectifyError> {
        let (out_w, out_h) = output_size(width, height, self.config.target_aspect)?;
        let source = self.config.source_quad(width, height);
        let destination = destination_quad(out_w, out_h);
        let transform = PerspectiveTransform::compute(source, destination)?;

        Ok(RectifyPlan {
            source,
            destination,
            width: out_w,
            height: out_h,
            transform,
        })
    }

    /// Rectify `input` into a new raster; `input` is not modified
    pub fn rectify(&self, input: &RgbImage) -> Result<RgbImage, RectifyError> {
        let plan = self.plan(input.width(), input.height())?;
        let mut out = plan
            .transform
            .warp_rgb(input, plan.width, plan.height, self.config.interpolation);

        if self.config.output_format == OutputFormat::Rgb565 {
            quantize_rgb565(&mut out);
        }
        Ok(out)
    }
}
