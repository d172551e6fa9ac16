//! NV21 to RGB raster decoding
//!
//! The remapper produces byte-exact NV21; this module turns it into an RGB
//! raster the rectifier can work on. The color matrix and quantization range
//! are configurable:
//! - BT.601 (camera JPEG / JFIF default)
//! - BT.709 (HD sources)
//! - BT.2020 (UHD sources)
//!
//! Optionally the raster is passed through a JPEG encode/decode round trip so
//! the output carries the same compression the camera's display path does.

use image::{ImageOutputFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

/// Color space standard for YCbCr to RGB conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    /// BT.601 - what camera JPEG encoders assume
    #[default]
    Bt601,
    /// BT.709 - High Definition
    Bt709,
    /// BT.2020 - Ultra High Definition (matrix only, no HDR tone mapping)
    Bt2020,
}

impl ColorSpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorSpace::Bt601 => "BT.601 (SD)",
            ColorSpace::Bt709 => "BT.709 (HD)",
            ColorSpace::Bt2020 => "BT.2020 (UHD)",
        }
    }
}

/// Quantization range of the incoming YCbCr values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationRange {
    /// Limited range: Y 16-235, CbCr 16-240
    Limited,
    /// Full range: Y 0-255, CbCr 0-255 (camera sensors, JPEG)
    #[default]
    Full,
}

/// Color conversion coefficients for YCbCr to RGB
#[derive(Debug, Clone, Copy)]
pub struct ColorMatrix {
    /// V (Cr) contribution to R
    pub kr: f32,
    /// U (Cb) and V (Cr) contribution to G
    pub kg_u: f32,
    pub kg_v: f32,
    /// U (Cb) contribution to B
    pub kb: f32,
}

impl ColorMatrix {
    pub const BT601: Self = Self {
        kr: 1.402,
        kg_u: 0.344136,
        kg_v: 0.714136,
        kb: 1.772,
    };

    pub const BT709: Self = Self {
        kr: 1.5748,
        kg_u: 0.1873,
        kg_v: 0.4681,
        kb: 1.8556,
    };

    pub const BT2020: Self = Self {
        kr: 1.4746,
        kg_u: 0.1646,
        kg_v: 0.5714,
        kb: 1.8814,
    };

    pub fn from_color_space(cs: ColorSpace) -> Self {
        match cs {
            ColorSpace::Bt601 => Self::BT601,
            ColorSpace::Bt709 => Self::BT709,
            ColorSpace::Bt2020 => Self::BT2020,
        }
    }

    /// Integer coefficients scaled by 256
    pub fn to_fixed_point(&self) -> FixedPointMatrix {
        FixedPointMatrix {
            kr: (self.kr * 256.0) as i32,
            kg_u: (self.kg_u * 256.0) as i32,
            kg_v: (self.kg_v * 256.0) as i32,
            kb: (self.kb * 256.0) as i32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedPointMatrix {
    pub kr: i32,
    pub kg_u: i32,
    pub kg_v: i32,
    pub kb: i32,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("NV21 buffer holds {available} bytes, {width}x{height} needs {required}")]
    BufferSize {
        width: u32,
        height: u32,
        required: usize,
        available: usize,
    },

    #[error("cannot decode a {width}x{height} image")]
    EmptyImage { width: u32, height: u32 },

    #[error("NV21 needs even dimensions, got {width}x{height}")]
    OddDimensions { width: u32, height: u32 },

    #[error("JPEG codec error: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Decoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default)]
    pub color_space: ColorSpace,

    #[serde(default)]
    pub range: QuantizationRange,

    /// Pass decoded frames through a JPEG encode/decode round trip
    #[serde(default = "default_jpeg_round_trip")]
    pub jpeg_round_trip: bool,

    /// Quality used for the round trip, 1-100
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_jpeg_round_trip() -> bool { true }
fn default_jpeg_quality() -> u8 { 100 }

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            color_space: ColorSpace::default(),
            range: QuantizationRange::default(),
            jpeg_round_trip: default_jpeg_round_trip(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Turns remapped NV21 (or camera JPEG) into RGB rasters
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    config: DecoderConfig,
    matrix: FixedPointMatrix,
}

impl FrameDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        let matrix = ColorMatrix::from_color_space(config.color_space).to_fixed_point();
        Self { config, matrix }
    }

    /// Decode an NV21 buffer into an RGB raster
    pub fn decode_nv21(&self, nv21: &[u8], width: u32, height: u32) -> Result<RgbImage, DecodeError> {
        let rgb = nv21_to_rgb(nv21, width, height, &self.matrix, self.config.range)?;
        if self.config.jpeg_round_trip {
            jpeg_round_trip(&rgb, self.config.jpeg_quality)
        } else {
            Ok(rgb)
        }
    }

    /// Decode a frame that arrived already JPEG-encoded
    pub fn decode_jpeg(&self, bytes: &[u8]) -> Result<RgbImage, DecodeError> {
        let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)?.to_rgb8();
        if img.width() == 0 || img.height() == 0 {
            return Err(DecodeError::EmptyImage {
                width: img.width(),
                height: img.height(),
            });
        }
        Ok(img)
    }
}

/// Convert NV21 to RGB using fixed-point arithmetic (no floating point)
pub fn nv21_to_rgb(
    nv21: &[u8],
    width: u32,
    height: u32,
    matrix: &FixedPointMatrix,
    range: QuantizationRange,
) -> Result<RgbImage, DecodeError> {
    if width == 0 || height == 0 {
        return Err(DecodeError::EmptyImage { width, height });
    }
    if width % 2 != 0 || height % 2 != 0 {
        return Err(DecodeError::OddDimensions { width, height });
    }

    let w = width as usize;
    let h = height as usize;
    let pixel_count = w * h;
    let required = pixel_count * 3 / 2;
    if nv21.len() < required {
        return Err(DecodeError::BufferSize {
            width,
            height,
            required,
            available: nv21.len(),
        });
    }

    // Limited range expands Y from 16-235 and CbCr from 16-240 to 0-255:
    // Y: (Y - 16) * 255 / 219 ~ (Y - 16) * 298 / 256
    // C: (C - 128) * 255 / 224 ~ (C - 128) * 291 / 256
    let (y_offset, y_scale, c_scale) = match range {
        QuantizationRange::Limited => (16i32, 298i32, 291i32),
        QuantizationRange::Full => (0i32, 256i32, 256i32),
    };

    let (luma, chroma) = nv21.split_at(pixel_count);
    let mut rgb = vec![0u8; pixel_count * 3];

    for (row, rgb_row) in rgb.chunks_exact_mut(w * 3).enumerate() {
        let luma_row = &luma[row * w..(row + 1) * w];
        // One chroma row (V U V U ...) serves two luma rows
        let chroma_row = &chroma[(row / 2) * w..];

        for (col, (&y_raw, px)) in luma_row.iter().zip(rgb_row.chunks_exact_mut(3)).enumerate() {
            let pair = (col / 2) * 2;
            let v_raw = chroma_row[pair] as i32;
            let u_raw = chroma_row[pair + 1] as i32;

            let y = ((y_raw as i32 - y_offset) * y_scale) >> 8;
            let u = ((u_raw - 128) * c_scale) >> 8;
            let v = ((v_raw - 128) * c_scale) >> 8;

            // R = Y + Kr * V
            // G = Y - Kg_u * U - Kg_v * V
            // B = Y + Kb * U
            px[0] = (y + ((matrix.kr * v) >> 8)).clamp(0, 255) as u8;
            px[1] = (y - ((matrix.kg_u * u + matrix.kg_v * v) >> 8)).clamp(0, 255) as u8;
            px[2] = (y + ((matrix.kb * u) >> 8)).clamp(0, 255) as u8;
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(DecodeError::BufferSize {
        width,
        height,
        required: pixel_count * 3,
        available: 0,
    })
}

/// Encode to JPEG and decode again
fn jpeg_round_trip(rgb: &RgbImage, quality: u8) -> Result<RgbImage, DecodeError> {
    let mut jpeg_data = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg_data);
    rgb.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality.clamp(1, 100)))?;

    let decoded = image::load_from_memory_with_format(&jpeg_data, image::ImageFormat::Jpeg)?;
    Ok(decoded.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_nv21(width: usize, height: usize) -> Vec<u8> {
        let mut nv21: Vec<u8> = (0..width * height).map(|i| (i * 7 % 256) as u8).collect();
        nv21.extend(std::iter::repeat(128u8).take(width * height / 2));
        nv21
    }

    fn raw_decoder() -> FrameDecoder {
        FrameDecoder::new(DecoderConfig {
            jpeg_round_trip: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_color_space_matrix() {
        let bt601 = ColorMatrix::BT601.to_fixed_point();
        let bt709 = ColorMatrix::BT709.to_fixed_point();
        assert_ne!(bt601.kr, bt709.kr);
        assert_ne!(bt601.kb, bt709.kb);
    }

    #[test]
    fn test_neutral_chroma_reproduces_luma_exactly() {
        let nv21 = gray_nv21(8, 4);
        let rgb = raw_decoder().decode_nv21(&nv21, 8, 4).unwrap();
        for (i, px) in rgb.pixels().enumerate() {
            assert_eq!(px.0, [nv21[i]; 3], "pixel {}", i);
        }
    }

    #[test]
    fn test_chroma_sign() {
        // Strong V (Cr) pushes red up, strong U (Cb) pushes blue up
        let mut nv21 = vec![128u8; 2 * 2];
        nv21.extend_from_slice(&[255, 128]);
        let rgb = raw_decoder().decode_nv21(&nv21, 2, 2).unwrap();
        let px = rgb.get_pixel(0, 0);
        assert!(px[0] > 200, "R should be high, got {}", px[0]);
        assert!(px[2] < 160, "B should stay near neutral, got {}", px[2]);

        let mut nv21 = vec![128u8; 2 * 2];
        nv21.extend_from_slice(&[128, 255]);
        let rgb = raw_decoder().decode_nv21(&nv21, 2, 2).unwrap();
        let px = rgb.get_pixel(1, 1);
        assert!(px[2] > 200, "B should be high, got {}", px[2]);
    }

    #[test]
    fn test_limited_range_black() {
        let nv21 = vec![16u8, 16, 16, 16, 128, 128];
        let matrix = ColorMatrix::BT709.to_fixed_point();
        let rgb = nv21_to_rgb(&nv21, 2, 2, &matrix, QuantizationRange::Limited).unwrap();
        for px in rgb.pixels() {
            assert!(px.0.iter().all(|&c| c < 10), "expected near black, got {:?}", px.0);
        }
    }

    #[test]
    fn test_short_buffer() {
        let nv21 = vec![0u8; 10];
        assert!(matches!(
            raw_decoder().decode_nv21(&nv21, 4, 4),
            Err(DecodeError::BufferSize { required: 24, available: 10, .. })
        ));
    }

    #[test]
    fn test_odd_dimensions() {
        let nv21 = vec![0u8; 64];
        assert!(matches!(
            raw_decoder().decode_nv21(&nv21, 3, 4),
            Err(DecodeError::OddDimensions { width: 3, height: 4 })
        ));
    }

    #[test]
    fn test_jpeg_round_trip_within_tolerance() {
        let decoder = FrameDecoder::new(DecoderConfig::default());
        let nv21 = vec![128u8; 16 * 16 * 3 / 2];
        let rgb = decoder.decode_nv21(&nv21, 16, 16).unwrap();
        assert_eq!(rgb.dimensions(), (16, 16));
        for px in rgb.pixels() {
            for &c in px.0.iter() {
                assert!((c as i32 - 128).abs() <= 2, "expected mid-gray, got {}", c);
            }
        }
    }

    #[test]
    fn test_decode_jpeg_frame() {
        let src = RgbImage::from_pixel(8, 6, image::Rgb([40, 120, 200]));
        let mut bytes = Vec::new();
        src.write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Jpeg(95))
            .unwrap();

        let decoded = raw_decoder().decode_jpeg(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (8, 6));
    }

    #[test]
    fn test_decode_garbage_jpeg() {
        assert!(matches!(
            raw_decoder().decode_jpeg(&[0, 1, 2, 3]),
            Err(DecodeError::Jpeg(_))
        ));
    }

    /// BT.601 full-range RGB -> YCbCr
    fn to_ycbcr(px: [u8; 3]) -> [f64; 3] {
        let [r, g, b] = px.map(f64::from);
        [
            0.299 * r + 0.587 * g + 0.114 * b,
            128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b,
            128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b,
        ]
    }

    /// Y, Cb, Cr the NV21 buffer holds for pixel (x, y)
    fn expected_ycbcr(nv21: &[u8], width: usize, height: usize, x: usize, y: usize) -> [f64; 3] {
        let chroma = width * height + (y / 2) * width + (x / 2) * 2;
        [nv21[y * width + x] as f64, nv21[chroma + 1] as f64, nv21[chroma] as f64]
    }

    #[test]
    fn test_remapped_strided_frame_round_trips() {
        use crate::remap::yuv420_to_nv21;
        use crate::source::SyntheticSource;

        let (w, h) = (32usize, 16usize);
        let planar = SyntheticSource::new(w, h).next_frame();
        let strided = SyntheticSource::new(w, h).semi_planar(true).row_padding(8).next_frame();

        let nv21 = yuv420_to_nv21(&strided).unwrap();
        // Luma comes through the remap untouched
        assert_eq!(&nv21[..w * h], &planar.planes[0].data[..]);

        let raw = raw_decoder().decode_nv21(&nv21, w as u32, h as u32).unwrap();
        let round_tripped = FrameDecoder::new(DecoderConfig::default())
            .decode_nv21(&nv21, w as u32, h as u32)
            .unwrap();

        // Only pixels where no channel clipped can be inverted
        let mut count = 0usize;
        let mut jpeg_err = [0.0f64; 3];
        for y in 0..h {
            for x in 0..w {
                let px = raw.get_pixel(x as u32, y as u32).0;
                if px.iter().any(|&c| c == 0 || c == 255) {
                    continue;
                }
                count += 1;
                let expected = expected_ycbcr(&nv21, w, h, x, y);

                let got = to_ycbcr(px);
                assert!((got[0] - expected[0]).abs() <= 2.0, "Y at ({}, {}): {:?} vs {:?}", x, y, got, expected);
                assert!((got[1] - expected[1]).abs() <= 3.0, "Cb at ({}, {}): {:?} vs {:?}", x, y, got, expected);
                assert!((got[2] - expected[2]).abs() <= 3.0, "Cr at ({}, {}): {:?} vs {:?}", x, y, got, expected);

                let got = to_ycbcr(round_tripped.get_pixel(x as u32, y as u32).0);
                for c in 0..3 {
                    jpeg_err[c] += (got[c] - expected[c]).abs();
                }
            }
        }
        assert!(count >= 64, "too few unclipped pixels: {}", count);

        let mean = jpeg_err.map(|e| e / count as f64);
        assert!(mean[0] <= 3.0, "mean Y error after JPEG {:?}", mean);
        assert!(mean[1] <= 4.0 && mean[2] <= 4.0, "mean chroma error after JPEG {:?}", mean);
    }
}
