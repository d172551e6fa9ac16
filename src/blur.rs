//! Gaussian blur shown next to the rectified image

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Largest radius accepted, same ceiling as the platform blur intrinsic
pub const MAX_RADIUS: f32 = 25.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlurConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Blur radius in pixels, clamped to (0, 25]
    #[serde(default = "default_radius")]
    pub radius: f32,
}

fn default_enabled() -> bool { true }
fn default_radius() -> f32 { MAX_RADIUS }

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            radius: default_radius(),
        }
    }
}

impl BlurConfig {
    /// Gaussian sigma for the configured radius
    pub fn sigma(&self) -> f32 {
        let radius = self.radius.clamp(f32::EPSILON, MAX_RADIUS);
        0.4 * radius + 0.6
    }
}

/// Blur a copy of `image`, or return `None` when blurring is disabled
pub fn blur(image: &RgbImage, config: &BlurConfig) -> Option<RgbImage> {
    if !config.enabled || image.width() == 0 || image.height() == 0 {
        return None;
    }
    Some(imageproc::filter::gaussian_blur_f32(image, config.sigma()))
}
