//! Per-channel color statistics used to re-center tiles around zero.

use serde::{Deserialize, Serialize};

use crate::layout::CHANNELS;
use crate::types::Frame;

/// Whether tiles are mean-centered before inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Normalization {
    /// `sample / 255 - mean`, mean added back after inference.
    #[default]
    #[serde(rename = "mean")]
    MeanCentered,
    /// `sample / 255`, no bias.
    #[serde(rename = "raw")]
    Raw,
}

impl Normalization {
    pub fn is_centered(self) -> bool {
        matches!(self, Self::MeanCentered)
    }
}

/// Mean intensity of each channel in [0, 1], in the frame's channel order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ColorStats {
    pub mean: [f32; CHANNELS],
}

impl ColorStats {
    pub const fn zero() -> Self {
        Self {
            mean: [0.0; CHANNELS],
        }
    }

    /// Element-wise average of two frames' statistics.
    pub fn blend(&self, other: &ColorStats) -> ColorStats {
        let mut mean = [0.0f32; CHANNELS];
        for (c, m) in mean.iter_mut().enumerate() {
            *m = (self.mean[c] + other.mean[c]) * 0.5;
        }
        ColorStats { mean }
    }
}

/// Arithmetic mean of every channel over all pixels.
pub fn mean(frame: &Frame) -> ColorStats {
    let mut sums = [0u64; CHANNELS];
    for px in frame.data().chunks_exact(CHANNELS) {
        for (sum, &v) in sums.iter_mut().zip(px) {
            *sum += v as u64;
        }
    }

    let count = frame.width() as f64 * frame.height() as f64;
    let mut mean = [0.0f32; CHANNELS];
    for (m, sum) in mean.iter_mut().zip(sums) {
        // Divide in f32 so a uniform frame yields exactly `value / 255`.
        *m = (sum as f64 / count) as f32 / 255.0;
    }
    ColorStats { mean }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PixelLayout;

    #[test]
    fn test_uniform_frame_mean_is_exact() {
        for pixel in [[0u8, 0, 0], [255, 255, 255], [12, 200, 77], [1, 128, 254]] {
            let frame = Frame::filled(37, 19, PixelLayout::Rgb, pixel);
            let stats = mean(&frame);
            assert_eq!(
                stats.mean,
                [
                    pixel[0] as f32 / 255.0,
                    pixel[1] as f32 / 255.0,
                    pixel[2] as f32 / 255.0
                ]
            );
        }
    }

    #[test]
    fn test_mean_averages_mixed_pixels() {
        let data = vec![0, 0, 0, 255, 255, 255];
        let frame = Frame::new(2, 1, PixelLayout::Rgb, data).expect("valid frame");
        let stats = mean(&frame);
        for m in stats.mean {
            assert!((m - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blend_is_elementwise_average() {
        let a = ColorStats {
            mean: [0.2, 0.4, 0.6],
        };
        let b = ColorStats {
            mean: [0.4, 0.4, 0.0],
        };
        let blended = a.blend(&b);
        assert!((blended.mean[0] - 0.3).abs() < 1e-6);
        assert!((blended.mean[1] - 0.4).abs() < 1e-6);
        assert!((blended.mean[2] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_normalization_serde_names() {
        let parsed: Normalization = serde_json::from_str("\"raw\"").expect("parse raw");
        assert_eq!(parsed, Normalization::Raw);
        assert_eq!(
            serde_json::to_string(&Normalization::MeanCentered).expect("serialize"),
            "\"mean\""
        );
    }
}
