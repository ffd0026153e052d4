//! Pixel channel order of host frames.
//!
//! The model consumes BGR planes. Host decoders hand out either RGB or BGR
//! interleaved pixels; the pipeline is told once which one it gets and the
//! kernels fold the swap into their channel indexing.

use serde::{Deserialize, Serialize};

/// Number of color channels in every frame and tile tensor.
pub const CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    #[default]
    Rgb,
    Bgr,
}

impl PixelLayout {
    /// Channel order produced by the platform's image decoders.
    pub fn native() -> Self {
        if cfg!(windows) {
            Self::Bgr
        } else {
            Self::Rgb
        }
    }

    /// Model plane index for a channel stored at `channel` in the frame.
    #[inline]
    pub fn model_channel(self, channel: usize) -> usize {
        match self {
            Self::Rgb => CHANNELS - 1 - channel,
            Self::Bgr => channel,
        }
    }

    /// Specialization constant handed to the kernels.
    pub fn specialization(self) -> u32 {
        match self {
            Self::Rgb => 0,
            Self::Bgr => 1,
        }
    }

    /// Convert interleaved RGB pixels into this layout.
    pub fn from_rgb(self, rgb: &[u8]) -> Vec<u8> {
        match self {
            Self::Rgb => rgb.to_vec(),
            Self::Bgr => swap_red_blue(rgb),
        }
    }

    /// Convert pixels stored in this layout back to interleaved RGB.
    pub fn to_rgb(self, pixels: &[u8]) -> Vec<u8> {
        match self {
            Self::Rgb => pixels.to_vec(),
            Self::Bgr => swap_red_blue(pixels),
        }
    }
}

impl std::fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rgb => write!(f, "rgb"),
            Self::Bgr => write!(f, "bgr"),
        }
    }
}

fn swap_red_blue(pixels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len());
    for px in pixels.chunks_exact(CHANNELS) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_frames_map_red_to_last_model_plane() {
        assert_eq!(PixelLayout::Rgb.model_channel(0), 2);
        assert_eq!(PixelLayout::Rgb.model_channel(1), 1);
        assert_eq!(PixelLayout::Rgb.model_channel(2), 0);
    }

    #[test]
    fn test_bgr_frames_map_identically() {
        for c in 0..CHANNELS {
            assert_eq!(PixelLayout::Bgr.model_channel(c), c);
        }
    }

    #[test]
    fn test_bgr_conversion_swaps_outer_channels() {
        let rgb = [10u8, 20, 30, 40, 50, 60];
        let bgr = PixelLayout::Bgr.from_rgb(&rgb);
        assert_eq!(bgr, vec![30, 20, 10, 60, 50, 40]);
        assert_eq!(PixelLayout::Bgr.to_rgb(&bgr), rgb.to_vec());
        assert_eq!(PixelLayout::Rgb.from_rgb(&rgb), rgb.to_vec());
    }

    #[test]
    fn test_layout_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&PixelLayout::Bgr).expect("layout should serialize");
        assert_eq!(json, "\"bgr\"");
        let parsed: PixelLayout = serde_json::from_str("\"rgb\"").expect("layout should parse");
        assert_eq!(parsed, PixelLayout::Rgb);
    }
}
