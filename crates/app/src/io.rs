//! Image file adapter. Channel order is converted here, once per frame.

use std::path::Path;

use anyhow::{Context, Result};
use image::RgbImage;

use tilerp_core::{Frame, PixelLayout};

pub fn load_frame(path: &Path, layout: PixelLayout) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode image: {}", path.display()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    let pixels = layout.from_rgb(image.as_raw());
    Frame::new(width, height, layout, pixels)
        .with_context(|| format!("unusable image: {}", path.display()))
}

pub fn save_frame(frame: &Frame, path: &Path) -> Result<()> {
    let rgb = frame.layout().to_rgb(frame.data());
    let image = RgbImage::from_raw(frame.width(), frame.height(), rgb)
        .context("frame buffer does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("failed to write image: {}", path.display()))
}
