//! Tile grid planning.
//!
//! Frames are padded up to the model alignment, cut into `tile_size` squares
//! in raster order, and every tile reads `overlap` extra pixels of context on
//! each side. Context that would fall outside the padded frame is clipped and
//! the clipped amount is recorded per side so the kernels know where the core
//! region starts inside each model tile.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::types::Rect;

/// Spatial alignment the model requires of its input tensors.
pub const DEFAULT_ALIGNMENT: u32 = 32;

/// Rough activation footprint of the model per input pixel.
pub const DEFAULT_BYTES_PER_PIXEL: u64 = 1536;

/// Resolved tiling parameters for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileSpec {
    /// `None` disables tiling: the whole padded frame is one tile.
    pub tile_size: Option<u32>,
    pub overlap: u32,
    pub alignment: u32,
}

impl TileSpec {
    pub const UNTILED: TileSpec = TileSpec {
        tile_size: None,
        overlap: 0,
        alignment: DEFAULT_ALIGNMENT,
    };
    pub const SMALL: TileSpec = TileSpec {
        tile_size: Some(256),
        overlap: 32,
        alignment: DEFAULT_ALIGNMENT,
    };
    pub const LARGE: TileSpec = TileSpec {
        tile_size: Some(512),
        overlap: 64,
        alignment: DEFAULT_ALIGNMENT,
    };

    pub fn fixed(tile_size: u32, overlap: u32) -> Self {
        Self {
            tile_size: Some(tile_size),
            overlap,
            alignment: DEFAULT_ALIGNMENT,
        }
    }

    pub fn with_alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment;
        self
    }

    /// Same spec with tile size and overlap rounded up to `alignment`.
    pub fn aligned_to(self, alignment: u32) -> Self {
        if alignment == 0 {
            return self.with_alignment(alignment);
        }
        Self {
            tile_size: self.tile_size.map(|t| align_up(t, alignment)),
            overlap: align_up(self.overlap, alignment),
            alignment,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.alignment == 0 {
            return Err(PipelineError::config("alignment must be at least 1"));
        }
        if let Some(tile) = self.tile_size {
            if tile == 0 || tile % self.alignment != 0 {
                return Err(PipelineError::config(format!(
                    "tile size {tile} must be a positive multiple of {}",
                    self.alignment
                )));
            }
            if self.overlap % self.alignment != 0 {
                return Err(PipelineError::config(format!(
                    "overlap {} must be a multiple of {}",
                    self.overlap, self.alignment
                )));
            }
        }
        Ok(())
    }

    /// Largest model input (width, height) these parameters produce on a padded frame.
    fn peak_tile_extent(&self, padded_w: u32, padded_h: u32) -> (u64, u64) {
        match self.tile_size {
            None => (padded_w as u64, padded_h as u64),
            Some(tile) => {
                let span = tile as u64 + 2 * self.overlap as u64;
                (span.min(padded_w as u64), span.min(padded_h as u64))
            }
        }
    }
}

/// How tiling is configured at deployment time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TilingMode {
    None,
    #[default]
    Fixed,
    Auto,
}

/// Picks the [`TileSpec`] for a frame, consulting the device heap budget in
/// [`TilingMode::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePolicy {
    pub mode: TilingMode,
    pub fixed: TileSpec,
    pub bytes_per_pixel: u64,
}

impl Default for TilePolicy {
    fn default() -> Self {
        Self {
            mode: TilingMode::Fixed,
            fixed: TileSpec::SMALL,
            bytes_per_pixel: DEFAULT_BYTES_PER_PIXEL,
        }
    }
}

impl TilePolicy {
    pub fn untiled() -> Self {
        Self {
            mode: TilingMode::None,
            ..Self::default()
        }
    }

    pub fn fixed(spec: TileSpec) -> Self {
        Self {
            mode: TilingMode::Fixed,
            fixed: spec,
            ..Self::default()
        }
    }

    pub fn auto(bytes_per_pixel: u64) -> Self {
        Self {
            mode: TilingMode::Auto,
            bytes_per_pixel,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.fixed.validate()?;
        if self.mode == TilingMode::Auto {
            for candidate in self.auto_candidates() {
                candidate.validate()?;
            }
        }
        Ok(())
    }

    /// Automatic choices in order of preference; the last one is the fallback.
    fn auto_candidates(&self) -> [TileSpec; 3] {
        let alignment = self.fixed.alignment;
        [
            TileSpec::UNTILED.with_alignment(alignment),
            TileSpec::LARGE.aligned_to(alignment),
            TileSpec::SMALL.aligned_to(alignment),
        ]
    }

    pub fn resolve(&self, width: u32, height: u32, heap_budget: Option<u64>) -> TileSpec {
        let alignment = self.fixed.alignment;
        match self.mode {
            TilingMode::None => TileSpec::UNTILED.with_alignment(alignment),
            TilingMode::Fixed => self.fixed,
            TilingMode::Auto => {
                let padded_w = align_up(width, alignment);
                let padded_h = align_up(height, alignment);
                let candidates = self.auto_candidates();
                let fallback = candidates[candidates.len() - 1];
                let Some(budget) = heap_budget else {
                    return fallback;
                };

                let chosen = candidates
                    .into_iter()
                    .find(|spec| {
                        let (tw, th) = spec.peak_tile_extent(padded_w, padded_h);
                        tw * th * self.bytes_per_pixel <= budget
                    })
                    .unwrap_or(fallback);

                debug!(
                    width,
                    height,
                    heap_budget = budget,
                    tile_size = ?chosen.tile_size,
                    overlap = chosen.overlap,
                    "Resolved automatic tiling"
                );
                chosen
            }
        }
    }
}

/// Part of the nominal overlap that fell outside the padded frame, per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EdgeClamp {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileDescriptor {
    pub xi: u32,
    pub yi: u32,
    /// Output pixels this tile owns; never overlaps a neighbour.
    pub core: Rect,
    /// Model input region, clipped to the padded frame.
    pub padded: Rect,
    pub clamp: EdgeClamp,
    pub overlap: u32,
}

impl TileDescriptor {
    /// Column of `core.x0` inside the model tile.
    pub fn crop_left(&self) -> u32 {
        self.overlap - self.clamp.left
    }

    /// Row of `core.y0` inside the model tile.
    pub fn crop_top(&self) -> u32 {
        self.overlap - self.clamp.top
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileGrid {
    pub width: u32,
    pub height: u32,
    pub padded_width: u32,
    pub padded_height: u32,
    pub xtiles: u32,
    pub ytiles: u32,
    pub spec: TileSpec,
    /// Raster order: `yi` outer, `xi` inner.
    pub tiles: Vec<TileDescriptor>,
}

impl TileGrid {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Tiles grouped by grid row.
    pub fn rows(&self) -> std::slice::Chunks<'_, TileDescriptor> {
        self.tiles.chunks(self.xtiles as usize)
    }

    pub fn frame_rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    pub fn padded_rect(&self) -> Rect {
        Rect::new(0, 0, self.padded_width, self.padded_height)
    }
}

pub fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Compute the tile grid for a `width × height` frame.
pub fn plan(width: u32, height: u32, spec: &TileSpec) -> Result<TileGrid> {
    if width == 0 || height == 0 {
        return Err(PipelineError::EmptyFrame { width, height });
    }
    spec.validate()?;

    let padded_width = align_up(width, spec.alignment);
    let padded_height = align_up(height, spec.alignment);

    let Some(tile_size) = spec.tile_size else {
        return Ok(TileGrid {
            width,
            height,
            padded_width,
            padded_height,
            xtiles: 1,
            ytiles: 1,
            spec: TileSpec { overlap: 0, ..*spec },
            tiles: vec![TileDescriptor {
                xi: 0,
                yi: 0,
                core: Rect::new(0, 0, width, height),
                padded: Rect::new(0, 0, padded_width, padded_height),
                clamp: EdgeClamp::default(),
                overlap: 0,
            }],
        });
    };

    let xtiles = padded_width.div_ceil(tile_size);
    let ytiles = padded_height.div_ceil(tile_size);
    let overlap = spec.overlap;

    let mut tiles = Vec::with_capacity(xtiles as usize * ytiles as usize);
    for yi in 0..ytiles {
        let y0 = yi * tile_size;
        let y1 = ((yi + 1) * tile_size).min(height);
        let y1_padded = ((yi + 1) * tile_size).min(padded_height);
        let (py0, top) = extend_low(y0, overlap);
        let (py1, bottom) = extend_high(y1_padded, overlap, padded_height);

        for xi in 0..xtiles {
            let x0 = xi * tile_size;
            let x1 = ((xi + 1) * tile_size).min(width);
            let x1_padded = ((xi + 1) * tile_size).min(padded_width);
            let (px0, left) = extend_low(x0, overlap);
            let (px1, right) = extend_high(x1_padded, overlap, padded_width);

            tiles.push(TileDescriptor {
                xi,
                yi,
                core: Rect::new(x0, y0, x1, y1),
                padded: Rect::new(px0, py0, px1, py1),
                clamp: EdgeClamp {
                    left,
                    top,
                    right,
                    bottom,
                },
                overlap,
            });
        }
    }

    debug!(
        width,
        height,
        padded_width,
        padded_height,
        xtiles,
        ytiles,
        tile_size,
        overlap,
        "Planned tile grid"
    );

    Ok(TileGrid {
        width,
        height,
        padded_width,
        padded_height,
        xtiles,
        ytiles,
        spec: *spec,
        tiles,
    })
}

/// Move `edge` down by `overlap`, stopping at zero. Returns the new edge and
/// how much of the overlap was cut off.
fn extend_low(edge: u32, overlap: u32) -> (u32, u32) {
    let clamp = overlap.saturating_sub(edge);
    (edge + clamp - overlap, clamp)
}

fn extend_high(edge: u32, overlap: u32, limit: u32) -> (u32, u32) {
    let clamp = overlap.saturating_sub(limit - edge);
    (edge + overlap - clamp, clamp)
}
