//! Tile planning over the 32-aligned working grid.
//!
//! Output regions of a plan partition the padded image exactly once. Every
//! tile reads an input window of the same size (edge plus prepadding on each
//! side), so sub-networks see identical shapes regardless of tile position.

use ndarray::s;

use crate::error::{InterpolationError, Result};
use crate::tensor::{Shape, Tensor};

pub const PAD_ALIGN: usize = 32;
pub const MIN_TILE_SIZE: usize = 128;
pub const PREPADDING_ALIGN: usize = 16;

pub fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - dim % PAD_ALIGN) % PAD_ALIGN
}

pub fn padded_extent(dim: usize) -> usize {
    dim + pad_amount(dim)
}

/// `0` disables tiling; anything else must be at least 128 and 32-aligned.
pub fn validate_tile_size(tile_size: usize) -> Result<()> {
    if tile_size == 0 {
        return Ok(());
    }
    if tile_size < MIN_TILE_SIZE || tile_size % PAD_ALIGN != 0 {
        return Err(InterpolationError::config(format!(
            "tile size {tile_size} must be 0 or >= {MIN_TILE_SIZE} and a multiple of {PAD_ALIGN}"
        )));
    }
    Ok(())
}

/// Keeps `edge + 2 * prepadding` on the 32-pixel grid.
pub fn validate_prepadding(prepadding: usize) -> Result<()> {
    if prepadding % PREPADDING_ALIGN != 0 {
        return Err(InterpolationError::config(format!(
            "prepadding {prepadding} must be a multiple of {PREPADDING_ALIGN}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub index: usize,
    /// Output origin in padded-image coordinates.
    pub x: usize,
    pub y: usize,
    /// Output extent owned by this tile.
    pub width: usize,
    pub height: usize,
    /// Input window extent, shared by every tile of a plan.
    pub input_width: usize,
    pub input_height: usize,
    pub prepadding: usize,
}

impl Tile {
    /// Top-left of the input window; negative inside the leading border.
    pub fn input_origin(&self) -> (isize, isize) {
        (
            self.x as isize - self.prepadding as isize,
            self.y as isize - self.prepadding as isize,
        )
    }

    pub fn input_shape(&self, channels: usize) -> Shape {
        Shape::new(self.input_width, self.input_height, channels)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    pub width: usize,
    pub height: usize,
    pub padded_width: usize,
    pub padded_height: usize,
    pub columns: usize,
    pub rows: usize,
    pub tiles: Vec<Tile>,
}

impl TilePlan {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn is_tiled(&self) -> bool {
        self.tiles.len() > 1
    }
}

pub fn plan_tiles(
    width: usize,
    height: usize,
    tile_size: usize,
    prepadding: usize,
) -> Result<TilePlan> {
    validate_tile_size(tile_size)?;
    validate_prepadding(prepadding)?;
    if width == 0 || height == 0 {
        return Err(InterpolationError::shape(
            "tile plan",
            "non-empty image",
            format!("{width}x{height}"),
        ));
    }

    let padded_width = padded_extent(width);
    let padded_height = padded_extent(height);
    let (edge_x, edge_y) = if tile_size == 0 {
        (padded_width, padded_height)
    } else {
        (tile_size.min(padded_width), tile_size.min(padded_height))
    };

    let columns = padded_width.div_ceil(edge_x);
    let rows = padded_height.div_ceil(edge_y);
    let mut tiles = Vec::with_capacity(columns * rows);

    for row in 0..rows {
        let y = row * edge_y;
        for column in 0..columns {
            let x = column * edge_x;
            tiles.push(Tile {
                index: tiles.len(),
                x,
                y,
                width: edge_x.min(padded_width - x),
                height: edge_y.min(padded_height - y),
                input_width: edge_x + 2 * prepadding,
                input_height: edge_y + 2 * prepadding,
                prepadding,
            });
        }
    }

    Ok(TilePlan {
        width,
        height,
        padded_width,
        padded_height,
        columns,
        rows,
        tiles,
    })
}

/// Extract a tile's input window from `image`.
///
/// Samples outside the original image extent are zero, including the
/// alignment padding and the prepadding border.
pub fn inject_border(image: &Tensor, tile: &Tile) -> Tensor {
    let mut window = Tensor::zeros(tile.input_shape(image.channels()));
    let (ox, oy) = tile.input_origin();

    let x0 = ox.max(0) as usize;
    let y0 = oy.max(0) as usize;
    let x1 = (ox + tile.input_width as isize).clamp(0, image.width() as isize) as usize;
    let y1 = (oy + tile.input_height as isize).clamp(0, image.height() as isize) as usize;
    if x0 >= x1 || y0 >= y1 {
        return window;
    }

    let dx = (x0 as isize - ox) as usize;
    let dy = (y0 as isize - oy) as usize;
    window
        .view_mut()
        .slice_mut(s![.., dy..dy + (y1 - y0), dx..dx + (x1 - x0)])
        .assign(&image.view().slice(s![.., y0..y1, x0..x1]));
    window
}

/// Crop the prepadding off a tile result and write its owned region into
/// `output`, clipped to the original image extent.
pub fn paste_tile(output: &mut Tensor, tile_output: &Tensor, tile: &Tile) -> Result<()> {
    let expected = tile.input_shape(output.channels());
    tile_output.ensure_shape(expected, "tile output")?;

    let x1 = (tile.x + tile.width).min(output.width());
    let y1 = (tile.y + tile.height).min(output.height());
    if tile.x >= x1 || tile.y >= y1 {
        return Ok(());
    }

    let p = tile.prepadding;
    output
        .view_mut()
        .slice_mut(s![.., tile.y..y1, tile.x..x1])
        .assign(&tile_output.view().slice(s![
            ..,
            p..p + (y1 - tile.y),
            p..p + (x1 - tile.x)
        ]));
    Ok(())
}
