//! Snap points to tiles and enumerate their chips.
//!
//! All enumeration is row-major: rows advance along the grid's `ry` axis
//! and columns along `rx`. The same inputs always yield the same order.

use crate::config::{GridConfig, GridSpec};
use crate::grid::{ChipCoord, ChipGeometry, PixelCoord};
use crate::validation::{self, ValidationError};
use serde::{Deserialize, Serialize};

/// A tile: grid indices plus its upper-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub h: i64,
    pub v: i64,
    pub x: i64,
    pub y: i64,
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{:03}v{:03} ({}, {})", self.h, self.v, self.x, self.y)
    }
}

/// Grid cell `(h, v)` containing a point.
fn snap(spec: &GridSpec, x: i64, y: i64) -> (i64, i64) {
    let h = ((x - spec.tx) as f64 / (spec.sx * spec.rx) as f64).floor() as i64;
    let v = ((y - spec.ty) as f64 / (spec.sy * spec.ry) as f64).floor() as i64;
    (h, v)
}

/// Upper-left corner of grid cell `(h, v)`.
fn origin(spec: &GridSpec, h: i64, v: i64) -> (i64, i64) {
    (spec.tx + h * spec.sx * spec.rx, spec.ty + v * spec.sy * spec.ry)
}

/// Pure tile -> chip partitioner.
#[derive(Debug, Clone)]
pub struct GridPartitioner {
    tile: GridSpec,
    chip: GridSpec,
    pixel_size: i64,
    training_radius: i64,
}

impl GridPartitioner {
    pub fn new(config: &GridConfig) -> Self {
        Self {
            tile: config.tile,
            chip: config.chip,
            pixel_size: config.pixel_size,
            training_radius: config.training_radius,
        }
    }

    /// Tile containing the point `(x, y)`.
    pub fn tile(&self, x: i64, y: i64) -> Tile {
        let (h, v) = snap(&self.tile, x, y);
        self.tile_at(h, v)
    }

    /// Tile with grid indices `(h, v)`.
    pub fn tile_at(&self, h: i64, v: i64) -> Tile {
        let (x, y) = origin(&self.tile, h, v);
        Tile { h, v, x, y }
    }

    /// Chip containing the point `(x, y)`.
    pub fn chip(&self, x: i64, y: i64) -> ChipCoord {
        let (h, v) = snap(&self.chip, x, y);
        let (x, y) = origin(&self.chip, h, v);
        ChipCoord::new(x, y)
    }

    /// Chips per tile along (columns, rows).
    pub fn chips_per_tile(&self) -> (i64, i64) {
        (self.tile.sx / self.chip.sx, self.tile.sy / self.chip.sy)
    }

    /// Pixel layout of every chip.
    pub fn chip_geometry(&self) -> ChipGeometry {
        ChipGeometry {
            cols: (self.chip.sx / self.pixel_size) as usize,
            rows: (self.chip.sy / self.pixel_size) as usize,
            step_x: self.pixel_size * self.chip.rx,
            step_y: self.pixel_size * self.chip.ry,
        }
    }

    /// Row-major chips of a tile.
    pub fn chips(&self, tile: &Tile) -> impl Iterator<Item = ChipCoord> + '_ {
        let (cols, rows) = self.chips_per_tile();
        let step_x = self.chip.sx * self.chip.rx;
        let step_y = self.chip.sy * self.chip.ry;
        let (x0, y0) = (tile.x, tile.y);
        (0..rows).flat_map(move |row| {
            (0..cols).map(move |col| ChipCoord::new(x0 + col * step_x, y0 + row * step_y))
        })
    }

    /// Row-major pixel coordinates of a chip.
    pub fn pixels(&self, chip: ChipCoord) -> Vec<PixelCoord> {
        self.chip_geometry().pixels(chip).collect()
    }

    /// Chips classified for a tile: the tile's own chips.
    pub fn classification_chips(&self, tile: &Tile) -> Vec<ChipCoord> {
        self.chips(tile).collect()
    }

    /// Chips used to train a model for a tile: every chip of the tile
    /// neighbourhood within the training radius, tiles in row-major order.
    pub fn training_chips(&self, tile: &Tile) -> Vec<ChipCoord> {
        let r = self.training_radius;
        let mut chips = Vec::new();
        for v in (tile.v - r)..=(tile.v + r) {
            for h in (tile.h - r)..=(tile.h + r) {
                let neighbour = self.tile_at(h, v);
                chips.extend(self.chips(&neighbour));
            }
        }
        chips
    }

    /// Chips intersecting the box with upper-left `(ulx, uly)` and lower-right `(lrx, lry)`.
    pub fn chips_in_bounds(
        &self,
        ulx: i64,
        uly: i64,
        lrx: i64,
        lry: i64,
    ) -> Result<Vec<ChipCoord>, ValidationError> {
        validation::bounds(ulx, uly, lrx, lry)?;

        let (h0, v0) = snap(&self.chip, ulx, uly);
        // Lower-right corner is exclusive. The last integer point inside the
        // box is (lrx - 1, lry + 1) whatever the grid's reflections are.
        let (h1, v1) = snap(&self.chip, lrx - 1, lry + 1);
        let (h_lo, h_hi) = (h0.min(h1), h0.max(h1));
        let (v_lo, v_hi) = (v0.min(v1), v0.max(v1));

        let mut chips = Vec::new();
        for v in v_lo..=v_hi {
            for h in h_lo..=h_hi {
                let (x, y) = origin(&self.chip, h, v);
                chips.push(ChipCoord::new(x, y));
            }
        }
        Ok(chips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitioner() -> GridPartitioner {
        GridPartitioner::new(&GridConfig::default())
    }

    #[test]
    fn test_tile_snap() {
        let grid = partitioner();
        // A point just inside the first tile's upper-left corner
        let tile = grid.tile(2_565_585 + 10, 3_314_805 - 10);
        assert_eq!((tile.h, tile.v), (0, 0));
        assert_eq!((tile.x, tile.y), (2_565_585, 3_314_805));

        let tile = grid.tile(-2_115_585 + 1, 3_014_805 - 1);
        assert_eq!(tile.h, ((-2_115_585 - 2_565_585) as f64 / 150_000.0).floor() as i64);
        assert_eq!(tile.v, 2);
        assert_eq!(tile.y, 3_014_805);
    }

    #[test]
    fn test_tile_origin_snaps_to_itself() {
        let grid = partitioner();
        let tile = grid.tile_at(-18, 4);
        assert_eq!(grid.tile(tile.x, tile.y), tile);
    }

    #[test]
    fn test_chips_row_major_and_deterministic() {
        let grid = partitioner();
        let tile = grid.tile_at(3, 7);
        let chips: Vec<_> = grid.chips(&tile).collect();

        assert_eq!(chips.len(), 2500);
        assert_eq!(chips[0], ChipCoord::new(tile.x, tile.y));
        assert_eq!(chips[1], ChipCoord::new(tile.x + 3000, tile.y));
        assert_eq!(chips[50], ChipCoord::new(tile.x, tile.y - 3000));
        assert_eq!(chips, grid.classification_chips(&tile));

        // Every chip snaps back into the tile
        for chip in &chips {
            assert_eq!(grid.tile(chip.x, chip.y), tile);
            assert_eq!(grid.chip(chip.x + 15, chip.y - 15), *chip);
        }
    }

    #[test]
    fn test_training_chips_cover_neighbourhood() {
        let grid = partitioner();
        let tile = grid.tile_at(10, 10);
        let training = grid.training_chips(&tile);

        assert_eq!(training.len(), 9 * 2500);
        // First chip belongs to the upper-left neighbour
        assert_eq!(training[0], ChipCoord::new(grid.tile_at(9, 9).x, grid.tile_at(9, 9).y));
        // The tile's own chips are a contiguous run in the middle
        let own = grid.classification_chips(&tile);
        assert_eq!(&training[4 * 2500..5 * 2500], own.as_slice());
        // Deterministic across calls
        assert_eq!(training, grid.training_chips(&tile));
    }

    #[test]
    fn test_chips_in_bounds() {
        let grid = partitioner();
        let tile = grid.tile_at(0, 0);
        let chips = grid
            .chips_in_bounds(tile.x, tile.y, tile.x + 6000, tile.y - 3000)
            .unwrap();
        assert_eq!(chips, vec![
            ChipCoord::new(tile.x, tile.y),
            ChipCoord::new(tile.x + 3000, tile.y),
        ]);

        assert!(grid.chips_in_bounds(10, 0, 0, 10).is_err());
    }

    #[test]
    fn test_chip_geometry() {
        let geometry = partitioner().chip_geometry();
        assert_eq!(geometry.cols, 100);
        assert_eq!(geometry.rows, 100);
        assert_eq!(geometry.step_x, 30);
        assert_eq!(geometry.step_y, -30);
        assert_eq!(geometry.pixel_count(), 10_000);
    }

    #[test]
    fn test_chips_in_bounds_reflected_grid() {
        let mut config = GridConfig::default();
        config.chip = GridSpec { rx: -1, ry: 1, sx: 3000, sy: 3000, tx: 0, ty: 0 };
        let grid = GridPartitioner::new(&config);

        let chips = grid.chips_in_bounds(0, 3000, 3000, 0).unwrap();
        assert_eq!(chips.len(), 4);
        // Every corner point inside the box lands in a returned chip
        for (x, y) in [(0, 3000), (2999, 3000), (0, 1), (2999, 1)] {
            assert!(chips.contains(&grid.chip(x, y)));
        }
        // Points on the exclusive edges do not widen the result
        let inner = grid.chips_in_bounds(1, 2999, 2999, 1).unwrap();
        assert!(inner.iter().all(|c| chips.contains(c)));
    }
}
