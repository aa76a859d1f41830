//! Chip and pixel coordinates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper-left corner of a chip in projection coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChipCoord {
    pub x: i64,
    pub y: i64,
}

impl ChipCoord {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for ChipCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Upper-left corner of a pixel in projection coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelCoord {
    pub x: i64,
    pub y: i64,
}

impl PixelCoord {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for PixelCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Pixel layout shared by every chip of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipGeometry {
    /// Pixels per chip row
    pub cols: usize,
    /// Pixel rows per chip
    pub rows: usize,
    /// Signed step between adjacent pixel columns
    pub step_x: i64,
    /// Signed step between adjacent pixel rows
    pub step_y: i64,
}

impl ChipGeometry {
    /// Number of pixels in one chip.
    pub fn pixel_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Pixel coordinate for the row-major index inside `chip`.
    pub fn pixel_at(&self, chip: ChipCoord, index: usize) -> PixelCoord {
        let row = (index / self.cols) as i64;
        let col = (index % self.cols) as i64;
        PixelCoord::new(chip.x + col * self.step_x, chip.y + row * self.step_y)
    }

    /// Row-major pixel coordinates of `chip`.
    pub fn pixels(&self, chip: ChipCoord) -> impl Iterator<Item = PixelCoord> + '_ {
        (0..self.pixel_count()).map(move |i| self.pixel_at(chip, i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> ChipGeometry {
        ChipGeometry { cols: 3, rows: 2, step_x: 30, step_y: -30 }
    }

    #[test]
    fn test_pixels_row_major() {
        let chip = ChipCoord::new(100, 200);
        let pixels: Vec<_> = geometry().pixels(chip).collect();
        assert_eq!(pixels.len(), 6);
        assert_eq!(pixels[0], PixelCoord::new(100, 200));
        assert_eq!(pixels[1], PixelCoord::new(130, 200));
        assert_eq!(pixels[2], PixelCoord::new(160, 200));
        assert_eq!(pixels[3], PixelCoord::new(100, 170));
        assert_eq!(pixels[5], PixelCoord::new(160, 170));
    }

    #[test]
    fn test_pixel_at_matches_iterator() {
        let geometry = geometry();
        let chip = ChipCoord::new(-3000, 3000);
        for (i, pixel) in geometry.pixels(chip).enumerate() {
            assert_eq!(geometry.pixel_at(chip, i), pixel);
        }
    }
}
