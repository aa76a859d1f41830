//! Tile, chip and pixel grid partitioning.

mod chip;
mod tile;

pub use chip::{ChipCoord, ChipGeometry, PixelCoord};
pub use tile::{GridPartitioner, Tile};
