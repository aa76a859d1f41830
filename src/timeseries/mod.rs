//! Time-series alignment: chip rasters to per-pixel rods.

mod assembler;
mod bands;
mod rod;

pub use assembler::{BandRasters, Raster, TimeSeriesAssembler};
pub use bands::{AuxBand, BandRole, SpectralBand};
pub use rod::{AuxRod, Rod, RodError, Stack};
