//! Per-pixel aligned time series.

use crate::grid::{ChipCoord, PixelCoord};
use crate::timeseries::{AuxBand, BandRole, SpectralBand};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;

/// A stack that violates the alignment invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RodError {
    #[error("dates are not strictly ascending at position {0}")]
    UnorderedDates(usize),

    #[error("expected {expected} band sequences, got {actual}")]
    RoleCount { expected: usize, actual: usize },

    #[error("band {band} has {actual} values, expected {expected}")]
    Length {
        band: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Aligned time series for one pixel: shared dates and one value
/// sequence per band role, all of the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct Stack<B: BandRole> {
    chip: ChipCoord,
    pixel: PixelCoord,
    dates: Vec<i64>,
    values: Vec<Vec<f64>>,
    _role: PhantomData<B>,
}

/// Spectral rod fed to change detection.
pub type Rod = Stack<SpectralBand>;

/// Ancillary rod fed to classification.
pub type AuxRod = Stack<AuxBand>;

impl<B: BandRole> Stack<B> {
    /// Build a stack, rejecting anything that breaks alignment.
    ///
    /// `values` must hold one sequence per role, in `B::ALL` order.
    pub fn new(
        chip: ChipCoord,
        pixel: PixelCoord,
        dates: Vec<i64>,
        values: Vec<Vec<f64>>,
    ) -> Result<Self, RodError> {
        if let Some(i) = dates.windows(2).position(|w| w[0] >= w[1]) {
            return Err(RodError::UnorderedDates(i + 1));
        }
        if values.len() != B::ALL.len() {
            return Err(RodError::RoleCount {
                expected: B::ALL.len(),
                actual: values.len(),
            });
        }
        for (band, seq) in B::ALL.iter().zip(&values) {
            if seq.len() != dates.len() {
                return Err(RodError::Length {
                    band: band.name(),
                    expected: dates.len(),
                    actual: seq.len(),
                });
            }
        }
        Ok(Self {
            chip,
            pixel,
            dates,
            values,
            _role: PhantomData,
        })
    }

    pub fn chip(&self) -> ChipCoord {
        self.chip
    }

    pub fn pixel(&self) -> PixelCoord {
        self.pixel
    }

    pub fn dates(&self) -> &[i64] {
        &self.dates
    }

    /// Values of one band role.
    pub fn band(&self, role: B) -> &[f64] {
        &self.values[role.index()]
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Approximate serialized size, used to size partitions.
    pub fn payload_bytes(&self) -> usize {
        // dates plus one value per role per date, 8 bytes each, plus coordinates
        32 + 8 * self.dates.len() * (B::ALL.len() + 1)
    }

    /// Canonical JSON encoding of the rod, used for input checksums.
    pub fn to_json(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Rod {
    pub fn reds(&self) -> &[f64] {
        self.band(SpectralBand::Reds)
    }

    pub fn greens(&self) -> &[f64] {
        self.band(SpectralBand::Greens)
    }

    pub fn blues(&self) -> &[f64] {
        self.band(SpectralBand::Blues)
    }

    pub fn nirs(&self) -> &[f64] {
        self.band(SpectralBand::Nirs)
    }

    pub fn swir1s(&self) -> &[f64] {
        self.band(SpectralBand::Swir1s)
    }

    pub fn swir2s(&self) -> &[f64] {
        self.band(SpectralBand::Swir2s)
    }

    pub fn thermals(&self) -> &[f64] {
        self.band(SpectralBand::Thermals)
    }

    pub fn quality(&self) -> &[f64] {
        self.band(SpectralBand::Quality)
    }
}

impl AuxRod {
    pub fn dem(&self) -> &[f64] {
        self.band(AuxBand::Dem)
    }

    pub fn trends(&self) -> &[f64] {
        self.band(AuxBand::Trends)
    }

    /// Training label source: the first trends value must be known.
    pub fn has_valid_trends(&self) -> bool {
        self.trends()
            .first()
            .is_some_and(|&t| t != 0.0 && t != 9.0)
    }
}

impl<B: BandRole> Serialize for Stack<B> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(B::ALL.len() + 5))?;
        map.serialize_entry("chip_x", &self.chip.x)?;
        map.serialize_entry("chip_y", &self.chip.y)?;
        map.serialize_entry("x", &self.pixel.x)?;
        map.serialize_entry("y", &self.pixel.y)?;
        map.serialize_entry("dates", &self.dates)?;
        for role in B::ALL {
            map.serialize_entry(role.name(), self.band(*role))?;
        }
        map.end()
    }
}
