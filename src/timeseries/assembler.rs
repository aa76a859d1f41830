//! Align per-band chip rasters into per-pixel stacks.

use crate::grid::{ChipCoord, ChipGeometry};
use crate::timeseries::{BandRole, Stack};
use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::collections::BTreeSet;

/// One band of one chip at one acquisition date, values row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub ubid: String,
    pub acquired: i64,
    pub values: Vec<f64>,
}

/// Rasters of one chip, grouped by band role.
#[derive(Debug, Clone)]
pub struct BandRasters<B: BandRole> {
    chip: ChipCoord,
    roles: Vec<Option<Vec<Raster>>>,
    _role: std::marker::PhantomData<B>,
}

impl<B: BandRole> BandRasters<B> {
    pub fn new(chip: ChipCoord) -> Self {
        Self {
            chip,
            roles: vec![None; B::ALL.len()],
            _role: std::marker::PhantomData,
        }
    }

    pub fn chip(&self) -> ChipCoord {
        self.chip
    }

    /// Set the rasters of a role, replacing any previous set.
    pub fn insert(&mut self, role: B, rasters: Vec<Raster>) {
        self.roles[role.index()] = Some(rasters);
    }

    /// Total number of rasters across roles.
    pub fn raster_count(&self) -> usize {
        self.roles.iter().flatten().map(Vec::len).sum()
    }
}

/// Sort by date, keeping the first raster of each date.
fn order_and_dedupe(mut rasters: Vec<Raster>) -> Vec<Raster> {
    // sort_by_key is stable
    rasters.sort_by_key(|r| r.acquired);
    rasters.dedup_by_key(|r| r.acquired);
    rasters
}

/// Assembles per-pixel stacks for chips of a fixed geometry.
#[derive(Debug, Clone)]
pub struct TimeSeriesAssembler {
    geometry: ChipGeometry,
}

impl TimeSeriesAssembler {
    pub fn new(geometry: ChipGeometry) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> ChipGeometry {
        self.geometry
    }

    /// Dates present in every role, ascending.
    pub fn common_dates<B: BandRole>(rasters: &BandRasters<B>) -> Result<Vec<i64>> {
        let mut common: Option<BTreeSet<i64>> = None;
        for role in B::ALL {
            let set: BTreeSet<i64> = rasters.roles[role.index()]
                .as_ref()
                .with_context(|| format!("No rasters for band {}", role.name()))?
                .iter()
                .map(|r| r.acquired)
                .collect();
            common = Some(match common {
                Some(acc) => acc.intersection(&set).copied().collect(),
                None => set,
            });
        }
        Ok(common.unwrap_or_default().into_iter().collect())
    }

    /// Build one stack per pixel of the chip, row-major.
    ///
    /// Fails if any role is missing or any raster does not match the chip geometry.
    pub fn assemble<B: BandRole>(&self, rasters: BandRasters<B>) -> Result<Vec<Stack<B>>> {
        let chip = rasters.chip;
        let dates = Self::common_dates(&rasters)?;
        let pixel_count = self.geometry.pixel_count();

        let mut aligned: Vec<Vec<Raster>> = Vec::with_capacity(B::ALL.len());
        for (role, entry) in B::ALL.iter().zip(rasters.roles) {
            let role_rasters = entry
                .with_context(|| format!("No rasters for band {}", role.name()))?;

            if let Some(bad) = role_rasters.iter().find(|r| r.values.len() != pixel_count) {
                bail!(
                    "Raster {} at {} for chip {} has {} values, expected {}",
                    bad.ubid,
                    bad.acquired,
                    chip,
                    bad.values.len(),
                    pixel_count
                );
            }

            let kept: Vec<Raster> = order_and_dedupe(role_rasters)
                .into_iter()
                .filter(|r| dates.binary_search(&r.acquired).is_ok())
                .collect();
            debug_assert_eq!(kept.len(), dates.len());
            aligned.push(kept);
        }

        let geometry = self.geometry;
        (0..pixel_count)
            .into_par_iter()
            .map(|i| {
                let values: Vec<Vec<f64>> = aligned
                    .iter()
                    .map(|role| role.iter().map(|r| r.values[i]).collect())
                    .collect();
                Stack::new(chip, geometry.pixel_at(chip, i), dates.clone(), values)
                    .with_context(|| format!("Invalid stack at pixel {} of chip {}", i, chip))
            })
            .collect()
    }
}
