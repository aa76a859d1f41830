//! Band roles and their catalog tag queries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed set of band roles aligned together into one stack.
pub trait BandRole: Copy + Eq + std::hash::Hash + fmt::Debug + Send + Sync + 'static {
    /// Every role, in stack order.
    const ALL: &'static [Self];

    /// Position of this role in the stack.
    fn index(self) -> usize;

    /// Role name as used in payloads and logs.
    fn name(self) -> &'static str;

    /// Catalog tag query resolving this role to band identifiers.
    fn query(self) -> &'static str;
}

/// Surface reflectance, brightness temperature and quality roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectralBand {
    Reds,
    Greens,
    Blues,
    Nirs,
    Swir1s,
    Swir2s,
    Thermals,
    Quality,
}

impl BandRole for SpectralBand {
    const ALL: &'static [Self] = &[
        Self::Reds,
        Self::Greens,
        Self::Blues,
        Self::Nirs,
        Self::Swir1s,
        Self::Swir2s,
        Self::Thermals,
        Self::Quality,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            Self::Reds => "reds",
            Self::Greens => "greens",
            Self::Blues => "blues",
            Self::Nirs => "nirs",
            Self::Swir1s => "swir1s",
            Self::Swir2s => "swir2s",
            Self::Thermals => "thermals",
            Self::Quality => "quality",
        }
    }

    fn query(self) -> &'static str {
        match self {
            Self::Reds => "tags:red AND sr",
            Self::Greens => "tags:green AND sr",
            Self::Blues => "tags:blue AND sr",
            Self::Nirs => "tags:nir AND sr",
            Self::Swir1s => "tags:swir1 AND sr",
            Self::Swir2s => "tags:swir2 AND sr",
            Self::Thermals => "tags:bt AND thermal AND NOT tirs2",
            Self::Quality => "tags:pixelqa",
        }
    }
}

/// Ancillary layers used as classification features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuxBand {
    Dem,
    Trends,
    Aspect,
    Posidex,
    Slope,
    Mpw,
    Nlcd,
    Nlcdtrn,
}

impl BandRole for AuxBand {
    const ALL: &'static [Self] = &[
        Self::Dem,
        Self::Trends,
        Self::Aspect,
        Self::Posidex,
        Self::Slope,
        Self::Mpw,
        Self::Nlcd,
        Self::Nlcdtrn,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            Self::Dem => "dem",
            Self::Trends => "trends",
            Self::Aspect => "aspect",
            Self::Posidex => "posidex",
            Self::Slope => "slope",
            Self::Mpw => "mpw",
            Self::Nlcd => "nlcd",
            Self::Nlcdtrn => "nlcdtrn",
        }
    }

    fn query(self) -> &'static str {
        match self {
            Self::Dem => "tags:dem",
            Self::Trends => "tags:trends",
            Self::Aspect => "tags:aspect",
            Self::Posidex => "tags:posidex",
            Self::Slope => "tags:slope",
            Self::Mpw => "tags:mpw",
            Self::Nlcd => "tags:nlcd AND NOT nlcdtrn",
            Self::Nlcdtrn => "tags:nlcdtrn",
        }
    }
}

impl fmt::Display for SpectralBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for AuxBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
