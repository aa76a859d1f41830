//! Join ancillary rods with prior change segments into classifier features.

use crate::grid::{ChipCoord, PixelCoord};
use crate::io::SegmentRow;
use crate::timeseries::{AuxBand, AuxRod, BandRole};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Feature vector for one segment of one pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub chip: ChipCoord,
    pub pixel: PixelCoord,
    pub sday: i64,
    pub eday: i64,
    pub features: Vec<f64>,
    /// Training label, the pixel's trends class. `None` when classifying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<f64>,
}

impl FeatureRow {
    /// Key shared with segment and aux rows.
    pub fn key(&self) -> (i64, i64, i64, i64) {
        (self.chip.x, self.chip.y, self.pixel.x, self.pixel.y)
    }
}

/// Aux rods usable as training labels.
pub fn valid_trends(aux: Vec<AuxRod>) -> Vec<AuxRod> {
    aux.into_iter().filter(AuxRod::has_valid_trends).collect()
}

/// Segments overlapping the training window `[msday, meday]`.
pub fn in_window(segments: Vec<SegmentRow>, msday: i64, meday: i64) -> Vec<SegmentRow> {
    segments
        .into_iter()
        .filter(|s| s.sday <= meday && s.eday >= msday)
        .collect()
}

fn aux_key(rod: &AuxRod) -> (i64, i64, i64, i64) {
    (rod.chip().x, rod.chip().y, rod.pixel().x, rod.pixel().y)
}

/// Inner join of segments with aux rods on `(chip_x, chip_y, x, y)`.
///
/// Pairs come back in segment order.
pub fn join<'a>(aux: &'a [AuxRod], segments: &'a [SegmentRow]) -> Vec<(&'a AuxRod, &'a SegmentRow)> {
    let by_key: HashMap<_, &AuxRod> = aux.iter().map(|rod| (aux_key(rod), rod)).collect();
    segments
        .iter()
        .filter_map(|seg| by_key.get(&seg.key()).map(|rod| (*rod, seg)))
        .collect()
}

/// Feature columns in order: every aux band except trends, then
/// change probability and curve QA.
pub fn feature_names() -> Vec<&'static str> {
    AuxBand::ALL
        .iter()
        .filter(|b| **b != AuxBand::Trends)
        .map(|b| b.name())
        .chain(["chprob", "curqa"])
        .collect()
}

fn feature_vector(rod: &AuxRod, seg: &SegmentRow) -> Option<Vec<f64>> {
    let mut features = Vec::with_capacity(AuxBand::ALL.len() + 1);
    for band in AuxBand::ALL.iter().filter(|b| **b != AuxBand::Trends) {
        // Ancillary layers are static; the first observation stands for the pixel
        features.push(*rod.band(*band).first()?);
    }
    features.push(seg.chprob);
    features.push(seg.curqa as f64);
    Some(features)
}

/// Build feature rows for joined segments. Rods without observations
/// produce no rows.
pub fn build(aux: &[AuxRod], segments: &[SegmentRow], labelled: bool) -> Vec<FeatureRow> {
    join(aux, segments)
        .into_iter()
        .filter_map(|(rod, seg)| {
            let features = feature_vector(rod, seg)?;
            let label = if labelled {
                Some(*rod.trends().first()?)
            } else {
                None
            };
            Some(FeatureRow {
                chip: rod.chip(),
                pixel: rod.pixel(),
                sday: seg.sday,
                eday: seg.eday,
                features,
                label,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aux(x: i64, trends: f64) -> AuxRod {
        let mut values: Vec<Vec<f64>> = AuxBand::ALL.iter().map(|b| vec![b.index() as f64]).collect();
        values[AuxBand::Trends.index()] = vec![trends];
        AuxRod::new(ChipCoord::new(0, 0), PixelCoord::new(x, 0), vec![1], values).unwrap()
    }

    fn segment(x: i64, sday: i64, eday: i64) -> SegmentRow {
        SegmentRow {
            chip_x: 0,
            chip_y: 0,
            x,
            y: 0,
            sday,
            eday,
            bday: 0,
            chprob: 0.5,
            curqa: 8,
        }
    }

    #[test]
    fn test_valid_trends_filter() {
        let kept = valid_trends(vec![aux(0, 3.0), aux(30, 0.0), aux(60, 9.0)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].pixel().x, 0);
    }

    #[test]
    fn test_join_on_pixel_key() {
        let rods = vec![aux(0, 3.0), aux(30, 4.0)];
        let segs = vec![segment(30, 1, 2), segment(90, 1, 2), segment(0, 3, 4), segment(30, 5, 6)];
        let joined = join(&rods, &segs);
        let xs: Vec<_> = joined.iter().map(|(r, s)| (r.pixel().x, s.sday)).collect();
        assert_eq!(xs, vec![(30, 1), (0, 3), (30, 5)]);
    }

    #[test]
    fn test_build_features_and_labels() {
        let rods = vec![aux(0, 3.0)];
        let segs = vec![segment(0, 10, 20)];

        let training = build(&rods, &segs, true);
        assert_eq!(training.len(), 1);
        assert_eq!(training[0].label, Some(3.0));
        assert_eq!(training[0].features.len(), feature_names().len());
        assert_eq!(training[0].features[0], AuxBand::Dem.index() as f64);
        let n = training[0].features.len();
        assert_eq!(training[0].features[n - 2..].to_vec(), vec![0.5, 8.0]);

        let classifying = build(&rods, &segs, false);
        assert_eq!(classifying[0].label, None);
        assert_eq!(classifying[0].key(), (0, 0, 0, 0));
    }

    #[test]
    fn test_empty_rod_has_no_features() {
        let empty = AuxRod::new(ChipCoord::new(0, 0), PixelCoord::new(0, 0), vec![], vec![vec![]; 8]).unwrap();
        assert!(build(&[empty], &[segment(0, 1, 2)], false).is_empty());
    }

    #[test]
    fn test_training_window() {
        let segs = vec![segment(0, 1, 5), segment(0, 6, 9), segment(0, 20, 30)];
        let kept = in_window(segs, 5, 10);
        assert_eq!(kept.len(), 2);
        assert!(feature_names().iter().all(|n| *n != "trends"));
    }
}
