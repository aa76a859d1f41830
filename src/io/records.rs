//! Persisted row types.

use crate::grid::{ChipCoord, PixelCoord, Tile};
use serde::{Deserialize, Serialize};

/// Hex md5 digest of a payload.
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Current UTC time as an RFC 3339 string.
pub fn produced_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// One detection row per pixel per algorithm and acquired range.
///
/// Failed pixels carry `result_ok = false` and an empty `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub tile_x: i64,
    pub tile_y: i64,
    pub chip_x: i64,
    pub chip_y: i64,
    pub x: i64,
    pub y: i64,
    pub algorithm: String,
    pub acquired: String,
    pub result: String,
    pub result_ok: bool,
    pub result_produced: String,
    pub inputs_md5: String,
    pub result_md5: String,
}

impl DetectionResult {
    pub fn chip(&self) -> ChipCoord {
        ChipCoord::new(self.chip_x, self.chip_y)
    }

    pub fn pixel(&self) -> PixelCoord {
        PixelCoord::new(self.x, self.y)
    }

    /// Change segments of a successful result.
    ///
    /// A successful result with no change models yields one placeholder
    /// with `sday = eday = -1`. Failed results yield nothing.
    pub fn segments(&self) -> anyhow::Result<Vec<SegmentRow>> {
        if !self.result_ok {
            return Ok(Vec::new());
        }
        let output: DetectionOutput = serde_json::from_str(&self.result)?;
        if output.change_models.is_empty() {
            return Ok(vec![SegmentRow::placeholder(self.chip(), self.pixel())]);
        }
        Ok(output
            .change_models
            .iter()
            .map(|m| SegmentRow::from_model(self.chip(), self.pixel(), m))
            .collect())
    }
}

/// Payload returned by a detector for one pixel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    #[serde(default)]
    pub change_models: Vec<ChangeModel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_mask: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure: Option<String>,
}

/// One stable interval reported by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeModel {
    pub start_day: i64,
    pub end_day: i64,
    #[serde(default)]
    pub break_day: i64,
    #[serde(default)]
    pub observation_count: i64,
    #[serde(default)]
    pub change_probability: f64,
    #[serde(default)]
    pub curve_qa: i64,
    /// Per-band model coefficients, kept opaque
    #[serde(flatten)]
    pub bands: serde_json::Map<String, serde_json::Value>,
}

/// A change segment flattened out of a detection result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub chip_x: i64,
    pub chip_y: i64,
    pub x: i64,
    pub y: i64,
    pub sday: i64,
    pub eday: i64,
    pub bday: i64,
    pub chprob: f64,
    pub curqa: i64,
}

impl SegmentRow {
    fn placeholder(chip: ChipCoord, pixel: PixelCoord) -> Self {
        Self {
            chip_x: chip.x,
            chip_y: chip.y,
            x: pixel.x,
            y: pixel.y,
            sday: -1,
            eday: -1,
            bday: -1,
            chprob: 0.0,
            curqa: 0,
        }
    }

    fn from_model(chip: ChipCoord, pixel: PixelCoord, model: &ChangeModel) -> Self {
        Self {
            chip_x: chip.x,
            chip_y: chip.y,
            x: pixel.x,
            y: pixel.y,
            sday: model.start_day,
            eday: model.end_day,
            bday: model.break_day,
            chprob: model.change_probability,
            curqa: model.curve_qa,
        }
    }

    /// Completed segment with known bounds.
    pub fn is_valid(&self) -> bool {
        self.sday >= 0 && self.eday >= 0
    }

    /// Join key shared with aux rows.
    pub fn key(&self) -> (i64, i64, i64, i64) {
        (self.chip_x, self.chip_y, self.x, self.y)
    }
}

/// Class probabilities for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub tile_x: i64,
    pub tile_y: i64,
    pub chip_x: i64,
    pub chip_y: i64,
    pub x: i64,
    pub y: i64,
    pub sday: i64,
    pub eday: i64,
    pub rfrawp: Vec<f64>,
    pub result_md5: String,
    pub produced: String,
}

/// Per-tile completion record. Detection writes the first half;
/// classification merges its fields into the existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub tile_x: i64,
    pub tile_y: i64,
    pub h: i64,
    pub v: i64,
    pub acquired: String,
    pub detector: String,
    pub ardurl: String,
    pub segcount: u64,
    pub produced: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msday: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meday: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxurl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified: Option<u64>,
}

impl JobMetadata {
    pub fn detection(tile: &Tile, acquired: &str, detector: &str, ardurl: &str, segcount: u64) -> Self {
        Self {
            tile_x: tile.x,
            tile_y: tile.y,
            h: tile.h,
            v: tile.v,
            acquired: acquired.to_string(),
            detector: detector.to_string(),
            ardurl: ardurl.to_string(),
            segcount,
            produced: produced_now(),
            msday: None,
            meday: None,
            classifier: None,
            auxurl: None,
            classified: None,
        }
    }
}

/// Classification fields merged into a tile's detection record.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationSummary {
    pub msday: i64,
    pub meday: i64,
    pub classifier: String,
    pub auxurl: String,
    pub classified: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(result: &str, ok: bool) -> DetectionResult {
        DetectionResult {
            tile_x: 0,
            tile_y: 0,
            chip_x: 10,
            chip_y: 20,
            x: 11,
            y: 21,
            algorithm: "ccd".to_string(),
            acquired: "1982-01-01/2017-12-31".to_string(),
            result: result.to_string(),
            result_ok: ok,
            result_produced: produced_now(),
            inputs_md5: String::new(),
            result_md5: checksum(result.as_bytes()),
        }
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(checksum(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
    }

    #[test]
    fn test_segments_from_models() {
        let payload = r#"{"change_models":[
            {"start_day":100,"end_day":200,"break_day":201,"change_probability":1.0,"curve_qa":8,
             "blue":{"rmse":1.0}},
            {"start_day":202,"end_day":300}
        ],"procedure":"standard_procedure"}"#;
        let segments = row(payload, true).segments().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].sday, segments[0].eday, segments[0].bday), (100, 200, 201));
        assert_eq!(segments[0].key(), (10, 20, 11, 21));
        assert_eq!(segments[1].curqa, 0);
        assert!(segments.iter().all(SegmentRow::is_valid));
    }

    #[test]
    fn test_empty_models_yield_placeholder() {
        let segments = row(r#"{"change_models":[]}"#, true).segments().unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!((segments[0].sday, segments[0].eday), (-1, -1));
        assert!(!segments[0].is_valid());
    }

    #[test]
    fn test_failed_result_has_no_segments() {
        assert!(row("", false).segments().unwrap().is_empty());
    }

    #[test]
    fn test_metadata_omits_unset_classification_fields() {
        let tile = Tile { h: 1, v: 2, x: 100, y: 200 };
        let md = JobMetadata::detection(&tile, "a/b", "ccd", "http://ard", 5);
        let json = serde_json::to_value(&md).unwrap();
        assert!(json.get("msday").is_none());
        assert_eq!(json["segcount"], 5);

        let back: JobMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, md);
    }
}
