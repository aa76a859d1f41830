//! Catalog access and result persistence.

pub mod catalog;
mod metadata;
mod records;
mod result_store;
mod store;

pub use catalog::{BandSpec, CatalogClient, ChipRecord, ChipSource, DataType, HttpCatalog, ResolvedBands};
pub use metadata::MetadataRecorder;
pub use records::{
    checksum, produced_now, ChangeModel, ClassificationRecord, ClassificationSummary,
    DetectionOutput, DetectionResult, JobMetadata, SegmentRow,
};
pub use result_store::ResultStore;
pub use store::{create_result_store, parse_s3_uri};
