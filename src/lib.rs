//! Model predictions to COCO annotations
//!
//! This library turns per-image detector and segmenter output into a single
//! COCO annotation file that CVAT can import, optionally with simplified
//! instance polygons.

pub mod assembler;
pub mod coco;
pub mod config;
pub mod contours;
pub mod error;
pub mod io;
pub mod normalizer;
pub mod pipeline;
pub mod predictor;
pub mod segmenter;
pub mod types;
pub mod utils;

// Re-export commonly used types and functions
pub use assembler::CocoAssembler;
pub use config::{Args, ClassConfig, FailurePolicy};
pub use error::{AnnotateError, Result};
pub use io::{write_coco_file, write_cvat_labels, DirectoryImageSource};
pub use normalizer::{AnnotationIdAllocator, AnnotationNormalizer, NormalizerConfig};
pub use pipeline::{run, Annotator, RunSummary};
pub use predictor::{
    InstanceMask, PredictOptions, Prediction, Predictor, PromptSegmenter, RawDetection,
    RecordedPredictor,
};
pub use segmenter::ThresholdPromptSegmenter;
pub use types::{CategoryVocabulary, ConfidenceThresholds, DetectionRecord, Detections};
