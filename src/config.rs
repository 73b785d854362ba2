use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use crate::error::{AnnotateError, Result};
use crate::normalizer::NormalizerConfig;
use crate::predictor::PredictOptions;
use crate::types::{CategoryVocabulary, ConfidenceThresholds};

/// Command-line arguments for turning model predictions into a CVAT-ready COCO file.
#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
pub struct Args {
    /// Directory containing the images to annotate
    #[arg(short = 'i', long = "img_folder")]
    pub img_folder: String,

    /// Directory containing one `<image stem>.json` prediction file per image
    #[arg(short = 'p', long = "predictions")]
    pub predictions: String,

    /// JSON file with class names and optional per-class confidence thresholds
    #[arg(short = 'c', long = "classes")]
    pub classes: String,

    /// Output directory, recreated on every run
    #[arg(short = 'o', long = "output", default_value = "annotations_output")]
    pub output: String,

    /// Emit instance polygons when masks are available
    #[arg(long = "segment")]
    pub segment: bool,

    /// Segment every detected box by thresholding its pixels; implies --segment
    #[arg(long = "box_prompt")]
    pub box_prompt: bool,

    /// Reduce raster masks to a simplified outline
    #[arg(long = "minimize_points")]
    pub minimize_points: bool,

    /// Confidence threshold forwarded to the predictor
    #[arg(long = "conf", default_value_t = 0.4, value_parser = validate_ratio)]
    pub conf: f32,

    /// IoU threshold forwarded to the predictor
    #[arg(long = "iou", default_value_t = 0.8, value_parser = validate_ratio)]
    pub iou: f32,

    /// Inference size forwarded to the predictor
    #[arg(long = "imgsz", default_value_t = 640)]
    pub imgsz: u32,

    /// What to do when a single image fails
    #[arg(long = "on_error", value_enum, default_value = "abort")]
    pub on_error: FailurePolicy,

    /// Number of worker threads, 1 runs sequentially
    #[arg(long = "workers", default_value_t = 1, value_parser = validate_workers)]
    pub workers: usize,

    /// First annotation id
    #[arg(long = "start_annotation_id", default_value_t = 1)]
    pub start_annotation_id: u64,

    /// Also write the CVAT project label list
    #[arg(long = "cvat_labels")]
    pub cvat_labels: bool,

    /// Seed for label colors
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,
}

// Handling of per-image collaborator failures
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Default)]
pub enum FailurePolicy {
    /// Stop the run at the first failing image
    #[default]
    Abort,
    /// Log the failure and keep the image without annotations
    Skip,
}

impl Args {
    pub fn predict_options(&self, vocabulary: &CategoryVocabulary) -> PredictOptions {
        PredictOptions {
            confidence: self.conf,
            iou: self.iou,
            image_size: self.imgsz,
            classes: Some(vocabulary.class_indices().into_iter().collect()),
        }
    }

    pub fn normalizer_config(&self, thresholds: Option<ConfidenceThresholds>) -> NormalizerConfig {
        NormalizerConfig {
            segment: self.segment || self.box_prompt,
            minimize_points: self.minimize_points,
            thresholds,
        }
    }
}

// Validate that the ratio is between 0.0 and 1.0
fn validate_ratio(s: &str) -> std::result::Result<f32, String> {
    match f32::from_str(s) {
        Ok(val) if (0.0..=1.0).contains(&val) => Ok(val),
        _ => Err("RATIO must be between 0.0 and 1.0".to_string()),
    }
}

fn validate_workers(s: &str) -> std::result::Result<usize, String> {
    match usize::from_str(s) {
        Ok(val) if val > 0 => Ok(val),
        _ => Err("WORKERS must be a positive integer".to_string()),
    }
}

/// Class configuration file
///
/// ```json
/// { "names": { "0": "person", "1": "car", "2": "person" },
///   "conf":  { "0": 0.5, "1": 0.8, "2": 0.5 } }
/// ```
///
/// Several indices may share a name. `conf` is optional; when present it must
/// cover every index listed in `names`.
///
/// Class lists kept as YAML (`names:` and `conf:` mappings keyed by index) carry
/// the same two maps and convert one to one, for example with
/// `yq -o=json coco_classes.yaml > classes.json`. YAML files are rejected by
/// [`ClassConfig::load`] with that hint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub names: BTreeMap<u32, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<BTreeMap<u32, f32>>,
}

impl ClassConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase);
        if matches!(extension.as_deref(), Some("yaml" | "yml")) {
            return Err(AnnotateError::Config(format!(
                "{} is YAML; class files are JSON with the same `names` and `conf` maps \
                 (convert with `yq -o=json`)",
                path.display()
            )));
        }

        let file = File::open(path).map_err(|e| {
            AnnotateError::Config(format!("cannot open {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        if config.names.is_empty() {
            return Err(AnnotateError::Config(format!(
                "{} does not name any class",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Names are ordered by their smallest class index
    pub fn vocabulary(&self) -> Result<CategoryVocabulary> {
        CategoryVocabulary::from_pairs(
            self.names
                .iter()
                .map(|(&index, name)| (index, name.as_str())),
        )
    }

    pub fn thresholds(&self, vocabulary: &CategoryVocabulary) -> Result<Option<ConfidenceThresholds>> {
        let Some(conf) = &self.conf else {
            return Ok(None);
        };
        if let Some((index, value)) = conf.iter().find(|(_, v)| !(0.0..=1.0).contains(*v)) {
            return Err(AnnotateError::Config(format!(
                "confidence threshold {} for class {} is outside 0.0..=1.0",
                value, index
            )));
        }
        let thresholds: ConfidenceThresholds =
            conf.iter().map(|(&index, &value)| (index, value)).collect();
        thresholds.validate(vocabulary)?;
        Ok(Some(thresholds))
    }
}
