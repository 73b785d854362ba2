//! Predictor boundary
//!
//! The detection model itself lives outside this crate. Anything that can
//! turn a [`DetectionRecord`] into a [`Prediction`] plugs in through
//! [`Predictor`]; box-prompted segmenters plug in through [`PromptSegmenter`].
//! [`RecordedPredictor`] replays predictions saved as JSON by an external run.

use glob::glob;
use image::GrayImage;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::error::{AnnotateError, Result};
use crate::types::DetectionRecord;

/// One raw detection as produced by a model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// `[x1, y1, x2, y2]` in image pixels
    pub bbox: [f32; 4],
    /// 0-based model class index
    pub class_id: u32,
    pub score: f32,
}

/// Instance mask of one detection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceMask {
    /// Boundary polygon in image pixels
    pub polygon: Vec<[f32; 2]>,
    /// Binary raster, non-zero is foreground; any resolution
    pub bitmap: Option<GrayImage>,
}

/// Everything a predictor returns for one image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prediction {
    pub detections: Vec<RawDetection>,
    /// Aligned with `detections`; `None` when the model cannot segment
    pub masks: Option<Vec<InstanceMask>>,
}

impl Prediction {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Options forwarded to every predictor call
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOptions {
    /// Scalar confidence threshold applied by the predictor itself
    pub confidence: f32,
    pub iou: f32,
    pub image_size: u32,
    /// Restrict predictions to these class indices
    pub classes: Option<Vec<u32>>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            confidence: 0.4,
            iou: 0.8,
            image_size: 640,
            classes: None,
        }
    }
}

pub trait Predictor {
    /// Whether predictions carry instance masks
    fn supports_segmentation(&self) -> bool;

    fn predict(&self, record: &DetectionRecord, options: &PredictOptions) -> Result<Prediction>;
}

/// Zero-shot segmenter prompted with a detection box
pub trait PromptSegmenter {
    /// `bbox` is `[x1, y1, x2, y2]` in image pixels
    fn segment_box(&self, record: &DetectionRecord, bbox: [f32; 4]) -> Result<InstanceMask>;
}

/// Row-major run-length raster: runs alternate background and foreground,
/// starting with background
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RleBitmap {
    pub width: u32,
    pub height: u32,
    pub counts: Vec<u32>,
}

impl RleBitmap {
    pub fn decode(&self) -> std::result::Result<GrayImage, String> {
        let expected = self.width as usize * self.height as usize;
        let total: usize = self.counts.iter().map(|&c| c as usize).sum();
        if total != expected {
            return Err(format!(
                "run lengths cover {} pixels, bitmap is {}x{}",
                total, self.width, self.height
            ));
        }

        let mut data = Vec::with_capacity(expected);
        for (i, &count) in self.counts.iter().enumerate() {
            let value = if i % 2 == 0 { 0u8 } else { 1u8 };
            data.extend(std::iter::repeat(value).take(count as usize));
        }

        GrayImage::from_raw(self.width, self.height, data)
            .ok_or_else(|| "bitmap buffer does not match its size".to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordedMask {
    #[serde(default)]
    pub polygon: Vec<[f32; 2]>,
    #[serde(default)]
    pub bitmap: Option<RleBitmap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedDetection {
    pub bbox: [f32; 4],
    pub class_id: u32,
    pub score: f32,
    #[serde(default)]
    pub mask: Option<RecordedMask>,
}

/// Content of one prediction file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordedPrediction {
    pub detections: Vec<RecordedDetection>,
}

impl RecordedPrediction {
    fn has_masks(&self) -> bool {
        self.detections.iter().any(|d| d.mask.is_some())
    }
}

/// Replays predictions stored as `<image stem>.json` in a directory
///
/// Files whose detections carry no mask replay as a detection-only model.
#[derive(Debug, Clone)]
pub struct RecordedPredictor {
    directory: PathBuf,
    segmentation: bool,
}

impl RecordedPredictor {
    /// Open a prediction directory; masks are replayed only when `segmentation`
    /// is requested and at least one recorded file carries them
    pub fn open(directory: impl Into<PathBuf>, segmentation: bool) -> Result<Self> {
        let directory = directory.into();
        let segmentation = segmentation && Self::any_masks(&directory)?;
        Ok(Self {
            directory,
            segmentation,
        })
    }

    fn any_masks(directory: &Path) -> Result<bool> {
        let pattern = directory.join("*.json");
        let paths = glob(&pattern.to_string_lossy())
            .map_err(|e| AnnotateError::Config(format!("invalid prediction directory: {}", e)))?;

        for path in paths.flatten() {
            // unreadable files are reported when their image is predicted
            let recorded: Option<RecordedPrediction> = File::open(&path)
                .ok()
                .and_then(|file| serde_json::from_reader(BufReader::new(file)).ok());
            if recorded.is_some_and(|r| r.has_masks()) {
                return Ok(true);
            }
        }

        debug!("No recorded masks in {}", directory.display());
        Ok(false)
    }

    fn prediction_path(&self, file_name: &str) -> PathBuf {
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name);
        self.directory.join(stem).with_extension("json")
    }

    fn load(&self, record: &DetectionRecord) -> Result<RecordedPrediction> {
        let path = self.prediction_path(&record.file_name);
        let file = File::open(&path).map_err(|e| {
            AnnotateError::predictor(&record.file_name, format!("{}: {}", path.display(), e))
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            AnnotateError::predictor(&record.file_name, format!("{}: {}", path.display(), e))
        })
    }
}

impl Predictor for RecordedPredictor {
    fn supports_segmentation(&self) -> bool {
        self.segmentation
    }

    fn predict(&self, record: &DetectionRecord, options: &PredictOptions) -> Result<Prediction> {
        let recorded = self.load(record)?;
        debug!(
            "Replaying {} recorded detections for {} (imgsz={}, iou={})",
            recorded.detections.len(),
            record.file_name,
            options.image_size,
            options.iou
        );

        let mut prediction = Prediction {
            detections: Vec::new(),
            masks: (self.segmentation && recorded.has_masks()).then(Vec::new),
        };

        for detection in recorded.detections {
            if detection.score < options.confidence {
                continue;
            }
            if let Some(classes) = &options.classes {
                if !classes.contains(&detection.class_id) {
                    continue;
                }
            }

            prediction.detections.push(RawDetection {
                bbox: detection.bbox,
                class_id: detection.class_id,
                score: detection.score,
            });

            if let Some(masks) = prediction.masks.as_mut() {
                let recorded_mask = detection.mask.unwrap_or_default();
                let bitmap = recorded_mask
                    .bitmap
                    .map(|rle| rle.decode())
                    .transpose()
                    .map_err(|e| AnnotateError::predictor(&record.file_name, e))?;
                masks.push(InstanceMask {
                    polygon: recorded_mask.polygon,
                    bitmap,
                });
            }
        }

        Ok(prediction)
    }
}
