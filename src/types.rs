use image::RgbImage;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use crate::error::{AnnotateError, Result};

// Image formats picked up from the input folder
pub const IMG_FORMATS: &[&str] = &["jpg", "jpeg", "png"];

// Precomputed HashSet of image extensions for fast lookup
pub static IMAGE_EXTENSIONS_SET: OnceLock<HashSet<String>> = OnceLock::new();

/// Get the image extensions set
pub fn get_image_extensions_set() -> &'static HashSet<String> {
    IMAGE_EXTENSIONS_SET.get_or_init(|| IMG_FORMATS.iter().map(|ext| ext.to_lowercase()).collect())
}

/// Per-detection state derived from one prediction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections {
    /// `[x, y, w, h]` boxes
    pub boxes: Vec<[f64; 4]>,
    /// 1-based class indices
    pub class_ids: Vec<u32>,
    /// Flat `x1, y1, x2, y2, ...` polygons, empty when segmentation is off
    pub masks: Vec<Vec<f64>>,
    pub areas: Vec<f64>,
    pub annotation_ids: Vec<u64>,
}

impl Detections {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    fn is_consistent(&self) -> bool {
        let n = self.boxes.len();
        self.class_ids.len() == n
            && self.areas.len() == n
            && self.annotation_ids.len() == n
            && (self.masks.is_empty() || self.masks.len() == n)
    }
}

/// One input image and the annotations derived for it
#[derive(Debug, Clone)]
pub struct DetectionRecord {
    pub image_id: u32,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pixels: Option<RgbImage>,
    detections: Option<Detections>,
    is_crowd: u8,
}

impl DetectionRecord {
    pub fn new(image_id: u32, file_name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            image_id,
            file_name: file_name.into(),
            width,
            height,
            pixels: None,
            detections: None,
            is_crowd: 0,
        }
    }

    pub fn with_pixels(mut self, pixels: RgbImage) -> Self {
        self.pixels = Some(pixels);
        self
    }

    pub fn set_pixels(&mut self, pixels: RgbImage) {
        self.pixels = Some(pixels);
    }

    pub fn pixels(&self) -> Option<&RgbImage> {
        self.pixels.as_ref()
    }

    /// Drop the raw pixel buffer once nothing downstream needs it
    pub fn release_pixels(&mut self) -> Option<RgbImage> {
        self.pixels.take()
    }

    /// Store derived detections, rejecting inconsistent lengths and repeated population
    pub fn populate(&mut self, detections: Detections) -> Result<()> {
        if self.detections.is_some() {
            return Err(AnnotateError::AlreadyPopulated(self.image_id));
        }
        if !detections.is_consistent() {
            return Err(AnnotateError::ShapeMismatch {
                image_id: self.image_id,
                boxes: detections.boxes.len(),
                class_ids: detections.class_ids.len(),
                areas: detections.areas.len(),
                annotation_ids: detections.annotation_ids.len(),
                masks: detections.masks.len(),
            });
        }
        self.detections = Some(detections);
        Ok(())
    }

    pub fn is_populated(&self) -> bool {
        self.detections.is_some()
    }

    pub fn detections(&self) -> Option<&Detections> {
        self.detections.as_ref()
    }

    pub fn is_crowd(&self) -> u8 {
        self.is_crowd
    }
}

/// Category names and the source class indices aliased to each of them
#[derive(Debug, Clone, Default)]
pub struct CategoryVocabulary {
    // name order is first-seen order
    entries: Vec<(String, Vec<u32>)>,
    canonical: HashMap<u32, u32>,
}

impl CategoryVocabulary {
    /// Build from `(class index, name)` pairs
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let mut entries: Vec<(String, Vec<u32>)> = Vec::new();
        let mut owner: HashMap<u32, String> = HashMap::new();

        for (index, name) in pairs {
            let name = name.into();
            if let Some(previous) = owner.get(&index) {
                if previous != &name {
                    return Err(AnnotateError::VocabularyMismatch(format!(
                        "class index {} is aliased by both '{}' and '{}'",
                        index, previous, name
                    )));
                }
                continue;
            }
            owner.insert(index, name.clone());
            match entries.iter_mut().find(|(n, _)| *n == name) {
                Some((_, aliases)) => aliases.push(index),
                None => entries.push((name, vec![index])),
            }
        }

        let mut canonical = HashMap::with_capacity(owner.len());
        for (_, aliases) in entries.iter_mut() {
            aliases.sort_unstable();
            let category_id = aliases[0] + 1;
            for &index in aliases.iter() {
                canonical.insert(index, category_id);
            }
        }

        Ok(Self { entries, canonical })
    }

    /// Names with their sorted alias lists, in first-seen order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u32])> {
        self.entries
            .iter()
            .map(|(name, aliases)| (name.as_str(), aliases.as_slice()))
    }

    /// Output category id for a raw (0-based) class index
    pub fn category_id(&self, class_index: u32) -> Option<u32> {
        self.canonical.get(&class_index).copied()
    }

    pub fn class_indices(&self) -> BTreeSet<u32> {
        self.canonical.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-class minimum confidence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceThresholds {
    thresholds: HashMap<u32, f32>,
}

impl ConfidenceThresholds {
    pub fn new(thresholds: HashMap<u32, f32>) -> Self {
        Self { thresholds }
    }

    /// Key set must cover exactly the vocabulary's class indices
    pub fn validate(&self, vocabulary: &CategoryVocabulary) -> Result<()> {
        let expected = vocabulary.class_indices();
        let actual: BTreeSet<u32> = self.thresholds.keys().copied().collect();
        if expected != actual {
            return Err(AnnotateError::VocabularyMismatch(format!(
                "confidence thresholds cover classes {:?} but the vocabulary has {:?}",
                actual, expected
            )));
        }
        Ok(())
    }

    pub fn threshold(&self, class_index: u32) -> Option<f32> {
        self.thresholds.get(&class_index).copied()
    }

    pub fn accepts(&self, class_index: u32, score: f32) -> bool {
        self.threshold(class_index)
            .is_some_and(|threshold| score >= threshold)
    }
}

impl FromIterator<(u32, f32)> for ConfidenceThresholds {
    fn from_iter<T: IntoIterator<Item = (u32, f32)>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
