//! Turns raw predictions into populated detection records
//!
//! Per image: optional per-class confidence filtering, corner to
//! `[x, y, w, h]` box conversion, 1-based class indices, annotation ids from
//! a corpus-wide allocator, mask polygons and areas.

use log::{debug, info, warn};
use std::ops::Range;

use crate::coco::{bbox_area, calculate_polygon_area, corners_to_xywh, flatten_points};
use crate::contours::{is_empty_mask, minimize_contour};
use crate::error::{AnnotateError, Result};
use crate::predictor::{InstanceMask, Prediction, PromptSegmenter};
use crate::types::{CategoryVocabulary, ConfidenceThresholds, DetectionRecord, Detections};

/// Hands out annotation ids in increasing order across a whole corpus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationIdAllocator {
    next: u64,
}

impl Default for AnnotationIdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl AnnotationIdAllocator {
    pub fn new(start: u64) -> Self {
        Self { next: start }
    }

    /// Reserve `count` consecutive ids
    pub fn reserve(&mut self, count: usize) -> Range<u64> {
        let start = self.next;
        self.next += count as u64;
        start..self.next
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizerConfig {
    /// Produce instance polygons
    pub segment: bool,
    /// Reduce raster masks to a simplified outline instead of copying the model polygon
    pub minimize_points: bool,
    /// Per-class confidence thresholds; `None` keeps every detection
    pub thresholds: Option<ConfidenceThresholds>,
}

pub struct AnnotationNormalizer {
    config: NormalizerConfig,
    prompt_segmenter: Option<Box<dyn PromptSegmenter + Send + Sync>>,
}

impl AnnotationNormalizer {
    /// Fails when the threshold map does not cover exactly the vocabulary's classes
    pub fn new(config: NormalizerConfig, vocabulary: &CategoryVocabulary) -> Result<Self> {
        if let Some(thresholds) = &config.thresholds {
            thresholds.validate(vocabulary)?;
        }
        Ok(Self {
            config,
            prompt_segmenter: None,
        })
    }

    /// Segment every kept box with a box-prompted segmenter
    pub fn with_prompt_segmenter(
        mut self,
        segmenter: Box<dyn PromptSegmenter + Send + Sync>,
    ) -> Self {
        if self.config.segment {
            info!("Instance masks will be produced by prompting the segmenter with detected boxes");
        }
        self.prompt_segmenter = Some(segmenter);
        self
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn uses_prompt_segmenter(&self) -> bool {
        self.config.segment && self.prompt_segmenter.is_some()
    }

    /// Drop detections under their class threshold, keeping the original order
    pub fn filter(&self, prediction: Prediction) -> Prediction {
        let Some(thresholds) = &self.config.thresholds else {
            return prediction;
        };

        let keep: Vec<bool> = prediction
            .detections
            .iter()
            .map(|detection| {
                if thresholds.threshold(detection.class_id).is_none() {
                    warn!(
                        "Dropping detection of class {} without a confidence threshold",
                        detection.class_id
                    );
                }
                thresholds.accepts(detection.class_id, detection.score)
            })
            .collect();

        let Prediction { detections, masks } = prediction;
        let masks = match masks {
            Some(masks) if masks.len() == keep.len() => Some(retain_flagged(masks, &keep)),
            // misaligned masks are reported when the record is built
            other => other,
        };

        Prediction {
            detections: retain_flagged(detections, &keep),
            masks,
        }
    }

    /// Filter, derive and populate one record, drawing ids from `ids`
    pub fn normalize(
        &self,
        record: &mut DetectionRecord,
        prediction: Prediction,
        ids: &mut AnnotationIdAllocator,
    ) -> Result<()> {
        let filtered = self.filter(prediction);
        let mut detections = self.derive(record, filtered)?;
        detections.annotation_ids = ids.reserve(detections.len()).collect();
        self.finish(record, detections)
    }

    /// Populate one record from an already filtered prediction using a reserved id range
    pub fn normalize_filtered(
        &self,
        record: &mut DetectionRecord,
        filtered: Prediction,
        ids: Range<u64>,
    ) -> Result<()> {
        let mut detections = self.derive(record, filtered)?;
        detections.annotation_ids = ids.collect();
        self.finish(record, detections)
    }

    fn finish(&self, record: &mut DetectionRecord, detections: Detections) -> Result<()> {
        debug!(
            "Image {} ({}): {} annotations",
            record.image_id,
            record.file_name,
            detections.len()
        );
        record.populate(detections)?;
        record.release_pixels();
        Ok(())
    }

    fn derive(&self, record: &DetectionRecord, prediction: Prediction) -> Result<Detections> {
        let boxes: Vec<[f64; 4]> = prediction
            .detections
            .iter()
            .map(|detection| corners_to_xywh(detection.bbox))
            .collect();
        let class_ids = prediction
            .detections
            .iter()
            .map(|detection| {
                detection
                    .class_id
                    .checked_add(1)
                    .ok_or(AnnotateError::CategoryResolution {
                        image_id: record.image_id,
                        class_index: detection.class_id,
                    })
            })
            .collect::<Result<Vec<u32>>>()?;
        let box_areas = || boxes.iter().map(bbox_area).collect::<Vec<_>>();

        let (masks, areas) = if !self.config.segment {
            (Vec::new(), box_areas())
        } else if let Some(segmenter) = &self.prompt_segmenter {
            let mut masks = Vec::with_capacity(boxes.len());
            for detection in &prediction.detections {
                let mask = segmenter.segment_box(record, detection.bbox)?;
                masks.push(self.mask_polygon(record, &mask));
            }
            // no reliable area without a second geometric pass
            let areas = vec![0.0; masks.len()];
            (masks, areas)
        } else {
            match prediction.masks {
                None => {
                    debug!(
                        "No instance masks for {}, areas come from boxes",
                        record.file_name
                    );
                    (Vec::new(), box_areas())
                }
                Some(instance_masks) => {
                    if instance_masks.len() != boxes.len() {
                        return Err(AnnotateError::ShapeMismatch {
                            image_id: record.image_id,
                            boxes: boxes.len(),
                            class_ids: boxes.len(),
                            areas: boxes.len(),
                            annotation_ids: boxes.len(),
                            masks: instance_masks.len(),
                        });
                    }
                    let mut masks = Vec::with_capacity(boxes.len());
                    let mut areas = Vec::with_capacity(boxes.len());
                    for (mask, bbox) in instance_masks.iter().zip(&boxes) {
                        let polygon = self.mask_polygon(record, mask);
                        areas.push(mask_area(mask, &polygon, bbox));
                        masks.push(polygon);
                    }
                    (masks, areas)
                }
            }
        };

        Ok(Detections {
            boxes,
            class_ids,
            masks,
            areas,
            annotation_ids: Vec::new(),
        })
    }

    /// Polygons with fewer than three points are emitted empty
    fn mask_polygon(&self, record: &DetectionRecord, mask: &InstanceMask) -> Vec<f64> {
        let polygon = match &mask.bitmap {
            // a raster without an outline is always reduced
            Some(bitmap) if self.config.minimize_points || mask.polygon.is_empty() => {
                if is_empty_mask(bitmap) {
                    debug!("Empty mask in {}, emitting an empty polygon", record.file_name);
                    return Vec::new();
                }
                minimize_contour(bitmap, record.width, record.height)
            }
            _ => flatten_points(&mask.polygon),
        };
        if polygon.len() < 6 {
            return Vec::new();
        }
        polygon
    }
}

/// Shoelace area of the model polygon (or the emitted one), box area when degenerate
fn mask_area(mask: &InstanceMask, polygon: &[f64], bbox: &[f64; 4]) -> f64 {
    let area = if mask.polygon.len() >= 3 {
        calculate_polygon_area(&flatten_points(&mask.polygon))
    } else {
        calculate_polygon_area(polygon)
    };
    if area > 0.0 {
        area
    } else {
        bbox_area(bbox)
    }
}

fn retain_flagged<T>(items: Vec<T>, keep: &[bool]) -> Vec<T> {
    items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, &kept)| kept.then_some(item))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::RawDetection;
    use image::GrayImage;

    fn vocabulary() -> CategoryVocabulary {
        CategoryVocabulary::from_pairs([(0, "person"), (1, "car")]).unwrap()
    }

    fn detection(bbox: [f32; 4], class_id: u32, score: f32) -> RawDetection {
        RawDetection {
            bbox,
            class_id,
            score,
        }
    }

    fn triangle() -> InstanceMask {
        InstanceMask {
            polygon: vec![[10.0, 20.0], [50.0, 20.0], [50.0, 80.0]],
            bitmap: None,
        }
    }

    fn segmenting(minimize_points: bool) -> AnnotationNormalizer {
        let config = NormalizerConfig {
            segment: true,
            minimize_points,
            thresholds: None,
        };
        AnnotationNormalizer::new(config, &vocabulary()).unwrap()
    }

    #[test]
    fn test_allocator_reserves_consecutive_ranges() {
        let mut ids = AnnotationIdAllocator::default();
        assert_eq!(ids.reserve(2), 1..3);
        assert_eq!(ids.reserve(0), 3..3);
        assert_eq!(ids.reserve(3), 3..6);
        assert_eq!(AnnotationIdAllocator::new(40).reserve(1), 40..41);
    }

    #[test]
    fn test_filter_by_class_threshold() {
        let config = NormalizerConfig {
            thresholds: Some([(0, 0.5), (1, 0.8)].into_iter().collect()),
            ..NormalizerConfig::default()
        };
        let normalizer = AnnotationNormalizer::new(config, &vocabulary()).unwrap();

        let prediction = Prediction {
            detections: vec![
                detection([0.0, 0.0, 1.0, 1.0], 0, 0.4),
                detection([0.0, 0.0, 2.0, 2.0], 1, 0.9),
            ],
            masks: None,
        };
        let filtered = normalizer.filter(prediction);
        assert_eq!(filtered.detections.len(), 1);
        assert_eq!(filtered.detections[0].class_id, 1);
    }

    #[test]
    fn test_filter_keeps_order_and_masks() {
        let config = NormalizerConfig {
            segment: true,
            thresholds: Some([(0, 0.5), (1, 0.5)].into_iter().collect()),
            ..NormalizerConfig::default()
        };
        let normalizer = AnnotationNormalizer::new(config, &vocabulary()).unwrap();
        let marker = |x: f32| InstanceMask {
            polygon: vec![[x, x]],
            bitmap: None,
        };

        let prediction = Prediction {
            detections: vec![
                detection([0.0; 4], 1, 0.9),
                detection([0.0; 4], 0, 0.1),
                detection([0.0; 4], 0, 0.7),
            ],
            masks: Some(vec![marker(1.0), marker(2.0), marker(3.0)]),
        };
        let filtered = normalizer.filter(prediction);
        let scores: Vec<f32> = filtered.detections.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
        let masks = filtered.masks.unwrap();
        assert_eq!(masks[0].polygon, vec![[1.0, 1.0]]);
        assert_eq!(masks[1].polygon, vec![[3.0, 3.0]]);
    }

    #[test]
    fn test_filter_without_thresholds_keeps_everything() {
        let normalizer =
            AnnotationNormalizer::new(NormalizerConfig::default(), &vocabulary()).unwrap();
        let prediction = Prediction {
            detections: vec![detection([0.0; 4], 0, 0.01), detection([0.0; 4], 1, 0.02)],
            masks: None,
        };
        assert_eq!(normalizer.filter(prediction.clone()), prediction);
    }

    #[test]
    fn test_new_rejects_incomplete_thresholds() {
        let config = NormalizerConfig {
            thresholds: Some([(0, 0.5)].into_iter().collect()),
            ..NormalizerConfig::default()
        };
        let err = AnnotationNormalizer::new(config, &vocabulary())
            .err()
            .unwrap();
        assert!(matches!(err, AnnotateError::VocabularyMismatch(_)));
    }

    #[test]
    fn test_normalize_boxes_classes_and_ids() {
        let normalizer =
            AnnotationNormalizer::new(NormalizerConfig::default(), &vocabulary()).unwrap();
        let mut ids = AnnotationIdAllocator::default();

        let mut first = DetectionRecord::new(1, "a.jpg", 100, 100)
            .with_pixels(image::RgbImage::new(100, 100));
        let prediction = Prediction {
            detections: vec![
                detection([10.0, 20.0, 50.0, 80.0], 0, 0.9),
                detection([0.0, 0.0, 10.0, 5.0], 1, 0.8),
            ],
            masks: None,
        };
        normalizer.normalize(&mut first, prediction, &mut ids).unwrap();

        let derived = first.detections().unwrap();
        assert_eq!(derived.boxes[0], [10.0, 20.0, 40.0, 60.0]);
        assert_eq!(derived.areas, vec![2400.0, 50.0]);
        assert_eq!(derived.class_ids, vec![1, 2]);
        assert_eq!(derived.annotation_ids, vec![1, 2]);
        assert!(derived.masks.is_empty());
        assert!(first.pixels().is_none());
        assert_eq!(first.is_crowd(), 0);

        let mut second = DetectionRecord::new(2, "b.jpg", 100, 100);
        let prediction = Prediction {
            detections: vec![detection([1.0, 1.0, 2.0, 2.0], 0, 0.9)],
            masks: None,
        };
        normalizer.normalize(&mut second, prediction, &mut ids).unwrap();
        assert_eq!(second.detections().unwrap().annotation_ids, vec![3]);
    }

    #[test]
    fn test_normalize_flattens_model_polygon() {
        let normalizer = segmenting(false);
        let mut record = DetectionRecord::new(1, "a.jpg", 100, 100);
        let prediction = Prediction {
            detections: vec![detection([10.0, 20.0, 50.0, 80.0], 0, 0.9)],
            masks: Some(vec![triangle()]),
        };
        normalizer
            .normalize(&mut record, prediction, &mut AnnotationIdAllocator::default())
            .unwrap();

        let derived = record.detections().unwrap();
        assert_eq!(derived.masks, vec![vec![10.0, 20.0, 50.0, 20.0, 50.0, 80.0]]);
        assert_eq!(derived.areas, vec![1200.0]);
    }

    #[test]
    fn test_normalize_minimizes_bitmap() {
        let normalizer = segmenting(true);
        let bitmap = GrayImage::from_fn(10, 10, |x, y| {
            image::Luma([u8::from((2..6).contains(&x) && (3..7).contains(&y))])
        });
        let mut record = DetectionRecord::new(1, "a.jpg", 10, 10);
        let prediction = Prediction {
            detections: vec![detection([2.0, 3.0, 6.0, 7.0], 0, 0.9)],
            masks: Some(vec![InstanceMask {
                polygon: Vec::new(),
                bitmap: Some(bitmap),
            }]),
        };
        normalizer
            .normalize(&mut record, prediction, &mut AnnotationIdAllocator::default())
            .unwrap();

        let derived = record.detections().unwrap();
        assert_eq!(derived.masks[0], vec![2.0, 3.0, 2.0, 6.0, 5.0, 6.0, 5.0, 3.0]);
        assert_eq!(derived.areas, vec![9.0]);
    }

    #[test]
    fn test_normalize_empty_bitmap_gives_empty_polygon() {
        let normalizer = segmenting(true);
        let mut record = DetectionRecord::new(1, "a.jpg", 10, 10);
        let prediction = Prediction {
            detections: vec![detection([0.0, 0.0, 4.0, 5.0], 0, 0.9)],
            masks: Some(vec![InstanceMask {
                polygon: Vec::new(),
                bitmap: Some(GrayImage::new(10, 10)),
            }]),
        };
        normalizer
            .normalize(&mut record, prediction, &mut AnnotationIdAllocator::default())
            .unwrap();

        let derived = record.detections().unwrap();
        assert_eq!(derived.masks, vec![Vec::<f64>::new()]);
        assert_eq!(derived.areas, vec![20.0]);
    }

    #[test]
    fn test_normalize_without_model_masks_uses_boxes() {
        let normalizer = segmenting(true);
        let mut record = DetectionRecord::new(1, "a.jpg", 100, 100);
        let prediction = Prediction {
            detections: vec![detection([10.0, 20.0, 50.0, 80.0], 0, 0.9)],
            masks: None,
        };
        normalizer
            .normalize(&mut record, prediction, &mut AnnotationIdAllocator::default())
            .unwrap();

        let derived = record.detections().unwrap();
        assert!(derived.masks.is_empty());
        assert_eq!(derived.areas, vec![2400.0]);
    }

    #[test]
    fn test_normalize_rejects_misaligned_masks() {
        let normalizer = segmenting(false);
        let mut record = DetectionRecord::new(4, "a.jpg", 100, 100);
        let prediction = Prediction {
            detections: vec![
                detection([0.0, 0.0, 1.0, 1.0], 0, 0.9),
                detection([0.0, 0.0, 2.0, 2.0], 0, 0.9),
            ],
            masks: Some(vec![triangle()]),
        };
        let mut ids = AnnotationIdAllocator::default();
        let err = normalizer
            .normalize(&mut record, prediction, &mut ids)
            .unwrap_err();
        assert!(matches!(err, AnnotateError::ShapeMismatch { image_id: 4, .. }));
        assert!(!record.is_populated());
        assert_eq!(ids.reserve(1), 1..2);
    }

    #[test]
    fn test_normalize_rejects_overflowing_class() {
        let normalizer =
            AnnotationNormalizer::new(NormalizerConfig::default(), &vocabulary()).unwrap();
        let mut record = DetectionRecord::new(3, "a.jpg", 10, 10);
        let prediction = Prediction {
            detections: vec![detection([0.0, 0.0, 1.0, 1.0], u32::MAX, 0.9)],
            masks: None,
        };
        let err = normalizer
            .normalize(&mut record, prediction, &mut AnnotationIdAllocator::default())
            .unwrap_err();
        assert!(matches!(
            err,
            AnnotateError::CategoryResolution {
                image_id: 3,
                class_index: u32::MAX
            }
        ));
        assert!(!record.is_populated());
    }

    #[test]
    fn test_degenerate_polygons_are_emitted_empty() {
        let single_pixel =
            GrayImage::from_fn(10, 10, |x, y| image::Luma([u8::from(x == 4 && y == 4)]));
        let masks = vec![
            InstanceMask {
                polygon: vec![[1.0, 1.0], [5.0, 5.0]],
                bitmap: None,
            },
            InstanceMask {
                polygon: Vec::new(),
                bitmap: Some(single_pixel),
            },
        ];
        let prediction = Prediction {
            detections: vec![
                detection([1.0, 1.0, 5.0, 5.0], 0, 0.9),
                detection([4.0, 4.0, 6.0, 7.0], 0, 0.9),
            ],
            masks: Some(masks),
        };

        let mut record = DetectionRecord::new(1, "a.jpg", 10, 10);
        segmenting(true)
            .normalize(&mut record, prediction, &mut AnnotationIdAllocator::default())
            .unwrap();

        let derived = record.detections().unwrap();
        assert_eq!(derived.masks, vec![Vec::<f64>::new(), Vec::new()]);
        assert_eq!(derived.areas, vec![16.0, 6.0]);
    }

    #[test]
    fn test_bitmap_without_outline_is_reduced() {
        let bitmap = GrayImage::from_fn(10, 10, |x, y| {
            image::Luma([u8::from((2..6).contains(&x) && (3..7).contains(&y))])
        });
        let prediction = Prediction {
            detections: vec![detection([2.0, 3.0, 6.0, 7.0], 0, 0.9)],
            masks: Some(vec![InstanceMask {
                polygon: Vec::new(),
                bitmap: Some(bitmap),
            }]),
        };

        let mut record = DetectionRecord::new(1, "a.jpg", 10, 10);
        segmenting(false)
            .normalize(&mut record, prediction, &mut AnnotationIdAllocator::default())
            .unwrap();
        assert_eq!(
            record.detections().unwrap().masks[0],
            vec![2.0, 3.0, 2.0, 6.0, 5.0, 6.0, 5.0, 3.0]
        );
    }

    struct SquareSegmenter;

    impl PromptSegmenter for SquareSegmenter {
        fn segment_box(&self, _record: &DetectionRecord, bbox: [f32; 4]) -> Result<InstanceMask> {
            let [x1, y1, x2, y2] = bbox;
            Ok(InstanceMask {
                polygon: vec![[x1, y1], [x2, y1], [x2, y2], [x1, y2]],
                bitmap: None,
            })
        }
    }

    #[test]
    fn test_prompt_segmenter_masks_have_zero_area() {
        let normalizer = segmenting(false).with_prompt_segmenter(Box::new(SquareSegmenter));
        assert!(normalizer.uses_prompt_segmenter());

        let mut record = DetectionRecord::new(1, "a.jpg", 100, 100);
        let prediction = Prediction {
            detections: vec![detection([10.0, 20.0, 50.0, 80.0], 1, 0.9)],
            masks: None,
        };
        normalizer
            .normalize(&mut record, prediction, &mut AnnotationIdAllocator::default())
            .unwrap();

        let derived = record.detections().unwrap();
        assert_eq!(
            derived.masks,
            vec![vec![10.0, 20.0, 50.0, 20.0, 50.0, 80.0, 10.0, 80.0]]
        );
        assert_eq!(derived.areas, vec![0.0]);
    }

    #[test]
    fn test_normalize_filtered_uses_reserved_range() {
        let normalizer =
            AnnotationNormalizer::new(NormalizerConfig::default(), &vocabulary()).unwrap();
        let mut record = DetectionRecord::new(1, "a.jpg", 100, 100);
        let prediction = Prediction {
            detections: vec![detection([0.0; 4], 0, 0.9), detection([0.0; 4], 1, 0.9)],
            masks: None,
        };
        normalizer
            .normalize_filtered(&mut record, prediction.clone(), 10..12)
            .unwrap();
        assert_eq!(record.detections().unwrap().annotation_ids, vec![10, 11]);

        let mut short = DetectionRecord::new(2, "b.jpg", 100, 100);
        let err = normalizer
            .normalize_filtered(&mut short, prediction, 12..13)
            .unwrap_err();
        assert!(matches!(err, AnnotateError::ShapeMismatch { .. }));
    }
}
