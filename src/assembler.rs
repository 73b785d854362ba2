use log::debug;

use crate::coco::{Annotation, Attributes, Category, CocoFile, Image};
use crate::error::{AnnotateError, Result};
use crate::types::{CategoryVocabulary, DetectionRecord};

/// Builds one COCO document from populated detection records
pub struct CocoAssembler<'a> {
    vocabulary: &'a CategoryVocabulary,
}

impl<'a> CocoAssembler<'a> {
    pub fn new(vocabulary: &'a CategoryVocabulary) -> Self {
        Self { vocabulary }
    }

    /// One category per distinct name, id is one past its smallest aliased index
    pub fn categories(&self) -> Vec<Category> {
        self.vocabulary
            .entries()
            .map(|(name, aliases)| Category {
                id: aliases[0] + 1,
                name: name.to_string(),
                supercategory: String::new(),
            })
            .collect()
    }

    /// Records are emitted in the given order; unpopulated ones contribute only their image
    pub fn assemble(&self, records: &[DetectionRecord]) -> Result<CocoFile> {
        let mut coco = CocoFile {
            categories: self.categories(),
            ..CocoFile::default()
        };

        for record in records {
            coco.images.push(Image::new(
                record.image_id,
                record.file_name.clone(),
                record.width,
                record.height,
            ));

            let Some(detections) = record.detections() else {
                debug!("Image {} has no annotations", record.file_name);
                continue;
            };

            for i in 0..detections.len() {
                let class_index = detections.class_ids[i];
                // class_ids are 1-based, the vocabulary is keyed by raw indices
                let category_id = class_index
                    .checked_sub(1)
                    .and_then(|raw| self.vocabulary.category_id(raw))
                    .ok_or(AnnotateError::CategoryResolution {
                        image_id: record.image_id,
                        class_index,
                    })?;

                // fewer than three points is not a polygon
                let polygon = detections.masks.get(i).filter(|mask| mask.len() >= 6);
                let (segmentation, attributes) = match polygon {
                    Some(polygon) => (vec![polygon.clone()], Attributes::polygon()),
                    None => (Vec::new(), Attributes::bbox()),
                };

                coco.annotations.push(Annotation {
                    id: detections.annotation_ids[i],
                    image_id: record.image_id,
                    category_id,
                    segmentation,
                    bbox: detections.boxes[i],
                    area: detections.areas[i],
                    iscrowd: record.is_crowd(),
                    attributes,
                });
            }
        }

        Ok(coco)
    }
}
