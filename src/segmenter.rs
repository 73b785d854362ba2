//! Box-prompted segmentation without a model
//!
//! [`ThresholdPromptSegmenter`] splits the pixels inside a detection box into
//! foreground and background with Otsu's level. It gives `--box_prompt` runs a
//! working segmenter when no zero-shot model is plugged in.

use image::imageops;
use image::{GrayImage, Luma};
use imageproc::contrast::otsu_level;
use log::debug;

use crate::error::{AnnotateError, Result};
use crate::predictor::{InstanceMask, PromptSegmenter};
use crate::types::DetectionRecord;

#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdPromptSegmenter;

impl ThresholdPromptSegmenter {
    /// Pixel window `(x, y, width, height)` covered by a corner box, clamped to the image
    fn window(bbox: [f32; 4], width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp = |v: f32, max: u32| (v.max(0.0) as u32).min(max);
        let x0 = clamp(bbox[0].floor(), width);
        let y0 = clamp(bbox[1].floor(), height);
        let x1 = clamp(bbox[2].ceil(), width);
        let y1 = clamp(bbox[3].ceil(), height);
        (x1 > x0 && y1 > y0).then(|| (x0, y0, x1 - x0, y1 - y0))
    }
}

/// True when most pixels on the crop's border are foreground
fn border_is_foreground(crop: &GrayImage, level: u8) -> bool {
    let (w, h) = crop.dimensions();
    let mut total = 0usize;
    let mut foreground = 0usize;
    for (x, y, pixel) in crop.enumerate_pixels() {
        if x == 0 || y == 0 || x + 1 == w || y + 1 == h {
            total += 1;
            if pixel[0] > level {
                foreground += 1;
            }
        }
    }
    foreground * 2 > total
}

impl PromptSegmenter for ThresholdPromptSegmenter {
    fn segment_box(&self, record: &DetectionRecord, bbox: [f32; 4]) -> Result<InstanceMask> {
        let pixels = record
            .pixels()
            .ok_or_else(|| AnnotateError::segmenter(&record.file_name, "pixels are not loaded"))?;
        let (width, height) = pixels.dimensions();

        let Some((x, y, w, h)) = Self::window(bbox, width, height) else {
            debug!("Box {:?} of {} covers no pixels", bbox, record.file_name);
            return Ok(InstanceMask::default());
        };

        let crop = imageops::grayscale(&imageops::crop_imm(pixels, x, y, w, h).to_image());
        let level = otsu_level(&crop);
        // the object is whichever side does not touch the box border
        let invert = border_is_foreground(&crop, level);

        let mut bitmap = GrayImage::new(width, height);
        for (cx, cy, pixel) in crop.enumerate_pixels() {
            if (pixel[0] > level) != invert {
                bitmap.put_pixel(x + cx, y + cy, Luma([1]));
            }
        }

        Ok(InstanceMask {
            polygon: Vec::new(),
            bitmap: Some(bitmap),
        })
    }
}
