use glob::{glob, Pattern};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::coco::CocoFile;
use crate::error::{AnnotateError, Result};
use crate::types::{get_image_extensions_set, CategoryVocabulary, DetectionRecord};

pub const ANNOTATIONS_DIR: &str = "annotations";
pub const COCO_FILE_NAME: &str = "instances_default.json";
pub const CVAT_LABELS_FILE_NAME: &str = "cvat_labels.json";

/// Images of one folder, ordered by file name, with ids starting at 1
#[derive(Debug, Clone)]
pub struct DirectoryImageSource {
    directory: PathBuf,
    load_pixels: bool,
}

impl DirectoryImageSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            load_pixels: false,
        }
    }

    /// Decode pixels into each record before prediction
    pub fn with_pixels(mut self, load_pixels: bool) -> Self {
        self.load_pixels = load_pixels;
        self
    }

    /// Image paths directly inside the folder, sorted by file name
    pub fn image_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.directory.is_dir() {
            return Err(AnnotateError::Config(format!(
                "image folder {} does not exist",
                self.directory.display()
            )));
        }

        let pattern = format!("{}/*", Pattern::escape(&self.directory.to_string_lossy()));
        let entries = glob(&pattern)
            .map_err(|e| AnnotateError::Config(format!("bad image pattern {}: {}", pattern, e)))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| get_image_extensions_set().contains(&ext.to_lowercase()))
            })
            .collect();
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(paths)
    }

    /// One empty record per image, dimensions read from the file headers
    pub fn records(&self) -> Result<Vec<DetectionRecord>> {
        let paths = self.image_paths()?;
        debug!(
            "Found {} images in {}",
            paths.len(),
            self.directory.display()
        );

        paths
            .par_iter()
            .enumerate()
            .map(|(i, path)| -> Result<DetectionRecord> {
                let (width, height) = image::image_dimensions(path)?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(DetectionRecord::new(i as u32 + 1, file_name, width, height))
            })
            .collect()
    }

    /// Attach decoded pixels when this source was asked to load them
    pub fn load_pixels(&self, record: &mut DetectionRecord) -> Result<()> {
        if self.load_pixels && record.pixels().is_none() {
            let pixels = image::open(self.directory.join(&record.file_name))?.to_rgb8();
            record.set_pixels(pixels);
        }
        Ok(())
    }
}

/// Write the COCO document to `<output>/annotations/instances_default.json`
pub fn write_coco_file(output_dir: &Path, coco: &CocoFile) -> Result<PathBuf> {
    let annotations_dir = output_dir.join(ANNOTATIONS_DIR);
    fs::create_dir_all(&annotations_dir)?;

    let path = annotations_dir.join(COCO_FILE_NAME);
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer(&mut writer, coco)?;
    info!("Wrote {}", path.display());
    Ok(path)
}

/// One label of a CVAT project definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvatLabel {
    pub name: String,
    pub id: usize,
    pub color: String,
    #[serde(rename = "type")]
    pub label_type: String,
    pub attributes: Vec<serde_json::Value>,
}

/// Labels in vocabulary order with seeded random colors
pub fn cvat_labels(vocabulary: &CategoryVocabulary, seed: u64) -> Vec<CvatLabel> {
    let mut rng = StdRng::seed_from_u64(seed);
    vocabulary
        .entries()
        .enumerate()
        .map(|(id, (name, _))| CvatLabel {
            name: name.to_string(),
            id,
            color: format!("#{:06X}", rng.gen_range(0..0x0100_0000u32)),
            label_type: "any".to_string(),
            attributes: Vec::new(),
        })
        .collect()
}

/// Write the CVAT label list next to the annotations
pub fn write_cvat_labels(
    output_dir: &Path,
    vocabulary: &CategoryVocabulary,
    seed: u64,
) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(CVAT_LABELS_FILE_NAME);
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, &cvat_labels(vocabulary, seed))?;
    info!("Wrote {}", path.display());
    Ok(path)
}
