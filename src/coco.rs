//! COCO format data structures and geometry helpers
//!
//! The document layout follows what CVAT expects when importing a
//! "COCO 1.0" annotation file: placeholder license/info blocks plus
//! per-annotation `attributes`.

use serde::{Deserialize, Serialize};

/// COCO dataset information, left blank on export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub contributor: String,
    pub date_created: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub year: String,
}

/// COCO license information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub name: String,
    pub id: u32,
    pub url: String,
}

/// COCO category information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: u32,
    pub name: String,
    pub supercategory: String,
}

/// COCO image information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub file_name: String,
    pub license: u32,
    pub flickr_url: String,
    pub coco_url: String,
    pub date_captured: u32,
}

impl Image {
    pub fn new(id: u32, file_name: String, width: u32, height: u32) -> Self {
        Self {
            id,
            width,
            height,
            file_name,
            license: 0,
            flickr_url: String::new(),
            coco_url: String::new(),
            date_captured: 0,
        }
    }
}

/// CVAT annotation attributes; `rotation` only exists on box-only annotations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub occluded: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rotation: Option<u32>,
}

impl Attributes {
    pub fn polygon() -> Self {
        Self {
            occluded: false,
            rotation: None,
        }
    }

    pub fn bbox() -> Self {
        Self {
            occluded: false,
            rotation: Some(0),
        }
    }
}

/// COCO annotation information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: u64,
    pub image_id: u32,
    pub category_id: u32,
    pub segmentation: Vec<Vec<f64>>,
    pub bbox: [f64; 4], // [x, y, width, height]
    pub area: f64,
    pub iscrowd: u8,
    pub attributes: Attributes,
}

/// Complete COCO dataset structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoFile {
    pub licenses: Vec<License>,
    pub info: Info,
    pub categories: Vec<Category>,
    pub images: Vec<Image>,
    pub annotations: Vec<Annotation>,
}

impl Default for CocoFile {
    fn default() -> Self {
        Self {
            licenses: vec![License::default()],
            info: Info::default(),
            categories: Vec::new(),
            images: Vec::new(),
            annotations: Vec::new(),
        }
    }
}

/// Calculate polygon area using the shoelace formula
pub fn calculate_polygon_area(polygon: &[f64]) -> f64 {
    if polygon.len() < 6 || polygon.len() % 2 != 0 {
        return 0.0;
    }

    let mut area = 0.0;
    let n = polygon.len() / 2;

    for i in 0..n {
        let j = (i + 1) % n;
        let x_i = polygon[i * 2];
        let y_i = polygon[i * 2 + 1];
        let x_j = polygon[j * 2];
        let y_j = polygon[j * 2 + 1];
        area += x_i * y_j - x_j * y_i;
    }

    area.abs() / 2.0
}

/// Convert a corner box `[x1, y1, x2, y2]` to `[x, y, width, height]`
pub fn corners_to_xywh(bbox: [f32; 4]) -> [f64; 4] {
    let [x1, y1, x2, y2] = bbox.map(f64::from);
    [x1, y1, x2 - x1, y2 - y1]
}

/// Area of an `[x, y, width, height]` box
pub fn bbox_area(bbox: &[f64; 4]) -> f64 {
    bbox[2] * bbox[3]
}

/// Flatten `(x, y)` points into `x1, y1, x2, y2, ...`
pub fn flatten_points(points: &[[f32; 2]]) -> Vec<f64> {
    points
        .iter()
        .flat_map(|&[x, y]| [f64::from(x), f64::from(y)])
        .collect()
}
