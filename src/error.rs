//! Error type shared by the normalizer, the assembler and the bundled collaborators

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, AnnotateError>;

#[derive(Error, Debug)]
pub enum AnnotateError {
    /// Derived per-detection arrays of a record disagree in length
    #[error(
        "shape mismatch for image {image_id}: boxes={boxes}, class_ids={class_ids}, areas={areas}, annotation_ids={annotation_ids}, masks={masks}"
    )]
    ShapeMismatch {
        image_id: u32,
        boxes: usize,
        class_ids: usize,
        areas: usize,
        annotation_ids: usize,
        masks: usize,
    },

    /// Threshold map and vocabulary do not describe the same class indices
    #[error("vocabulary mismatch: {0}")]
    VocabularyMismatch(String),

    /// A detection refers to a class index no category name aliases
    #[error("class index {class_index} of image {image_id} does not belong to any category")]
    CategoryResolution { image_id: u32, class_index: u32 },

    #[error("image {0} has already been populated")]
    AlreadyPopulated(u32),

    #[error("predictor failed on {file_name}: {message}")]
    Predictor { file_name: String, message: String },

    #[error("prompt segmenter failed on {file_name}: {message}")]
    Segmenter { file_name: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl AnnotateError {
    pub fn predictor(file_name: &str, message: impl ToString) -> Self {
        AnnotateError::Predictor {
            file_name: file_name.to_string(),
            message: message.to_string(),
        }
    }

    pub fn segmenter(file_name: &str, message: impl ToString) -> Self {
        AnnotateError::Segmenter {
            file_name: file_name.to_string(),
            message: message.to_string(),
        }
    }
}
