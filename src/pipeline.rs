//! End-to-end annotation run
//!
//! Images are predicted and normalized one by one (or on a rayon pool when
//! more than one worker is requested), then assembled into a single COCO
//! document. Annotation ids are reserved in file order in both modes, so a
//! parallel run numbers annotations exactly like a sequential one.

use log::{debug, info, warn};
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::assembler::CocoAssembler;
use crate::config::{Args, ClassConfig, FailurePolicy};
use crate::error::{AnnotateError, Result};
use crate::io::{write_coco_file, write_cvat_labels, DirectoryImageSource};
use crate::normalizer::{AnnotationIdAllocator, AnnotationNormalizer};
use crate::predictor::{PredictOptions, Prediction, Predictor, RecordedPredictor};
use crate::segmenter::ThresholdPromptSegmenter;
use crate::types::DetectionRecord;
use crate::utils::{create_output_directory, create_progress_bar};

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub images: usize,
    pub annotated: usize,
    pub skipped: usize,
    pub annotations: usize,
    /// Written COCO file, set by [`run`]
    pub coco_path: Option<PathBuf>,
}

pub struct Annotator<'a> {
    source: &'a DirectoryImageSource,
    predictor: &'a (dyn Predictor + Sync),
    normalizer: &'a AnnotationNormalizer,
    options: PredictOptions,
    policy: FailurePolicy,
    workers: usize,
}

impl<'a> Annotator<'a> {
    pub fn new(
        source: &'a DirectoryImageSource,
        predictor: &'a (dyn Predictor + Sync),
        normalizer: &'a AnnotationNormalizer,
        options: PredictOptions,
    ) -> Self {
        Self {
            source,
            predictor,
            normalizer,
            options,
            policy: FailurePolicy::default(),
            workers: 1,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Populate every record, drawing annotation ids from `ids`
    pub fn run(
        &self,
        records: &mut [DetectionRecord],
        ids: &mut AnnotationIdAllocator,
    ) -> Result<RunSummary> {
        if self.normalizer.config().segment
            && !self.predictor.supports_segmentation()
            && !self.normalizer.uses_prompt_segmenter()
        {
            warn!("The predictor cannot segment; annotations will carry boxes only");
        }

        let mut summary = RunSummary {
            images: records.len(),
            ..RunSummary::default()
        };

        if self.workers > 1 {
            self.run_parallel(records, ids, &mut summary)?;
        } else {
            self.run_sequential(records, ids, &mut summary)?;
        }

        info!(
            "Annotated {} of {} images ({} skipped), {} annotations",
            summary.annotated, summary.images, summary.skipped, summary.annotations
        );
        Ok(summary)
    }

    fn run_sequential(
        &self,
        records: &mut [DetectionRecord],
        ids: &mut AnnotationIdAllocator,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let pb = create_progress_bar(records.len() as u64, "Annotating");
        for record in records.iter_mut() {
            let outcome = self.predict(record).and_then(|filtered| {
                let range = ids.reserve(filtered.len());
                self.populate(record, filtered, range)
            });
            self.settle(record, outcome, summary)?;
            pb.inc(1);
        }
        pb.finish_with_message("Annotation complete");
        Ok(())
    }

    fn run_parallel(
        &self,
        records: &mut [DetectionRecord],
        ids: &mut AnnotationIdAllocator,
        summary: &mut RunSummary,
    ) -> Result<()> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| AnnotateError::Config(format!("cannot start worker pool: {}", e)))?;
        debug!("Annotating on {} workers", self.workers);

        let pb = create_progress_bar(records.len() as u64, "Predicting");
        let predictions: Vec<Result<Prediction>> = pool.install(|| {
            records
                .par_iter_mut()
                .map(|record| {
                    let prediction = self.predict(record);
                    // reloaded per image when populating
                    record.release_pixels();
                    pb.inc(1);
                    prediction
                })
                .collect()
        });
        pb.finish_with_message("Prediction complete");

        // ids follow file order regardless of completion order
        let mut staged: Vec<Option<(Prediction, Range<u64>)>> = Vec::with_capacity(records.len());
        for (record, prediction) in records.iter_mut().zip(predictions) {
            match prediction {
                Ok(filtered) => {
                    let range = ids.reserve(filtered.len());
                    staged.push(Some((filtered, range)));
                }
                Err(e) => {
                    self.settle(record, Err(e), summary)?;
                    staged.push(None);
                }
            }
        }

        let pb = create_progress_bar(records.len() as u64, "Normalizing");
        let outcomes: Vec<Option<Result<()>>> = pool.install(|| {
            records
                .par_iter_mut()
                .zip(staged.into_par_iter())
                .map(|(record, staged)| {
                    let outcome = staged
                        .map(|(filtered, range)| self.populate(record, filtered, range));
                    pb.inc(1);
                    outcome
                })
                .collect()
        });
        pb.finish_with_message("Annotation complete");

        for (record, outcome) in records.iter_mut().zip(outcomes) {
            if let Some(outcome) = outcome {
                self.settle(record, outcome, summary)?;
            }
        }
        Ok(())
    }

    /// Load pixels, predict and filter one image
    fn predict(&self, record: &mut DetectionRecord) -> Result<Prediction> {
        self.source.load_pixels(record)?;
        let prediction = self.predictor.predict(record, &self.options)?;
        Ok(self.normalizer.filter(prediction))
    }

    fn populate(
        &self,
        record: &mut DetectionRecord,
        filtered: Prediction,
        ids: Range<u64>,
    ) -> Result<()> {
        if self.normalizer.uses_prompt_segmenter() {
            self.source.load_pixels(record)?;
        }
        self.normalizer.normalize_filtered(record, filtered, ids)
    }

    fn settle(
        &self,
        record: &mut DetectionRecord,
        outcome: Result<()>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        match outcome {
            Ok(()) => {
                summary.annotated += 1;
                summary.annotations += record.detections().map_or(0, |d| d.len());
                Ok(())
            }
            Err(e) => {
                record.release_pixels();
                match self.policy {
                    FailurePolicy::Abort => Err(e),
                    FailurePolicy::Skip => {
                        warn!("Skipping {}: {}", record.file_name, e);
                        summary.skipped += 1;
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Run the whole conversion described by the command-line arguments
pub fn run(args: &Args) -> Result<RunSummary> {
    let class_config = ClassConfig::load(Path::new(&args.classes))?;
    let vocabulary = class_config.vocabulary()?;
    let thresholds = class_config.thresholds(&vocabulary)?;
    let mut normalizer =
        AnnotationNormalizer::new(args.normalizer_config(thresholds), &vocabulary)?;
    if args.box_prompt {
        normalizer = normalizer.with_prompt_segmenter(Box::new(ThresholdPromptSegmenter));
    }
    info!(
        "Loaded {} categories from {}",
        vocabulary.len(),
        args.classes
    );

    let source = DirectoryImageSource::new(&args.img_folder).with_pixels(args.box_prompt);
    let predictor = RecordedPredictor::open(&args.predictions, args.segment)?;
    let mut records = source.records()?;
    if records.is_empty() {
        warn!("No images found in {}", args.img_folder);
    }

    let annotator = Annotator::new(
        &source,
        &predictor,
        &normalizer,
        args.predict_options(&vocabulary),
    )
    .with_policy(args.on_error)
    .with_workers(args.workers);
    let mut ids = AnnotationIdAllocator::new(args.start_annotation_id);
    let mut summary = annotator.run(&mut records, &mut ids)?;

    let coco = CocoAssembler::new(&vocabulary).assemble(&records)?;
    let output_dir = create_output_directory(Path::new(&args.output))?;
    summary.coco_path = Some(write_coco_file(&output_dir, &coco)?);
    if args.cvat_labels {
        write_cvat_labels(&output_dir, &vocabulary, args.seed)?;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::NormalizerConfig;
    use crate::predictor::RawDetection;
    use crate::types::CategoryVocabulary;

    /// Two boxes per image, fails on file names containing "bad"
    struct FixedPredictor;

    impl Predictor for FixedPredictor {
        fn supports_segmentation(&self) -> bool {
            false
        }

        fn predict(&self, record: &DetectionRecord, _options: &PredictOptions) -> Result<Prediction> {
            if record.file_name.contains("bad") {
                return Err(AnnotateError::predictor(&record.file_name, "model crashed"));
            }
            let detection = |class_id, score| RawDetection {
                bbox: [0.0, 0.0, 10.0, 10.0],
                class_id,
                score,
            };
            Ok(Prediction {
                detections: vec![detection(0, 0.9), detection(1, 0.3)],
                masks: None,
            })
        }
    }

    fn records(names: &[&str]) -> Vec<DetectionRecord> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| DetectionRecord::new(i as u32 + 1, *name, 10, 10))
            .collect()
    }

    fn normalizer() -> AnnotationNormalizer {
        let vocabulary = CategoryVocabulary::from_pairs([(0, "a"), (1, "b")]).unwrap();
        let config = NormalizerConfig {
            thresholds: Some([(0, 0.5), (1, 0.2)].into_iter().collect()),
            ..NormalizerConfig::default()
        };
        AnnotationNormalizer::new(config, &vocabulary).unwrap()
    }

    fn annotation_ids(records: &[DetectionRecord]) -> Vec<Vec<u64>> {
        records
            .iter()
            .map(|r| {
                r.detections()
                    .map(|d| d.annotation_ids.clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    #[test]
    fn test_sequential_ids_increase_across_images() {
        let source = DirectoryImageSource::new(".");
        let normalizer = normalizer();
        let annotator =
            Annotator::new(&source, &FixedPredictor, &normalizer, PredictOptions::default());

        let mut records = records(&["a.jpg", "b.jpg", "c.jpg"]);
        let summary = annotator
            .run(&mut records, &mut AnnotationIdAllocator::default())
            .unwrap();

        assert_eq!(summary.annotated, 3);
        assert_eq!(summary.annotations, 6);
        assert_eq!(
            annotation_ids(&records),
            vec![vec![1, 2], vec![3, 4], vec![5, 6]]
        );
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let source = DirectoryImageSource::new(".");
        let normalizer = normalizer();
        let names = ["a.jpg", "bad.jpg", "c.jpg", "d.jpg", "e.jpg"];

        let mut sequential = records(&names);
        Annotator::new(&source, &FixedPredictor, &normalizer, PredictOptions::default())
            .with_policy(FailurePolicy::Skip)
            .run(&mut sequential, &mut AnnotationIdAllocator::new(100))
            .unwrap();

        let mut parallel = records(&names);
        let summary =
            Annotator::new(&source, &FixedPredictor, &normalizer, PredictOptions::default())
                .with_policy(FailurePolicy::Skip)
                .with_workers(4)
                .run(&mut parallel, &mut AnnotationIdAllocator::new(100))
                .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(annotation_ids(&sequential), annotation_ids(&parallel));
        assert_eq!(annotation_ids(&parallel)[0], vec![100, 101]);
        assert!(annotation_ids(&parallel)[1].is_empty());
        assert_eq!(annotation_ids(&parallel)[2], vec![102, 103]);
    }

    #[test]
    fn test_abort_policy_stops_run() {
        let source = DirectoryImageSource::new(".");
        let normalizer = normalizer();
        let annotator =
            Annotator::new(&source, &FixedPredictor, &normalizer, PredictOptions::default());

        let mut records = records(&["a.jpg", "bad.jpg", "c.jpg"]);
        let err = annotator
            .run(&mut records, &mut AnnotationIdAllocator::default())
            .unwrap_err();
        assert!(matches!(err, AnnotateError::Predictor { .. }));
        assert!(records[0].is_populated());
        assert!(!records[2].is_populated());
    }
}
