use super::IndexedExample;
use crate::{
    common::*,
    logging::LoggingMessage,
    utils::{tile_patches, to_display_range},
};
use patch_dl::processor::random_flip;

/// Send debug images once per this number of examples.
const DEBUG_IMAGE_INTERVAL: usize = 1000;

/// The preprocessed patches of one example.
#[derive(Debug, TensorLike)]
pub struct Sample {
    pub index: usize,
    pub epoch: usize,
    /// Patches of shape `[num_points, c, h, w]`.
    pub patches: Tensor,
    pub label: i64,
    #[tensor_like(clone)]
    pub timing: Timing,
}

/// The worker that turns examples into patches.
#[derive(Debug)]
pub struct PreprocessWorker {
    pub thread_id: usize,
    pub train: bool,
    /// Labels must be in range `[0, num_classes)`.
    pub num_classes: i64,
    pub flip_prob: f64,
    pub preprocessor: Arc<ImagePreprocessor>,
    pub cropper: Arc<PatchCropper>,
    /// Debug images are sent if set.
    pub logging_tx: Option<broadcast::Sender<LoggingMessage>>,
    pub rng: StdRng,
}

impl PreprocessWorker {
    pub fn run(
        mut self,
        rx: flume::Receiver<Result<IndexedExample>>,
        tx: flume::Sender<Result<Sample>>,
    ) {
        let mut count = 0;

        for item in rx.iter() {
            let result = item.and_then(|example| {
                let index = example.index;
                let log_images = count % DEBUG_IMAGE_INTERVAL == 0;
                self.process(example, log_images)
                    .with_context(|| format!("failed to preprocess record {}", index))
            });
            count += 1;

            let failed = result.is_err();
            if tx.send(result).is_err() || failed {
                return;
            }
        }
    }

    fn process(&mut self, example: IndexedExample, log_images: bool) -> Result<Sample> {
        let IndexedExample {
            index,
            epoch,
            example,
        } = example;
        let mut timing = Timing::new("preprocess");

        let record = ExampleRecord::from_example(&example)?;
        ensure!(
            (0..self.num_classes).contains(&record.label),
            "label {} is out of range [0, {})",
            record.label,
            self.num_classes
        );
        let image = record.image_tensor()?;
        timing.add_event("decode");

        tch::no_grad(|| {
            let (flipped, points, _) =
                random_flip(&image, &record.points, self.flip_prob, &mut self.rng)?;
            let processed = self.preprocessor.forward(
                &flipped,
                Some(&FULL_IMAGE_BBOX),
                self.train,
                self.thread_id,
                &mut self.rng,
            )?;
            let patches = self
                .cropper
                .extract(&processed, &points, self.train, &mut self.rng)?;
            timing.add_event("augment");

            if log_images {
                if let Some(logging_tx) = &self.logging_tx {
                    let divided = tile_patches(&to_display_range(&patches), 4)?;
                    let images = vec![image.shallow_clone(), flipped, divided];
                    let tags = ["original_image", "flipped_image", "divided_final"];
                    for (tag, image) in tags.into_iter().zip(images) {
                        // the logger may be gone or lagging, which is not an input failure
                        let _ = logging_tx.send(LoggingMessage::new_debug_images(tag, [image]));
                    }
                }
            }

            Ok(Sample {
                index,
                epoch,
                patches,
                label: record.label,
                timing,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patch_dl::record::{DEFAULT_LABEL, IMAGE_SIZE, NUM_CHANNELS};

    fn worker(train: bool) -> Result<PreprocessWorker> {
        Ok(PreprocessWorker {
            thread_id: 1,
            train,
            num_classes: 600,
            flip_prob: 0.5,
            preprocessor: Arc::new(ImagePreprocessor::new(ColorDistortInit::default().build()?)),
            cropper: Arc::new(PatchCropperInit::default().build()?),
            logging_tx: None,
            rng: StdRng::seed_from_u64(0),
        })
    }

    fn example(label: i64, points: [[i32; 2]; NUM_POINTS]) -> IndexedExample {
        let record = ExampleRecord {
            image: vec![128; IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS],
            label,
            points,
            text: None,
        };
        IndexedExample {
            index: label as usize,
            epoch: 0,
            example: record.to_example(),
        }
    }

    #[test]
    fn process_examples() -> Result<()> {
        for train in [true, false] {
            let mut worker = worker(train)?;
            let sample = worker.process(example(7, [[100, 120]; NUM_POINTS]), false)?;
            assert_eq!(sample.patches.size(), vec![13, 3, 30, 30]);
            assert_eq!(sample.label, 7);
            assert_eq!(sample.index, 7);
            ensure!(f64::from(sample.patches.abs().max()) <= 1.0);
        }
        Ok(())
    }

    #[test]
    fn reject_out_of_range_labels() -> Result<()> {
        let mut worker = worker(false)?;
        let points = [[100, 120]; NUM_POINTS];

        for label in [DEFAULT_LABEL, 600] {
            let mut example = example(0, points);
            example.example = ExampleRecord {
                image: vec![128; IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS],
                label,
                points,
                text: None,
            }
            .to_example();
            let err = worker.process(example, false).unwrap_err();
            assert!(format!("{:#}", err).contains("out of range"), "{:#}", err);
        }

        assert!(worker.process(example(599, points), false).is_ok());
        Ok(())
    }

    #[test]
    fn stop_at_malformed_example() -> Result<()> {
        let (example_tx, example_rx) = flume::unbounded();
        let (sample_tx, sample_rx) = flume::unbounded();

        let mut points = [[100, 120]; NUM_POINTS];
        points[4] = [500, 0];
        example_tx.send(Ok(example(0, [[10, 10]; NUM_POINTS]))).unwrap();
        example_tx.send(Ok(example(1, points))).unwrap();
        example_tx.send(Ok(example(2, [[10, 10]; NUM_POINTS]))).unwrap();
        drop(example_tx);

        worker(false)?.run(example_rx, sample_tx);

        let results: Vec<_> = sample_rx.iter().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let message = format!("{:#}", results[1].as_ref().unwrap_err());
        assert!(message.contains("record 1"), "{}", message);
        Ok(())
    }
}
