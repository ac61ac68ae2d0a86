//! The multi-threaded input pipeline.
//!
//! The pipeline is a chain of threads connected by bounded channels.
//!
//! ```text
//! filename-producer -> reader-N -> example-queue -> preprocess-N -> batch-joiner
//! ```
//!
//! Every stage blocks when the downstream channel is full. The first error
//! of any stage is passed downstream as an `Err` item and ends the stream.
//! Dropping the [BatchReceiver] disconnects the last channel, which in turn
//! stops every upstream thread.

mod batch_joiner;
mod example_queue;
mod preprocess_worker;
mod reader;

pub use batch_joiner::*;
pub use example_queue::*;
pub use preprocess_worker::*;
pub use reader::*;

use crate::{
    common::*,
    config::{Config, InputConfig, PreprocessorConfig},
    logging::LoggingMessage,
};
use std::panic::{self, AssertUnwindSafe};

/// The number of examples assumed in one record file.
pub const EXAMPLES_PER_SHARD: usize = 1024;
/// The capacity of the filename queue in training.
pub const TRAIN_FILENAME_QUEUE_SIZE: usize = 16;
/// The capacity of the filename queue in evaluation.
pub const EVAL_FILENAME_QUEUE_SIZE: usize = 1;

/// The batch that is accepted by the training worker.
#[derive(Debug, TensorLike)]
pub struct TrainingRecord {
    pub epoch: usize,
    pub step: usize,
    /// Patches of shape `[batch, num_points, c, h, w]`.
    pub image: Tensor,
    /// Labels of shape `[batch]` in `i64`.
    pub labels: Tensor,
    #[tensor_like(clone)]
    pub timing: Timing,
}

/// The input pipeline options.
#[derive(Debug, Clone)]
pub struct InputStreamInit {
    /// The glob pattern of record files.
    pub files: String,
    pub batch_size: usize,
    /// Labels must be in range `[0, num_classes)`.
    pub num_classes: usize,
    /// Selects training or evaluation preprocessing.
    pub train: bool,
    pub input: InputConfig,
    pub preprocessor: PreprocessorConfig,
}

impl InputStreamInit {
    pub fn build(
        self,
        logging_tx: Option<broadcast::Sender<LoggingMessage>>,
    ) -> Result<InputStream> {
        let Self {
            files,
            batch_size,
            num_classes,
            train,
            input,
            preprocessor:
                PreprocessorConfig {
                    color_distort,
                    patch_cropper,
                },
        } = self;

        ensure!(batch_size >= 1, "batch_size must be positive");
        ensure!(num_classes >= 1, "num_classes must be positive");
        ensure!(
            !input.ordered || input.num_readers.get() == 1,
            "ordered input requires exactly one reader, but get {}",
            input.num_readers
        );
        ensure!(
            input.num_preprocess_threads > 0 && input.num_preprocess_threads % 4 == 0,
            "please make num_preprocess_threads a multiple of 4, but get {}",
            input.num_preprocess_threads
        );
        ensure!(
            (0.0..=1.0).contains(&input.flip_prob.raw()),
            "flip_prob must be in range [0, 1]"
        );

        let files = RecordFiles::glob(files)?;
        let preprocessor = ImagePreprocessor::new(color_distort.build()?);
        let cropper = patch_cropper.build()?;

        Ok(InputStream {
            files: Arc::new(files),
            batch_size,
            num_classes: num_classes as i64,
            train,
            input,
            preprocessor: Arc::new(preprocessor),
            cropper: Arc::new(cropper),
            logging_tx,
        })
    }
}

/// The input pipeline that can be started multiple times.
#[derive(Debug)]
pub struct InputStream {
    files: Arc<RecordFiles>,
    batch_size: usize,
    num_classes: i64,
    train: bool,
    input: InputConfig,
    preprocessor: Arc<ImagePreprocessor>,
    cropper: Arc<PatchCropper>,
    logging_tx: Option<broadcast::Sender<LoggingMessage>>,
}

impl InputStream {
    /// Creates the training or evaluation pipeline from the configuration.
    pub fn new(
        config: &Config,
        train: bool,
        logging_tx: Option<broadcast::Sender<LoggingMessage>>,
    ) -> Result<Self> {
        let (files, batch_size, input) = if train {
            (
                &config.dataset.train_files,
                config.training.batch_size,
                &config.training.input,
            )
        } else {
            (
                &config.dataset.eval_files,
                config.evaluation.batch_size,
                &config.evaluation.input,
            )
        };
        let logging_tx = logging_tx.filter(|_| config.logging.enable_images);

        InputStreamInit {
            files: files.clone(),
            batch_size: batch_size.get(),
            num_classes: config.model.num_classes,
            train,
            input: input.clone(),
            preprocessor: config.preprocessor.clone(),
        }
        .build(logging_tx)
    }

    pub fn files(&self) -> &RecordFiles {
        &self.files
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The capacity and the minimum fill of the example queue.
    pub fn example_queue_size(&self) -> (usize, usize) {
        let reserved = 3 * self.batch_size;
        if self.train {
            let min_after_dequeue =
                EXAMPLES_PER_SHARD * self.input.input_queue_memory_factor.get();
            (min_after_dequeue + reserved, min_after_dequeue)
        } else {
            (EXAMPLES_PER_SHARD + reserved, 0)
        }
    }

    /// Spawns the pipeline threads.
    pub fn start(&self) -> Result<BatchReceiver> {
        let InputConfig {
            num_readers,
            num_preprocess_threads,
            flip_prob,
            ordered,
            allow_smaller_final_batch,
            prefetch_batches,
            num_epochs,
            seed,
            ..
        } = self.input;
        let num_readers = num_readers.get();
        let train = self.train;
        let batch_size = self.batch_size;
        let (queue_capacity, min_after_dequeue) = self.example_queue_size();

        info!(
            "start {} input stream: {} readers, {} preprocessing threads, queue capacity {}",
            if train { "training" } else { "evaluation" },
            num_readers,
            num_preprocess_threads,
            queue_capacity
        );

        let mut handles = vec![];

        // filename queue
        let (filename_tx, filename_rx) = flume::bounded(if train {
            TRAIN_FILENAME_QUEUE_SIZE
        } else {
            EVAL_FILENAME_QUEUE_SIZE
        });
        let (raw_tx, raw_rx) = flume::bounded(num_readers);

        // a panic of the filename producer is reported to the example queue
        handles.push(spawn_stage("filename-producer".into(), raw_tx.clone(), {
            let producer = FilenameProducer {
                files: self.files.clone(),
                shuffle: train,
                num_epochs,
                rng: stage_rng(seed, 0),
            };
            move || producer.run(filename_tx)
        })?);

        // record readers
        for reader_id in 0..num_readers {
            let filename_rx = filename_rx.clone();
            let raw_tx = raw_tx.clone();
            handles.push(spawn_stage(
                format!("reader-{}", reader_id),
                raw_tx.clone(),
                move || record_reader(filename_rx, raw_tx),
            )?);
        }
        drop(filename_rx);
        drop(raw_tx);

        // example queue
        let (example_tx, example_rx) = flume::bounded(num_preprocess_threads);
        handles.push(spawn_stage("example-queue".into(), example_tx.clone(), {
            let buffer = if train {
                ExampleBuffer::random_shuffle(queue_capacity, min_after_dequeue)
            } else {
                ExampleBuffer::fifo(queue_capacity)
            };
            let rng = stage_rng(seed, 1);
            move || example_queue(buffer, rng, raw_rx, example_tx)
        })?);

        // preprocessing workers
        let (sample_tx, sample_rx) = flume::bounded(2 * num_preprocess_threads * batch_size);
        for thread_id in 0..num_preprocess_threads {
            let worker = PreprocessWorker {
                thread_id,
                train,
                num_classes: self.num_classes,
                flip_prob: flip_prob.raw(),
                preprocessor: self.preprocessor.clone(),
                cropper: self.cropper.clone(),
                logging_tx: self.logging_tx.clone().filter(|_| thread_id == 0),
                rng: stage_rng(seed, 2 + thread_id as u64),
            };
            let example_rx = example_rx.clone();
            let sample_tx = sample_tx.clone();
            handles.push(spawn_stage(
                format!("preprocess-{}", thread_id),
                sample_tx.clone(),
                move || worker.run(example_rx, sample_tx),
            )?);
        }
        drop(example_rx);
        drop(sample_tx);

        // batch joiner
        let (batch_tx, batch_rx) = flume::bounded(prefetch_batches.get());
        handles.push(spawn_stage("batch-joiner".into(), batch_tx.clone(), {
            let joiner = BatchJoiner {
                batch_size,
                ordered,
                allow_smaller_final_batch,
            };
            move || joiner.run(sample_rx, batch_tx)
        })?);

        Ok(BatchReceiver {
            rx: Some(batch_rx),
            handles,
        })
    }
}

/// Spawns a pipeline thread.
///
/// If the stage panics, an error is sent through `panic_tx` so that the
/// stream ends with an `Err` item instead of a silent end of input.
fn spawn_stage<T, F>(
    name: String,
    panic_tx: flume::Sender<Result<T>>,
    f: F,
) -> Result<JoinHandle<()>>
where
    T: Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let stage_name = name.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                error!("input stream stage '{}' panicked", stage_name);
                let _ = panic_tx.send(Err(format_err!("stage '{}' panicked", stage_name)));
            }
        })
        .with_context(|| format!("failed to spawn thread '{}'", name))
}

/// Creates the random number generator of one pipeline thread.
fn stage_rng(seed: Option<u64>, stage: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stage)),
        None => StdRng::from_entropy(),
    }
}

/// The receiving end of the pipeline.
///
/// The pipeline threads are joined when it is dropped.
#[derive(Debug)]
pub struct BatchReceiver {
    rx: Option<flume::Receiver<Result<TrainingRecord>>>,
    handles: Vec<JoinHandle<()>>,
}

impl BatchReceiver {
    /// Blocks until the next batch. Returns `None` at the end of the input.
    pub fn recv(&self) -> Option<Result<TrainingRecord>> {
        self.rx.as_ref()?.recv().ok()
    }

    /// Waits for the next batch. Returns `None` at the end of the input.
    pub async fn recv_async(&self) -> Option<Result<TrainingRecord>> {
        self.rx.as_ref()?.recv_async().await.ok()
    }
}

impl Iterator for BatchReceiver {
    type Item = Result<TrainingRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for BatchReceiver {
    fn drop(&mut self) {
        // disconnect first so that blocked stages can exit
        drop(self.rx.take());

        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_owned();
            if handle.join().is_err() {
                error!("input stream thread '{}' panicked", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_panic_is_sent_downstream() -> Result<()> {
        let (tx, rx) = flume::bounded::<Result<usize>>(4);
        let handle = spawn_stage("broken-stage".into(), tx.clone(), move || {
            tx.send(Ok(1)).unwrap();
            panic!("broken stage");
        })?;

        let items: Vec<_> = rx.iter().collect();
        assert!(handle.join().is_ok());
        assert_eq!(items.len(), 2);
        assert_eq!(*items[0].as_ref().unwrap(), 1);

        let message = format!("{:#}", items[1].as_ref().unwrap_err());
        assert!(message.contains("broken-stage"), "{}", message);
        Ok(())
    }

    #[test]
    fn finished_stage_sends_nothing_extra() -> Result<()> {
        let (tx, rx) = flume::bounded::<Result<usize>>(4);
        let handle = spawn_stage("good-stage".into(), tx.clone(), move || {
            tx.send(Ok(1)).unwrap();
        })?;

        let items: Vec<_> = rx.iter().collect();
        assert!(handle.join().is_ok());
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
        Ok(())
    }
}
