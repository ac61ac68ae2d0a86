//! Training program configuration format.

use crate::common::*;

pub use dataset::*;
pub use evaluation::*;
pub use input::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: PatchNetInit,
    pub dataset: DatasetConfig,
    pub logging: LoggingConfig,
    pub preprocessor: PreprocessorConfig,
    pub training: TrainingConfig,
    pub evaluation: EvaluationConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The glob pattern of training record files.
        pub train_files: String,
        /// The glob pattern of evaluation record files.
        pub eval_files: String,
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    /// If set, write debug images of the preprocessing stages.
    pub enable_images: bool,
}

/// Data preprocessing options shared by training and evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PreprocessorConfig {
    #[serde(default)]
    pub color_distort: ColorDistortInit,
    #[serde(default)]
    pub patch_cropper: PatchCropperInit,
}

mod input {
    use super::*;

    /// Input pipeline options of one mode.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct InputConfig {
        /// The number of record reader threads.
        pub num_readers: NonZeroUsize,
        /// The number of preprocessing threads. It must be a multiple of 4.
        pub num_preprocess_threads: usize,
        /// The size of the example queue in unit of shards.
        #[serde(default = "default_input_queue_memory_factor")]
        pub input_queue_memory_factor: NonZeroUsize,
        /// The probability to flip an image horizontally.
        #[serde(default = "default_flip_prob")]
        pub flip_prob: R64,
        /// If set, batches are emitted in the order of the record files. It
        /// requires `num_readers` to be 1.
        pub ordered: bool,
        /// If set, the last incomplete batch of a finite input is emitted.
        #[serde(default)]
        pub allow_smaller_final_batch: bool,
        /// The number of finished batches waiting for the consumer.
        #[serde(default = "default_prefetch_batches")]
        pub prefetch_batches: NonZeroUsize,
        /// The number of passes over the files. Repeat forever if not set.
        #[serde(default)]
        pub num_epochs: Option<usize>,
        /// The random seed. Use system entropy if not set.
        #[serde(default)]
        pub seed: Option<u64>,
    }

    impl InputConfig {
        /// Defaults of the training pipeline.
        pub fn train_default() -> Self {
            Self {
                num_readers: NonZeroUsize::new(4).unwrap(),
                num_preprocess_threads: 4,
                input_queue_memory_factor: default_input_queue_memory_factor(),
                flip_prob: default_flip_prob(),
                ordered: false,
                allow_smaller_final_batch: false,
                prefetch_batches: default_prefetch_batches(),
                num_epochs: None,
                seed: None,
            }
        }

        /// Defaults of the evaluation pipeline.
        pub fn eval_default() -> Self {
            Self {
                num_readers: NonZeroUsize::new(1).unwrap(),
                num_preprocess_threads: 4,
                input_queue_memory_factor: NonZeroUsize::new(1).unwrap(),
                flip_prob: r64(0.0),
                ordered: true,
                allow_smaller_final_batch: true,
                prefetch_batches: default_prefetch_batches(),
                num_epochs: Some(1),
                seed: None,
            }
        }
    }

    fn default_input_queue_memory_factor() -> NonZeroUsize {
        NonZeroUsize::new(16).unwrap()
    }

    fn default_flip_prob() -> R64 {
        r64(0.5)
    }

    fn default_prefetch_batches() -> NonZeroUsize {
        NonZeroUsize::new(2).unwrap()
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// The batch size.
        pub batch_size: NonZeroUsize,
        /// Input pipeline options.
        #[serde(default = "InputConfig::train_default")]
        pub input: InputConfig,
        /// If enabled, it overrides the initial training step.
        pub override_initial_step: Option<usize>,
        /// Learning rate scheduling strategy.
        pub lr_schedule: LearningRateSchedule,
        /// The momentum parameter for optimizer.
        pub momentum: R64,
        /// The weight decay parameter for optimizer.
        pub weight_decay: R64,
        /// If set, it saves a checkpoint file per this steps.
        pub save_checkpoint_steps: Option<NonZeroUsize>,
        /// Checkpoint file loading method.
        pub load_checkpoint: LoadCheckpoint,
        /// If set, stop after this number of steps.
        pub max_steps: Option<usize>,
        /// Training device.
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
    }

    /// The learning rate scheduling strategy.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LearningRateSchedule {
        /// Use constant learning rate.
        Constant { lr: R64 },
        /// Use specific learning rate at specified steps.
        StepWise { steps: Vec<(usize, R64)> },
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }
}

mod evaluation {
    use super::*;

    /// The evaluation options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EvaluationConfig {
        /// The batch size.
        pub batch_size: NonZeroUsize,
        /// Input pipeline options.
        #[serde(default = "InputConfig::eval_default")]
        pub input: InputConfig,
        /// The checkpoint to evaluate.
        pub load_checkpoint: LoadCheckpoint,
        /// Evaluation device.
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
    }
}
