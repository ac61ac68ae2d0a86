//! Data logging toolkit.

use crate::{
    common::*,
    config::{Config, LoggingConfig},
    utils::RateCounter,
};
use async_std::{fs::File, io::BufWriter};

pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// The data logging worker.
    #[derive(Debug)]
    pub struct LoggingWorker {
        config: Arc<Config>,
        debug_step: i64,
        event_writer: EventWriter<BufWriter<File>>,
        rate_counter: RateCounter,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a data logging worker.
        async fn new(
            config: Arc<Config>,
            logging_dir: Arc<PathBuf>,
            rx: broadcast::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            let event_dir = logging_dir.join("events");
            let event_path_prefix = event_dir
                .join("patch-dl")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("non-UTF-8 logging path {:?}", path))?;

            tokio::fs::create_dir_all(&event_dir).await?;

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None)
                .await?;

            Ok(Self {
                config,
                debug_step: 0,
                event_writer,
                rate_counter: RateCounter::with_second_interval(),
                rx,
            })
        }

        /// Start the data logging worker.
        ///
        /// It returns when every sender is dropped.
        async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!("logging worker skipped {} messages", count);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                self.rate_counter.add(1.0);

                match kind {
                    LoggingMessageKind::TrainingOutput(msg) => {
                        self.log_training_output(&tag, msg).await?;
                    }
                    LoggingMessageKind::EvaluationOutput(msg) => {
                        self.log_evaluation_output(&tag, msg).await?;
                    }
                    LoggingMessageKind::DebugImages(msg) => {
                        self.log_debug_images(&tag, msg).await?;
                    }
                }

                if let Some(rate) = self.rate_counter.rate() {
                    info!("processed {:.2} events/s", rate);
                }
            }

            Ok(())
        }

        async fn log_training_output(&mut self, tag: &str, msg: TrainingOutputLog) -> Result<()> {
            let TrainingOutputLog {
                step,
                lr,
                loss,
                accuracy,
            } = msg;
            let step = step as i64;

            self.event_writer
                .write_scalar_async(
                    format!("{}/params/learning_rate", tag),
                    step,
                    lr.raw() as f32,
                )
                .await?;
            self.event_writer
                .write_scalar_async(format!("{}/loss", tag), step, loss.raw() as f32)
                .await?;
            self.event_writer
                .write_scalar_async(format!("{}/accuracy", tag), step, accuracy.raw() as f32)
                .await?;

            Ok(())
        }

        async fn log_evaluation_output(
            &mut self,
            tag: &str,
            msg: EvaluationOutputLog,
        ) -> Result<()> {
            let EvaluationOutputLog {
                step,
                loss,
                top1_accuracy,
                top5_accuracy,
            } = msg;
            let step = step as i64;

            self.event_writer
                .write_scalar_async(format!("{}/loss", tag), step, loss.raw() as f32)
                .await?;
            self.event_writer
                .write_scalar_async(
                    format!("{}/top1_accuracy", tag),
                    step,
                    top1_accuracy.raw() as f32,
                )
                .await?;
            self.event_writer
                .write_scalar_async(
                    format!("{}/top5_accuracy", tag),
                    step,
                    top5_accuracy.raw() as f32,
                )
                .await?;

            Ok(())
        }

        async fn log_debug_images(&mut self, tag: &str, msg: DebugImageLog) -> Result<()> {
            let Config {
                logging: LoggingConfig { enable_images, .. },
                ..
            } = *self.config;
            let DebugImageLog { images } = msg;

            if enable_images {
                for (index, image) in images.into_iter().enumerate() {
                    self.event_writer
                        .write_image_async(format!("{}/{}", tag, index), self.debug_step, image)
                        .await?;
                }
                self.debug_step += 1;
            }

            Ok(())
        }
    }

    pub async fn logging_worker(
        config: Arc<Config>,
        logging_dir: Arc<PathBuf>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(config, logging_dir, rx).await?;
        Ok(tokio::task::spawn(worker.start()).map(|result| Fallible::Ok(result??)))
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, TensorLike, Clone)]
    pub struct LoggingMessage {
        #[tensor_like(clone)]
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    impl LoggingMessage {
        pub fn new_training_output<S>(tag: S, msg: TrainingOutputLog) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::TrainingOutput(msg),
            }
        }

        pub fn new_evaluation_output<S>(tag: S, msg: EvaluationOutputLog) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::EvaluationOutput(msg),
            }
        }

        /// Creates a message of `[c, h, w]` images with values in `[0, 1]`.
        pub fn new_debug_images<S, I>(tag: S, images: I) -> Self
        where
            S: Into<Cow<'static, str>>,
            I: IntoIterator<Item = Tensor>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::DebugImages(DebugImageLog {
                    images: images.into_iter().collect(),
                }),
            }
        }
    }

    #[derive(Debug, TensorLike)]
    pub enum LoggingMessageKind {
        TrainingOutput(TrainingOutputLog),
        EvaluationOutput(EvaluationOutputLog),
        DebugImages(DebugImageLog),
    }

    impl Clone for LoggingMessageKind {
        fn clone(&self) -> Self {
            self.shallow_clone()
        }
    }

    #[derive(Debug, Clone, TensorLike)]
    pub struct TrainingOutputLog {
        pub step: usize,
        #[tensor_like(copy)]
        pub lr: R64,
        #[tensor_like(copy)]
        pub loss: R64,
        #[tensor_like(copy)]
        pub accuracy: R64,
    }

    #[derive(Debug, Clone, TensorLike)]
    pub struct EvaluationOutputLog {
        pub step: usize,
        #[tensor_like(copy)]
        pub loss: R64,
        #[tensor_like(copy)]
        pub top1_accuracy: R64,
        #[tensor_like(copy)]
        pub top5_accuracy: R64,
    }

    #[derive(Debug, TensorLike)]
    pub struct DebugImageLog {
        pub images: Vec<Tensor>,
    }

    impl Clone for DebugImageLog {
        fn clone(&self) -> Self {
            self.shallow_clone()
        }
    }
}
