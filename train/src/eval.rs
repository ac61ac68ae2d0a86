//! Model evaluation over a finite input.

use crate::{
    common::*,
    config::{Config, EvaluationConfig},
    input_stream::{BatchReceiver, InputStream, TrainingRecord},
    logging::{EvaluationOutputLog, LoggingMessage},
    utils,
};
use std::fmt;

/// The metrics over all evaluated records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub num_records: usize,
    pub loss: f64,
    pub top1_accuracy: f64,
    pub top5_accuracy: f64,
}

impl fmt::Display for EvalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "records: {}\tloss: {:.5}\ttop-1: {:.4}\ttop-5: {:.4}",
            self.num_records, self.loss, self.top1_accuracy, self.top5_accuracy
        )
    }
}

/// Evaluates the checkpoint selected by the configuration.
///
/// The metrics are sent to the logger if `logging_tx` is set.
pub fn evaluate(
    config: &Config,
    logging_tx: Option<broadcast::Sender<LoggingMessage>>,
) -> Result<EvalSummary> {
    let EvaluationConfig {
        ref load_checkpoint,
        device,
        ..
    } = config.evaluation;
    info!("use device {:?}", device);

    let mut vs = nn::VarStore::new(device);
    let root = vs.root();
    let model = config.model.clone().build(&root / "model")?;
    let training_step_tensor = root.zeros_no_train("training_step", &[]);

    let checkpoint = utils::try_load_checkpoint(&mut vs, &config.logging.dir, load_checkpoint)?;
    if checkpoint.is_none() {
        warn!("no checkpoint is loaded, evaluate the initial weights");
    }
    let step = f32::from(&training_step_tensor) as usize;

    let stream = InputStream::new(config, false, logging_tx.clone())?;
    let num_records = stream.files().count_records()?;
    info!(
        "evaluate {} records in {} files",
        num_records,
        stream.files().files().len()
    );

    let summary = evaluate_model(&model, stream.start()?, device)?;
    if summary.num_records != num_records {
        warn!(
            "evaluated {} out of {} records",
            summary.num_records, num_records
        );
    }
    info!("evaluation at step {}: {}", step, summary);

    if let Some(logging_tx) = logging_tx {
        logging_tx
            .send(LoggingMessage::new_evaluation_output(
                "eval",
                EvaluationOutputLog {
                    step,
                    loss: r64(summary.loss),
                    top1_accuracy: r64(summary.top1_accuracy),
                    top5_accuracy: r64(summary.top5_accuracy),
                },
            ))
            .map_err(|_err| format_err!("cannot send message to logger"))?;
    }

    Ok(summary)
}

/// Runs the model on every batch without dropout and aggregates the metrics.
pub fn evaluate_model(
    model: &PatchNet,
    data_rx: BatchReceiver,
    device: Device,
) -> Result<EvalSummary> {
    let mut num_records = 0;
    let mut loss_sum = 0.0;
    let mut top1_sum = 0.0;
    let mut top5_sum = 0.0;

    for record in data_rx {
        let TrainingRecord {
            step,
            image,
            labels,
            ..
        } = record?.to_device(device);
        let batch_size = labels.size1()? as usize;

        let (loss, top1, top5) = tch::no_grad(|| -> Result<_> {
            let logits = model.forward_t(&image, false)?;
            let loss = f64::from(logits.cross_entropy_for_logits(&labels));
            let top1 = top_k_accuracy(&logits, &labels, 1)?;
            let top5 = top_k_accuracy(&logits, &labels, 5)?;
            Ok((loss, top1, top5))
        })?;

        num_records += batch_size;
        loss_sum += loss * batch_size as f64;
        top1_sum += top1 * batch_size as f64;
        top5_sum += top5 * batch_size as f64;

        if step % 100 == 0 {
            info!("evaluated {} records", num_records);
        }
    }

    ensure!(num_records > 0, "no records are evaluated");
    let total = num_records as f64;

    Ok(EvalSummary {
        num_records,
        loss: loss_sum / total,
        top1_accuracy: top1_sum / total,
        top5_accuracy: top5_sum / total,
    })
}
