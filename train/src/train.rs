//! The training worker.

use crate::{
    common::*,
    config::{Config, TrainingConfig},
    input_stream::{BatchReceiver, TrainingRecord},
    logging::{LoggingMessage, TrainingOutputLog},
    utils::{self, LrScheduler, RateCounter},
};

/// Runs the training loop until the input ends or `max_steps` is reached.
///
/// Returns the number of the last finished step.
pub fn training_worker(
    config: Arc<Config>,
    checkpoint_dir: Arc<PathBuf>,
    data_rx: BatchReceiver,
    logging_tx: broadcast::Sender<LoggingMessage>,
    device: Device,
) -> Result<Option<usize>> {
    info!("use device {:?}", device);

    let Config {
        model: ref model_config,
        training:
            TrainingConfig {
                batch_size,
                override_initial_step,
                ref lr_schedule,
                momentum,
                weight_decay,
                save_checkpoint_steps,
                ref load_checkpoint,
                max_steps,
                ..
            },
        ..
    } = *config;
    let save_checkpoint_steps = save_checkpoint_steps.map(|steps| steps.get());

    // init model
    info!("initializing model");

    const DUMMY_LR: f64 = 1.0;

    let mut vs = nn::VarStore::new(device);
    let root = vs.root();

    let model = model_config.clone().build(&root / "model")?;
    let mut training_step_tensor = root.zeros_no_train("training_step", &[]);
    let mut optimizer = nn::Adam {
        beta1: momentum.raw(),
        beta2: 0.999,
        wd: weight_decay.raw(),
    }
    .build(&vs, DUMMY_LR)?;

    // load checkpoint
    let init_training_step = {
        let checkpoint =
            utils::try_load_checkpoint(&mut vs, &config.logging.dir, load_checkpoint)?;
        let saved_step = checkpoint
            .as_ref()
            .map(|_| f32::from(&training_step_tensor) as usize);
        let init_step = initial_step(override_initial_step, saved_step);
        if override_initial_step.is_some() {
            training_step_tensor.copy_(&Tensor::from(init_step as f32));
        }
        init_step
    };

    // training
    info!("start training from step {}", init_training_step);
    let mut training_step = init_training_step;
    let mut last_step = None;
    let mut last_loss = None;
    let mut rate_counter = RateCounter::with_second_interval();
    let mut lr_scheduler = LrScheduler::new(lr_schedule, init_training_step)?;
    optimizer.set_lr(lr_scheduler.lr());

    for record in data_rx {
        if let Some(max_steps) = max_steps {
            if training_step >= max_steps {
                info!("reached max_steps {}", max_steps);
                break;
            }
        }

        let mut record = record?;
        record.timing.add_event("in channel");

        let TrainingRecord {
            epoch,
            image,
            labels,
            mut timing,
            ..
        } = record.to_device(device);
        timing.add_event("move to device");

        // forward pass
        let logits = model.forward_t(&image, true)?;
        timing.add_event("forward");

        // compute loss
        let loss = logits.cross_entropy_for_logits(&labels);
        let accuracy = top_k_accuracy(&logits, &labels, 1)?;
        timing.add_event("loss");

        // optimizer
        let lr = lr_scheduler.next();
        optimizer.set_lr(lr);
        optimizer.backward_step(&loss);
        timing.add_event("backward");

        let loss = f64::from(&loss);
        ensure!(
            loss.is_finite(),
            "the loss diverges at step {}",
            training_step
        );

        // print message
        rate_counter.add(1.0);
        if let Some(batch_rate) = rate_counter.rate() {
            let record_rate = batch_rate * batch_size.get() as f64;
            info!(
                "epoch: {}\tstep: {}\tlr: {:.5}\tloss: {:.5}\t{:.2} batches/s\t{:.2} records/s",
                epoch, training_step, lr, loss, batch_rate, record_rate
            );
        }

        // send to logger
        logging_tx
            .send(LoggingMessage::new_training_output(
                "train",
                TrainingOutputLog {
                    step: training_step,
                    lr: r64(lr),
                    loss: r64(loss),
                    accuracy: r64(accuracy),
                },
            ))
            .map_err(|_err| format_err!("cannot send message to logger"))?;

        // update training step
        training_step_tensor.copy_(&Tensor::from(training_step as f32));
        last_step = Some(training_step);
        last_loss = Some(loss);

        // save checkpoint
        if let Some(steps) = save_checkpoint_steps {
            if training_step > 0 && training_step % steps == 0 {
                utils::save_checkpoint(&vs, &checkpoint_dir, training_step, loss)?;
            }
        }

        training_step += 1;

        // report profiling
        timing.report();
    }

    // save the final state
    if let (Some(step), Some(loss)) = (last_step, last_loss) {
        let saved = save_checkpoint_steps
            .map(|steps| step > 0 && step % steps == 0)
            .unwrap_or(false);
        if !saved {
            utils::save_checkpoint(&vs, &checkpoint_dir, step, loss)?;
        }
    }

    info!("training finished");
    Ok(last_step)
}

/// The first step of a training run.
///
/// Training resumes after the step of a loaded checkpoint, and starts from 0
/// when nothing is loaded. An explicit override wins over both.
fn initial_step(override_step: Option<usize>, saved_step: Option<usize>) -> usize {
    match (override_step, saved_step) {
        (Some(step), _) => step,
        (None, Some(step)) => step + 1,
        (None, None) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_step_selection() {
        assert_eq!(initial_step(None, None), 0);
        assert_eq!(initial_step(None, Some(0)), 1);
        assert_eq!(initial_step(None, Some(5000)), 5001);
        assert_eq!(initial_step(Some(7), Some(5000)), 7);
        assert_eq!(initial_step(Some(7), None), 7);
    }
}
