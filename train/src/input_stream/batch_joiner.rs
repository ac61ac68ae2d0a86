use super::{Sample, TrainingRecord};
use crate::common::*;

/// Collects samples into fixed-size batches.
#[derive(Debug, Clone)]
pub struct BatchJoiner {
    pub batch_size: usize,
    /// Restore the sequence order of the samples.
    pub ordered: bool,
    pub allow_smaller_final_batch: bool,
}

impl BatchJoiner {
    pub fn run(
        self,
        rx: flume::Receiver<Result<Sample>>,
        tx: flume::Sender<Result<TrainingRecord>>,
    ) {
        let mut state = JoinState::new(self);

        for item in rx.iter() {
            let sample = match item {
                Ok(sample) => sample,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return;
                }
            };

            for record in state.push(sample) {
                if tx.send(record).is_err() {
                    return;
                }
            }
        }

        for record in state.finish() {
            if tx.send(record).is_err() {
                return;
            }
        }
    }
}

/// The batching state that is independent from channels.
#[derive(Debug)]
struct JoinState {
    config: BatchJoiner,
    /// Out-of-order samples keyed by the sequence number.
    pending: BTreeMap<usize, Sample>,
    next_index: usize,
    batch: Vec<Sample>,
    step: usize,
}

impl JoinState {
    fn new(config: BatchJoiner) -> Self {
        Self {
            batch: Vec::with_capacity(config.batch_size),
            config,
            pending: BTreeMap::new(),
            next_index: 0,
            step: 0,
        }
    }

    /// Adds a sample and returns the completed batches.
    fn push(&mut self, sample: Sample) -> Vec<Result<TrainingRecord>> {
        let mut records = vec![];

        if self.config.ordered {
            self.pending.insert(sample.index, sample);
            while let Some(sample) = self.pending.remove(&self.next_index) {
                self.next_index += 1;
                self.batch.push(sample);
                if self.batch.len() == self.config.batch_size {
                    records.push(self.emit());
                }
            }
        } else {
            self.batch.push(sample);
            if self.batch.len() == self.config.batch_size {
                records.push(self.emit());
            }
        }

        records
    }

    /// Flushes the remaining samples at the end of the input.
    fn finish(mut self) -> Vec<Result<TrainingRecord>> {
        let mut records = vec![];

        // the indexes are contiguous unless a worker failed
        let pending = std::mem::take(&mut self.pending);
        for (_, sample) in pending {
            self.batch.push(sample);
            if self.batch.len() == self.config.batch_size {
                records.push(self.emit());
            }
        }

        if !self.batch.is_empty() {
            if self.config.allow_smaller_final_batch {
                records.push(self.emit());
            } else {
                info!(
                    "drop the final incomplete batch of {} samples",
                    self.batch.len()
                );
            }
        }

        records
    }

    fn emit(&mut self) -> Result<TrainingRecord> {
        let samples = std::mem::take(&mut self.batch);
        let step = self.step;
        self.step += 1;

        let epoch = samples.iter().map(|sample| sample.epoch).max().unwrap_or(0);
        let labels: Vec<i64> = samples.iter().map(|sample| sample.label).collect();
        let patches: Vec<_> = samples
            .iter()
            .map(|sample| sample.patches.shallow_clone())
            .collect();
        let mut timing = samples
            .into_iter()
            .next()
            .map(|sample| sample.timing)
            .context("cannot emit an empty batch")?;

        let image = Tensor::f_stack(&patches, 0)?;
        let labels = Tensor::of_slice(&labels);
        timing.add_event("batch");

        Ok(TrainingRecord {
            epoch,
            step,
            image,
            labels,
            timing,
        })
    }
}
