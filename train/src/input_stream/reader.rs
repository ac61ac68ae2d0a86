use crate::common::*;
use patch_dl::dataset::open_records;
use tfrecord::Example;

/// An undecoded example tagged with its epoch.
#[derive(Debug, Clone)]
pub struct RawExample {
    pub epoch: usize,
    pub example: Example,
}

/// Emits the record files of every epoch.
#[derive(Debug)]
pub struct FilenameProducer {
    pub files: Arc<RecordFiles>,
    pub shuffle: bool,
    /// Repeat forever if not set.
    pub num_epochs: Option<usize>,
    pub rng: StdRng,
}

impl FilenameProducer {
    pub fn run(mut self, tx: flume::Sender<(usize, PathBuf)>) {
        let epochs: Box<dyn Iterator<Item = usize>> = match self.num_epochs {
            Some(num_epochs) => Box::new(0..num_epochs),
            None => Box::new(0..),
        };

        for epoch in epochs {
            for path in self.files.epoch_order(self.shuffle, &mut self.rng) {
                if tx.send((epoch, path)).is_err() {
                    return;
                }
            }
        }
    }
}

/// Reads the examples of every received file.
///
/// A read failure is sent downstream and stops the reader.
pub fn record_reader(rx: flume::Receiver<(usize, PathBuf)>, tx: flume::Sender<Result<RawExample>>) {
    for (epoch, path) in rx.iter() {
        let records = match open_records(&path) {
            Ok(records) => records,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };

        for result in records {
            let failed = result.is_err();
            let item = result.map(|example| RawExample { epoch, example });
            if tx.send(item).is_err() || failed {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_finite_epochs() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("train-reader-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        for index in 0..3 {
            std::fs::write(dir.join(format!("shard-{}", index)), b"")?;
        }
        let files = Arc::new(RecordFiles::glob(format!("{}/shard-*", dir.display()))?);

        let (tx, rx) = flume::unbounded();
        FilenameProducer {
            files: files.clone(),
            shuffle: false,
            num_epochs: Some(2),
            rng: StdRng::seed_from_u64(0),
        }
        .run(tx);

        let items: Vec<_> = rx.iter().collect();
        let epochs: Vec<_> = items.iter().map(|(epoch, _)| *epoch).collect();
        assert_eq!(epochs, vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(items[3].1, files.files()[0]);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn stop_when_disconnected() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("train-reader-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("shard-0"), b"")?;
        let files = Arc::new(RecordFiles::glob(format!("{}/shard-*", dir.display()))?);

        // repeats forever unless the receiver is gone
        let (tx, rx) = flume::bounded(1);
        drop(rx);
        FilenameProducer {
            files,
            shuffle: true,
            num_epochs: None,
            rng: StdRng::seed_from_u64(0),
        }
        .run(tx);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
