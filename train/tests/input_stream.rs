use anyhow::{ensure, Result};
use noisy_float::prelude::*;
use patch_dl::{
    dataset::write_records,
    record::{ExampleRecord, DEFAULT_LABEL, IMAGE_SIZE, NUM_CHANNELS, NUM_POINTS},
};
use std::{num::NonZeroUsize, path::PathBuf};
use train::{
    config::{InputConfig, PreprocessorConfig},
    input_stream::InputStreamInit,
};

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("train-input-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(Self(dir))
    }

    fn pattern(&self) -> String {
        format!("{}/shard-*", self.0.display())
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn make_record(label: i64, point: [i32; 2]) -> ExampleRecord {
    ExampleRecord {
        image: vec![(label * 10) as u8; IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS],
        label,
        points: [point; NUM_POINTS],
        text: Some(format!("class-{}", label)),
    }
}

/// Writes records labeled `0..num_records` into two shards in order.
fn write_dataset(num_records: i64) -> Result<TempDir> {
    let dir = TempDir::new()?;
    let half = num_records / 2;
    write_records(
        dir.0.join("shard-0"),
        (0..half).map(|label| make_record(label, [100, 120])),
    )?;
    write_records(
        dir.0.join("shard-1"),
        (half..num_records).map(|label| make_record(label, [100, 120])),
    )?;
    Ok(dir)
}

fn eval_init(dir: &TempDir, batch_size: usize) -> InputStreamInit {
    InputStreamInit {
        files: dir.pattern(),
        batch_size,
        num_classes: 600,
        train: false,
        input: InputConfig::eval_default(),
        preprocessor: PreprocessorConfig::default(),
    }
}

fn train_init(dir: &TempDir, batch_size: usize) -> InputStreamInit {
    InputStreamInit {
        files: dir.pattern(),
        batch_size,
        num_classes: 600,
        train: true,
        input: InputConfig {
            num_readers: NonZeroUsize::new(2).unwrap(),
            num_preprocess_threads: 4,
            input_queue_memory_factor: NonZeroUsize::new(1).unwrap(),
            flip_prob: r64(0.5),
            ordered: false,
            allow_smaller_final_batch: false,
            prefetch_batches: NonZeroUsize::new(2).unwrap(),
            num_epochs: Some(2),
            seed: Some(13),
        },
        preprocessor: PreprocessorConfig::default(),
    }
}

#[test]
fn ordered_eval_stream_keeps_file_order() -> Result<()> {
    let dir = write_dataset(10)?;
    let stream = eval_init(&dir, 4).build(None)?;

    let records: Vec<_> = stream.start()?.collect::<Result<_>>()?;
    let sizes: Vec<_> = records.iter().map(|record| record.labels.size()).collect();
    assert_eq!(sizes, vec![vec![4], vec![4], vec![2]]);

    let labels: Vec<i64> = records
        .iter()
        .flat_map(|record| Vec::<i64>::from(&record.labels))
        .collect();
    assert_eq!(labels, (0..10).collect::<Vec<_>>());

    let steps: Vec<_> = records.iter().map(|record| record.step).collect();
    assert_eq!(steps, vec![0, 1, 2]);
    assert_eq!(records[0].image.size(), vec![4, 13, 3, 30, 30]);
    Ok(())
}

#[test]
fn drop_final_incomplete_batch() -> Result<()> {
    let dir = write_dataset(10)?;
    let mut init = eval_init(&dir, 4);
    init.input.allow_smaller_final_batch = false;

    let records: Vec<_> = init.build(None)?.start()?.collect::<Result<_>>()?;
    assert_eq!(records.len(), 2);
    Ok(())
}

#[test]
fn shuffled_stream_covers_all_epochs() -> Result<()> {
    let dir = write_dataset(10)?;
    let stream = train_init(&dir, 4).build(None)?;

    let records: Vec<_> = stream.start()?.collect::<Result<_>>()?;
    assert_eq!(records.len(), 5);

    let mut labels: Vec<i64> = records
        .iter()
        .flat_map(|record| Vec::<i64>::from(&record.labels))
        .collect();
    labels.sort_unstable();
    let expect: Vec<i64> = (0..10).flat_map(|label| [label, label]).collect();
    assert_eq!(labels, expect);

    for record in &records {
        ensure!(f64::from(record.image.abs().max()) <= 1.0);
    }
    Ok(())
}

#[test]
fn stream_can_restart() -> Result<()> {
    let dir = write_dataset(6)?;
    let stream = eval_init(&dir, 3).build(None)?;

    for _ in 0..2 {
        let count = stream.start()?.try_fold(0, |count, record| {
            record?;
            Result::<_>::Ok(count + 1)
        })?;
        assert_eq!(count, 2);
    }
    Ok(())
}

#[test]
fn early_drop_stops_infinite_stream() -> Result<()> {
    let dir = write_dataset(8)?;
    let mut init = train_init(&dir, 2);
    init.input.num_epochs = None;
    let stream = init.build(None)?;

    let mut rx = stream.start()?;
    for _ in 0..3 {
        let record = rx.next().unwrap()?;
        assert_eq!(record.image.size(), vec![2, 13, 3, 30, 30]);
    }

    // joins every pipeline thread
    drop(rx);
    Ok(())
}

#[test]
fn reject_invalid_thread_count() -> Result<()> {
    let dir = write_dataset(2)?;

    for num_threads in [0, 3, 6] {
        let mut init = eval_init(&dir, 1);
        init.input.num_preprocess_threads = num_threads;
        assert!(init.build(None).is_err());
    }

    let mut init = eval_init(&dir, 1);
    init.input.num_preprocess_threads = 8;
    assert!(init.build(None).is_ok());
    Ok(())
}

#[test]
fn reject_missing_files() {
    let init = InputStreamInit {
        files: format!(
            "{}/train-input-missing-{}/*",
            std::env::temp_dir().display(),
            uuid::Uuid::new_v4()
        ),
        batch_size: 1,
        num_classes: 600,
        train: false,
        input: InputConfig::eval_default(),
        preprocessor: PreprocessorConfig::default(),
    };
    assert!(init.build(None).is_err());
}

#[test]
fn malformed_record_fails_the_stream() -> Result<()> {
    let dir = TempDir::new()?;
    write_records(
        dir.0.join("shard-0"),
        vec![
            make_record(0, [10, 10]),
            make_record(1, [300, 10]),
            make_record(2, [10, 10]),
        ],
    )?;

    let results: Vec<_> = eval_init(&dir, 1).build(None)?.start()?.collect();
    let error = results
        .iter()
        .find_map(|result| result.as_ref().err())
        .expect("the stream must report the malformed record");
    let message = format!("{:#}", error);
    assert!(message.contains("record 1"), "{}", message);

    // the error ends the stream
    assert!(results.last().unwrap().is_err());
    Ok(())
}

#[test]
fn reject_ordered_input_with_many_readers() -> Result<()> {
    let dir = write_dataset(2)?;
    let mut init = eval_init(&dir, 1);
    init.input.num_readers = NonZeroUsize::new(2).unwrap();
    assert!(init.clone().build(None).is_err());

    init.input.ordered = false;
    assert!(init.build(None).is_ok());
    Ok(())
}

#[test]
fn unflippable_point_fails_the_stream() -> Result<()> {
    let dir = TempDir::new()?;
    write_records(
        dir.0.join("shard-0"),
        vec![
            make_record(0, [10, 10]),
            make_record(1, [i32::MIN, 10]),
            make_record(2, [10, 10]),
            make_record(3, [10, 10]),
        ],
    )?;

    let mut init = train_init(&dir, 1);
    init.input.num_readers = NonZeroUsize::new(1).unwrap();
    init.input.flip_prob = r64(1.0);
    init.input.ordered = true;
    init.input.num_epochs = Some(1);

    let results: Vec<_> = init.build(None)?.start()?.collect();
    let error = results
        .iter()
        .find_map(|result| result.as_ref().err())
        .expect("the stream must report the bad point");
    let message = format!("{:#}", error);
    assert!(message.contains("cannot flip landmark point"), "{}", message);
    assert!(results.last().unwrap().is_err());
    Ok(())
}

#[test]
fn unlabeled_record_fails_the_stream() -> Result<()> {
    let dir = TempDir::new()?;
    write_records(
        dir.0.join("shard-0"),
        vec![make_record(0, [10, 10]), make_record(DEFAULT_LABEL, [10, 10])],
    )?;

    let results: Vec<_> = eval_init(&dir, 1).build(None)?.start()?.collect();
    let error = results
        .iter()
        .find_map(|result| result.as_ref().err())
        .expect("the stream must report the unlabeled record");
    let message = format!("{:#}", error);
    assert!(message.contains("record 1"), "{}", message);
    assert!(message.contains("out of range"), "{}", message);
    Ok(())
}
