//! Sharded record files.

use crate::{common::*, record::ExampleRecord};
use tfrecord::{Example, ExampleReader, ExampleWriter, RecordReaderInit, RecordWriterInit};

/// The list of record files matched by a glob pattern.
#[derive(Debug, Clone)]
pub struct RecordFiles {
    pattern: String,
    files: Vec<PathBuf>,
}

impl RecordFiles {
    /// Lists the files matching the pattern in lexicographic order.
    pub fn glob(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .with_context(|| format!("invalid file pattern '{}'", pattern))?
            .filter_map(|entry| match entry {
                Ok(path) => path.is_file().then(|| path),
                Err(err) => {
                    warn!("unable to access '{}': {}", err.path().display(), err);
                    None
                }
            })
            .collect();
        files.sort();

        ensure!(!files.is_empty(), "no data files found for '{}'", pattern);
        info!("found {} data files for '{}'", files.len(), pattern);

        Ok(Self { pattern, files })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// The file order of one epoch.
    ///
    /// The files are shuffled if `shuffle` is set, otherwise they keep the
    /// lexicographic order.
    pub fn epoch_order<R>(&self, shuffle: bool, rng: &mut R) -> Vec<PathBuf>
    where
        R: Rng + ?Sized,
    {
        let mut files = self.files.clone();
        if shuffle {
            files.shuffle(rng);
        }
        files
    }

    /// Counts the records of all files.
    pub fn count_records(&self) -> Result<usize> {
        self.files.iter().try_fold(0, |sum, path| {
            let count = open_records(path)?.try_fold(0, |count, result| {
                result?;
                Fallible::Ok(count + 1)
            })?;
            Ok(sum + count)
        })
    }
}

/// Opens a record file and iterates over its examples.
pub fn open_records(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Example>> + Send> {
    let path = path.as_ref();
    let reader: ExampleReader<_> = RecordReaderInit::default()
        .open(path)
        .with_context(|| format!("failed to open record file '{}'", path.display()))?;
    let path = path.to_owned();

    Ok(reader.map(move |result| {
        result.with_context(|| format!("failed to read a record from '{}'", path.display()))
    }))
}

/// Writes the records to a file, overwriting the file if it exists.
pub fn write_records<I, R>(path: impl AsRef<Path>, records: I) -> Result<usize>
where
    I: IntoIterator<Item = R>,
    R: Borrow<ExampleRecord>,
{
    let path = path.as_ref();
    let mut writer: ExampleWriter<_> = RecordWriterInit::create(path)
        .with_context(|| format!("failed to create record file '{}'", path.display()))?;

    let mut count = 0;
    for record in records {
        writer.send(record.borrow().to_example())?;
        count += 1;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush record file '{}'", path.display()))?;

    Ok(count)
}
