use anyhow::{ensure, format_err, Context, Result};
use clap::Parser;
use image::{imageops::FilterType, GenericImageView as _};
use itertools::Itertools;
use patch_dl::{
    dataset::{open_records, write_records, RecordFiles},
    record::{ExampleRecord, Points, DEFAULT_LABEL, IMAGE_SIZE, NUM_POINTS},
};
use prettytable::{cell, row, Table};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Parser)]
enum Opts {
    /// Print record counts and label statistics of record files
    Info {
        /// glob pattern of record files
        pattern: String,
    },
    /// Pack images listed in a CSV file into a record file
    Pack {
        /// CSV file with rows of image_file,label,text,x0,y0,...,x12,y12
        csv_file: PathBuf,
        /// output record file
        output_file: PathBuf,
    },
}

fn main() -> Result<()> {
    match Opts::parse() {
        Opts::Info { pattern } => {
            info(&pattern)?;
        }
        Opts::Pack {
            csv_file,
            output_file,
        } => {
            pack(csv_file, output_file)?;
        }
    }

    Ok(())
}

fn info(pattern: &str) -> Result<()> {
    let files = RecordFiles::glob(pattern)?;
    let mut histogram: BTreeMap<i64, usize> = BTreeMap::new();

    // print per-file counts
    {
        let mut table = Table::new();
        table.add_row(row!["file", "records"]);

        for path in files.files() {
            let mut count = 0;
            for example in open_records(path)? {
                let record = ExampleRecord::from_example(&example?).with_context(|| {
                    format!("malformed record {} in '{}'", count, path.display())
                })?;
                *histogram.entry(record.label).or_default() += 1;
                count += 1;
            }
            table.add_row(row![path.display(), count]);
        }

        table.printstd();
    }

    // print label statistics
    {
        let total: usize = histogram.values().sum();
        let unlabeled = histogram.get(&DEFAULT_LABEL).copied().unwrap_or(0);
        let labeled = histogram
            .iter()
            .filter(|(&label, _)| label != DEFAULT_LABEL)
            .map(|(_, &count)| count);
        let (min_count, max_count) = labeled.clone().minmax().into_option().unwrap_or((0, 0));

        let mut table = Table::new();
        table.add_row(row!["records", total]);
        table.add_row(row!["classes", labeled.count()]);
        table.add_row(row!["unlabeled records", unlabeled]);
        table.add_row(row!["min records per class", min_count]);
        table.add_row(row!["max records per class", max_count]);
        table.printstd();
    }

    Ok(())
}

fn pack(csv_file: impl AsRef<Path>, output_file: impl AsRef<Path>) -> Result<()> {
    let csv_file = csv_file.as_ref();
    let output_file = output_file.as_ref();
    let image_dir = csv_file.parent().unwrap_or_else(|| Path::new("."));

    let rows: Vec<PackRow> = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(csv_file)
        .with_context(|| format!("failed to open '{}'", csv_file.display()))?
        .records()
        .enumerate()
        .map(|(index, record)| {
            let record = record?;
            let fields: Vec<&str> = record.iter().collect();
            PackRow::parse(&fields)
                .with_context(|| format!("invalid row {} in '{}'", index, csv_file.display()))
        })
        .try_collect()?;

    let records: Vec<_> = rows
        .iter()
        .map(|row| row.load(image_dir))
        .try_collect()?;
    let count = write_records(output_file, &records)?;
    println!("wrote {} records to '{}'", count, output_file.display());

    Ok(())
}

/// One row of the packing list.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PackRow {
    image_file: PathBuf,
    label: i64,
    text: String,
    /// Points in the pixel coordinates of the source image.
    points: Points,
}

impl PackRow {
    fn parse(fields: &[&str]) -> Result<Self> {
        ensure!(
            fields.len() == 3 + NUM_POINTS * 2,
            "expect {} columns, but get {}",
            3 + NUM_POINTS * 2,
            fields.len()
        );

        let image_file = PathBuf::from(fields[0].trim());
        let label: i64 = fields[1]
            .trim()
            .parse()
            .with_context(|| format!("invalid label '{}'", fields[1]))?;
        let text = fields[2].trim().to_owned();

        let mut points = [[0; 2]; NUM_POINTS];
        for (point, coords) in points.iter_mut().zip(fields[3..].chunks(2)) {
            for (value, field) in point.iter_mut().zip(coords) {
                *value = field
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid coordinate '{}'", field))?;
            }
        }

        Ok(Self {
            image_file,
            label,
            text,
            points,
        })
    }

    /// Loads the image, resizes it and scales the points accordingly.
    fn load(&self, image_dir: &Path) -> Result<ExampleRecord> {
        let path = image_dir.join(&self.image_file);
        let image = image::io::Reader::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?
            .with_guessed_format()
            .with_context(|| {
                format!(
                    "failed to determine the image file format: {}",
                    path.display()
                )
            })?
            .decode()
            .with_context(|| format!("failed to decode image file: {}", path.display()))?;

        let (width, height) = (image.width(), image.height());
        ensure!(
            width > 0 && height > 0,
            "empty image file: {}",
            path.display()
        );

        let size = IMAGE_SIZE as u32;
        let pixels = image
            .resize_exact(size, size, FilterType::CatmullRom)
            .to_rgb8()
            .into_raw();

        let points = scale_points(&self.points, width, height)
            .ok_or_else(|| format_err!("landmark points are out of image {}", path.display()))?;

        Ok(ExampleRecord {
            image: pixels,
            label: self.label,
            points,
            text: (!self.text.is_empty()).then(|| self.text.clone()),
        })
    }
}

/// Maps points of a `width` by `height` image to the packed image size.
///
/// Returns `None` if a point is outside the source image.
fn scale_points(points: &Points, width: u32, height: u32) -> Option<Points> {
    let size = IMAGE_SIZE as f64;
    let mut scaled = *points;

    for [x, y] in scaled.iter_mut() {
        if !(0..=width as i32).contains(x) || !(0..=height as i32).contains(y) {
            return None;
        }
        *x = (*x as f64 * size / width as f64).round() as i32;
        *y = (*y as f64 * size / height as f64).round() as i32;
    }

    Some(scaled)
}
