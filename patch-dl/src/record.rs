//! The serialized example record carrying an image, a class label and landmark points.

use crate::common::*;
use tfrecord::{Example, Feature};

/// The height and width of the raw image payload.
pub const IMAGE_SIZE: usize = 230;
/// The number of color channels of the raw image payload.
pub const NUM_CHANNELS: usize = 3;
/// The number of landmark points per image.
pub const NUM_POINTS: usize = 13;
/// The height and width of a landmark patch.
pub const PATCH_SIZE: usize = 30;

pub const IMAGE_DATA_KEY: &str = "image/data";
pub const LABEL_KEY: &str = "image/class/label";
pub const POINTS_KEY: &str = "image/points";
pub const TEXT_KEY: &str = "image/class/text";

/// The label assigned to records without a `image/class/label` feature.
pub const DEFAULT_LABEL: i64 = -1;

/// Landmark points in `(x, y)` pixel coordinates.
pub type Points = [[i32; 2]; NUM_POINTS];

/// A decoded example record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExampleRecord {
    /// Raw RGB pixels in height-width-channel order.
    pub image: Vec<u8>,
    pub label: i64,
    pub points: Points,
    pub text: Option<String>,
}

impl ExampleRecord {
    /// Parses the features of an example.
    ///
    /// Missing features fall back to their defaults, that is, an empty image
    /// buffer, an empty point buffer, label `-1` and no text. The image and
    /// point buffers must have the fixed 230x230x3 and 13x2 layouts.
    pub fn from_example(example: &Example) -> Result<Self> {
        let image = bytes_feature(example, IMAGE_DATA_KEY)?.unwrap_or_default();
        let points = bytes_feature(example, POINTS_KEY)?.unwrap_or_default();
        // the text is informative only, so invalid UTF-8 is replaced
        let text = bytes_feature(example, TEXT_KEY)?
            .filter(|text| !text.is_empty())
            .map(|text| String::from_utf8_lossy(&text).into_owned());
        let label = match example.get(LABEL_KEY) {
            Some(Feature::Int64List(values)) => match values.as_slice() {
                &[label] => label,
                _ => bail!(
                    "'{}' must have exactly one value, but get {}",
                    LABEL_KEY,
                    values.len()
                ),
            },
            Some(Feature::None) | None => DEFAULT_LABEL,
            Some(_) => bail!("'{}' must be an int64 list", LABEL_KEY),
        };

        let expect_len = IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS;
        ensure!(
            image.len() == expect_len,
            "'{}' has {} bytes, which does not reshape to {}x{}x{}",
            IMAGE_DATA_KEY,
            image.len(),
            IMAGE_SIZE,
            IMAGE_SIZE,
            NUM_CHANNELS
        );
        let points = decode_points(&points)?;

        Ok(Self {
            image,
            label,
            points,
            text,
        })
    }

    /// Builds the example representation of this record.
    pub fn to_example(&self) -> Example {
        let Self {
            image,
            label,
            points,
            text,
        } = self;

        let mut example = Example::new();
        example.insert(
            IMAGE_DATA_KEY.into(),
            Feature::BytesList(vec![image.clone()]),
        );
        example.insert(LABEL_KEY.into(), Feature::Int64List(vec![*label]));
        example.insert(
            POINTS_KEY.into(),
            Feature::BytesList(vec![encode_points(points)]),
        );
        example.insert(
            TEXT_KEY.into(),
            Feature::BytesList(vec![text.clone().unwrap_or_default().into_bytes()]),
        );
        example
    }

    /// The image as a `[3, 230, 230]` float tensor in `[0, 1]`.
    pub fn image_tensor(&self) -> Result<Tensor> {
        let size = IMAGE_SIZE as i64;
        ensure!(
            self.image.len() == IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS,
            "invalid image buffer size {}",
            self.image.len()
        );

        let image = Tensor::of_slice(&self.image)
            .view([size, size, NUM_CHANNELS as i64])
            .permute(&[2, 0, 1])
            .to_kind(Kind::Float)
            / 255.0;
        Ok(image.set_requires_grad(false))
    }
}

/// Decodes 13 `(x, y)` pairs stored as little-endian 64-bit integers.
pub fn decode_points(bytes: &[u8]) -> Result<Points> {
    const VALUE_SIZE: usize = std::mem::size_of::<i64>();
    ensure!(
        bytes.len() == NUM_POINTS * 2 * VALUE_SIZE,
        "'{}' has {} bytes, which does not reshape to {}x2",
        POINTS_KEY,
        bytes.len(),
        NUM_POINTS
    );

    let mut points = [[0i32; 2]; NUM_POINTS];
    for (index, chunk) in bytes.chunks_exact(VALUE_SIZE).enumerate() {
        let mut buf = [0u8; VALUE_SIZE];
        buf.copy_from_slice(chunk);
        let value = i64::from_le_bytes(buf);
        let value: i32 = value
            .try_into()
            .map_err(|_| format_err!("landmark coordinate {} overflows", value))?;
        points[index / 2][index % 2] = value;
    }

    Ok(points)
}

/// Encodes landmark points as little-endian 64-bit integers.
pub fn encode_points(points: &Points) -> Vec<u8> {
    points
        .iter()
        .flatten()
        .flat_map(|&value| (value as i64).to_le_bytes())
        .collect()
}

fn bytes_feature(example: &Example, key: &str) -> Result<Option<Vec<u8>>> {
    let bytes = match example.get(key) {
        Some(Feature::BytesList(list)) => match list.as_slice() {
            [] => None,
            [bytes] => Some(bytes.clone()),
            _ => bail!(
                "'{}' must have at most one value, but get {}",
                key,
                list.len()
            ),
        },
        Some(Feature::None) | None => None,
        Some(_) => bail!("'{}' must be a bytes list", key),
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_points() -> Points {
        let mut points = [[0; 2]; NUM_POINTS];
        points.iter_mut().enumerate().for_each(|(index, point)| {
            *point = [index as i32 * 17, 229 - index as i32 * 3];
        });
        points
    }

    #[test]
    fn example_conversion() -> Result<()> {
        let record = ExampleRecord {
            image: (0..IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS)
                .map(|index| (index % 251) as u8)
                .collect(),
            label: 42,
            points: sample_points(),
            text: Some("smile".into()),
        };

        let parsed = ExampleRecord::from_example(&record.to_example())?;
        assert_eq!(parsed, record);
        Ok(())
    }

    #[test]
    fn missing_features_use_defaults() -> Result<()> {
        let mut example = Example::new();
        example.insert(
            IMAGE_DATA_KEY.into(),
            Feature::BytesList(vec![vec![0; IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS]]),
        );
        example.insert(
            POINTS_KEY.into(),
            Feature::BytesList(vec![encode_points(&sample_points())]),
        );

        let record = ExampleRecord::from_example(&example)?;
        assert_eq!(record.label, DEFAULT_LABEL);
        assert_eq!(record.text, None);
        Ok(())
    }

    #[test]
    fn invalid_text_is_replaced() -> Result<()> {
        let mut example = ExampleRecord {
            image: vec![0; IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS],
            label: 3,
            points: sample_points(),
            text: None,
        }
        .to_example();
        example.insert(
            TEXT_KEY.into(),
            Feature::BytesList(vec![vec![b'a', 0xff, b'b']]),
        );

        let record = ExampleRecord::from_example(&example)?;
        assert_eq!(record.label, 3);
        assert_eq!(record.text.as_deref(), Some("a\u{fffd}b"));
        Ok(())
    }

    #[test]
    fn reject_malformed_buffers() {
        let mut example = ExampleRecord {
            image: vec![0; IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS],
            label: 0,
            points: sample_points(),
            text: None,
        }
        .to_example();
        example.insert(IMAGE_DATA_KEY.into(), Feature::BytesList(vec![vec![0; 100]]));
        assert!(ExampleRecord::from_example(&example).is_err());

        assert!(decode_points(&[0; 13 * 2 * 8 - 1]).is_err());
        assert!(decode_points(&[]).is_err());
    }

    #[test]
    fn points_are_little_endian_pairs() -> Result<()> {
        let mut bytes = vec![0u8; NUM_POINTS * 2 * 8];
        bytes[0] = 7;
        bytes[8] = 1;
        bytes[9] = 1;
        let points = decode_points(&bytes)?;
        assert_eq!(points[0], [7, 257]);
        assert_eq!(points[1], [0, 0]);
        Ok(())
    }

    #[test]
    fn image_tensor_layout() -> Result<()> {
        let mut image = vec![0u8; IMAGE_SIZE * IMAGE_SIZE * NUM_CHANNELS];
        // pixel (y = 1, x = 2), green channel
        image[(IMAGE_SIZE + 2) * NUM_CHANNELS + 1] = 255;
        let record = ExampleRecord {
            image,
            label: 0,
            points: sample_points(),
            text: None,
        };

        let tensor = record.image_tensor()?;
        assert_eq!(tensor.size(), vec![3, 230, 230]);
        assert_eq!(tensor.double_value(&[1, 1, 2]), 1.0);
        assert_eq!(f64::from(tensor.sum(Kind::Float)), 1.0);
        Ok(())
    }
}
