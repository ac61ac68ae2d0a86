//! Per-image preprocessing applied before patch extraction.

use super::{ColorDistort, ColorOrdering};
use crate::{common::*, utils::TensorExt as _};

/// A bounding box in ratio unit, arranged as `[ymin, xmin, ymax, xmax]`.
pub type RatioBBox = [f64; 4];

/// The bounding box covering the whole image.
pub const FULL_IMAGE_BBOX: RatioBBox = [0.0, 0.0, 1.0, 1.0];

/// Decodes and preprocesses one image for training or evaluation.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    color_distort: ColorDistort,
}

impl ImagePreprocessor {
    pub fn new(color_distort: ColorDistort) -> Self {
        Self { color_distort }
    }

    /// Preprocesses a `[3, h, w]` image in `[0, 1]`.
    ///
    /// In training the colors are distorted in the order selected by
    /// `thread_id`. The output is rescaled to `[-1, 1]`. A missing bounding
    /// box is an error.
    pub fn forward<R>(
        &self,
        image: &Tensor,
        bbox: Option<&RatioBBox>,
        train: bool,
        thread_id: usize,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let bbox = bbox.ok_or_else(|| format_err!("please supply a bounding box"))?;
        check_bbox(bbox)?;
        image.f_expect_chw(3)?;

        let image = if train {
            self.color_distort
                .forward(image, ColorOrdering::from_thread_id(thread_id), rng)?
        } else {
            image.shallow_clone()
        };

        // rescale from [0, 1] to [-1, 1]
        Ok((image - 0.5) * 2.0)
    }
}

fn check_bbox(bbox: &RatioBBox) -> Result<()> {
    let [ymin, xmin, ymax, xmax] = *bbox;
    ensure!(
        bbox.iter().all(|value| (0.0..=1.0).contains(value)) && ymin < ymax && xmin < xmax,
        "invalid bounding box {:?}",
        bbox
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ColorDistortInit;

    fn preprocessor() -> ImagePreprocessor {
        ImagePreprocessor::new(ColorDistortInit::default().build().unwrap())
    }

    #[test]
    fn missing_bbox_is_rejected() {
        let image = Tensor::rand(&[3, 8, 8], FLOAT_CPU);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(preprocessor()
            .forward(&image, None, true, 0, &mut rng)
            .is_err());
        assert!(preprocessor()
            .forward(&image, Some(&[0.5, 0.0, 0.2, 1.0]), true, 0, &mut rng)
            .is_err());
    }

    #[test]
    fn eval_only_rescales() -> Result<()> {
        let image = Tensor::of_slice(&[0f32, 0.25, 0.5, 1.0]).view([1, 2, 2]).repeat(&[3, 1, 1]);
        let mut rng = StdRng::seed_from_u64(0);
        let output = preprocessor().forward(&image, Some(&FULL_IMAGE_BBOX), false, 1, &mut rng)?;
        let values: Vec<f32> = Vec::from(&output.select(0, 2).view([-1]));
        assert_eq!(values, vec![-1.0, -0.5, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn train_output_range() -> Result<()> {
        let image = Tensor::rand(&[3, 40, 40], FLOAT_CPU);
        let mut rng = StdRng::seed_from_u64(9);
        for thread_id in 0..4 {
            let output =
                preprocessor().forward(&image, Some(&FULL_IMAGE_BBOX), true, thread_id, &mut rng)?;
            ensure!(f64::from(output.min()) >= -1.0);
            ensure!(f64::from(output.max()) <= 1.0);
        }
        Ok(())
    }
}
