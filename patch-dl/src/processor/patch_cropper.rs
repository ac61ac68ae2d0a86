//! Extraction of square patches centered on landmark points.

use crate::{
    common::*,
    record::{Points, PATCH_SIZE},
    utils::TensorExt as _,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchCropperInit {
    /// The crop radius in training. The crop side is `2 * margin + 1`.
    pub train_margin: usize,
    /// The crop radius in evaluation.
    pub eval_margin: usize,
    /// The output patch size.
    pub patch_size: usize,
    /// The range of area ratio of the random sub-window in training.
    pub area_range: (R64, R64),
}

impl Default for PatchCropperInit {
    fn default() -> Self {
        Self {
            train_margin: 39,
            eval_margin: 29,
            patch_size: PATCH_SIZE,
            area_range: (r64(0.75), r64(1.0)),
        }
    }
}

impl PatchCropperInit {
    pub fn build(self) -> Result<PatchCropper> {
        let Self {
            train_margin,
            eval_margin,
            patch_size,
            area_range: (min_area, max_area),
        } = self;

        ensure!(patch_size > 0, "patch_size must be positive");
        ensure!(
            min_area > 0.0 && min_area <= max_area && max_area <= 1.0,
            "invalid area range ({}, {})",
            min_area,
            max_area
        );

        Ok(PatchCropper {
            train_margin: train_margin as i64,
            eval_margin: eval_margin as i64,
            patch_size: patch_size as i64,
            area_range: (min_area.raw(), max_area.raw()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PatchCropper {
    train_margin: i64,
    eval_margin: i64,
    patch_size: i64,
    area_range: (f64, f64),
}

impl PatchCropper {
    pub fn patch_size(&self) -> i64 {
        self.patch_size
    }

    /// Crops one patch per landmark point from a `[c, h, w]` image.
    ///
    /// The image is zero-padded by `margin` pixels before and `margin + 1`
    /// pixels after on each spatial axis, so the `2 * margin + 1` window
    /// starting at `(y, x)` of the padded image is centered on the point.
    /// Points must lie within `[0, w]` by `[0, h]`.
    ///
    /// Returns a `[num_points, c, patch_size, patch_size]` tensor.
    pub fn extract<R>(
        &self,
        image: &Tensor,
        points: &Points,
        train: bool,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let (channels, _, _) = image.size3()?;
        let (height, width) = image.f_expect_chw(channels)?;

        let margin = if train {
            self.train_margin
        } else {
            self.eval_margin
        };
        let side = margin * 2 + 1;

        tch::no_grad(|| {
            let padded = image.constant_pad_nd(&[margin, margin + 1, margin, margin + 1]);

            let patches: Vec<_> = points
                .iter()
                .enumerate()
                .map(|(index, &[x, y])| -> Result<_> {
                    let (x, y) = (x as i64, y as i64);
                    ensure!(
                        (0..=width).contains(&x) && (0..=height).contains(&y),
                        "landmark point {} at ({}, {}) is out of image bound {}x{}",
                        index,
                        x,
                        y,
                        width,
                        height
                    );

                    let crop = padded.narrow(1, y, side).narrow(2, x, side);
                    let crop = if train {
                        self.random_window(&crop, side, rng)
                    } else {
                        crop
                    };

                    Ok(self.resize(&crop))
                })
                .try_collect()?;

            Ok(Tensor::stack(&patches, 0))
        })
    }

    /// Samples a random square sub-window whose area ratio is within the
    /// configured range.
    fn random_window<R>(&self, crop: &Tensor, side: i64, rng: &mut R) -> Tensor
    where
        R: Rng + ?Sized,
    {
        let (min_area, max_area) = self.area_range;
        let area = if min_area < max_area {
            rng.gen_range(min_area..=max_area)
        } else {
            min_area
        };
        let window = ((area.sqrt() * side as f64).round() as i64).clamp(1, side);
        let top = rng.gen_range(0..=(side - window));
        let left = rng.gen_range(0..=(side - window));
        crop.narrow(1, top, window).narrow(2, left, window)
    }

    fn resize(&self, crop: &Tensor) -> Tensor {
        crop.unsqueeze(0)
            .upsample_bilinear2d(&[self.patch_size, self.patch_size], false, None, None)
            .squeeze_dim(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{IMAGE_SIZE, NUM_POINTS};

    fn constant_image(value: f64) -> Tensor {
        let size = IMAGE_SIZE as i64;
        Tensor::ones(&[3, size, size], FLOAT_CPU) * value
    }

    #[test]
    fn patch_shapes() -> Result<()> {
        let cropper = PatchCropperInit::default().build()?;
        let mut rng = StdRng::seed_from_u64(0);
        let image = Tensor::rand(&[3, 230, 230], FLOAT_CPU);
        let points = [[115, 115]; NUM_POINTS];

        for train in [true, false] {
            let patches = cropper.extract(&image, &points, train, &mut rng)?;
            assert_eq!(patches.size(), vec![13, 3, 30, 30]);
        }
        Ok(())
    }

    #[test]
    fn eval_patch_inside_image() -> Result<()> {
        let cropper = PatchCropperInit::default().build()?;
        let mut rng = StdRng::seed_from_u64(0);
        let points = [[115, 100]; NUM_POINTS];

        let patches = cropper.extract(&constant_image(0.5), &points, false, &mut rng)?;
        let error = f64::from((patches - 0.5).abs().max());
        ensure!(error < 1e-6, "patch differs from the image by {}", error);
        Ok(())
    }

    #[test]
    fn corner_patch_is_padded() -> Result<()> {
        let cropper = PatchCropperInit::default().build()?;
        let mut rng = StdRng::seed_from_u64(0);
        let mut points = [[115, 115]; NUM_POINTS];
        points[0] = [0, 0];
        points[1] = [230, 230];

        let patches = cropper.extract(&constant_image(1.0), &points, false, &mut rng)?;

        // the upper-left quarter of the first patch lies in the padding
        let top_left = patches.get(0).i((.., 0..10, 0..10));
        ensure!(f64::from(top_left.abs().max()) < 1e-6);
        let bottom_right = patches.get(0).i((.., 20..30, 20..30));
        ensure!(f64::from((bottom_right - 1.0).abs().max()) < 1e-6);

        // the lower-right quarter of the second patch lies in the padding
        let bottom_right = patches.get(1).i((.., 20..30, 20..30));
        ensure!(f64::from(bottom_right.abs().max()) < 1e-6);
        Ok(())
    }

    #[test]
    fn center_pixel_is_preserved() -> Result<()> {
        // a single bright 3x3 block around the point must appear in the
        // center of the evaluation patch
        let cropper = PatchCropperInit::default().build()?;
        let mut rng = StdRng::seed_from_u64(0);
        let image = Tensor::zeros(&[3, 230, 230], FLOAT_CPU);
        let _ = image.i((.., 49..52, 69..72)).fill_(1.0);
        let points = [[70, 50]; NUM_POINTS];

        let patches = cropper.extract(&image, &points, false, &mut rng)?;
        let center = patches.get(0).i((.., 14..16, 14..16));
        ensure!(f64::from(center.min()) > 0.0);
        let corner = patches.get(0).i((.., 0..5, 0..5));
        ensure!(f64::from(corner.max()) == 0.0);
        Ok(())
    }

    #[test]
    fn reject_out_of_bound_points() -> Result<()> {
        let cropper = PatchCropperInit::default().build()?;
        let mut rng = StdRng::seed_from_u64(0);
        let image = constant_image(0.0);

        let mut points = [[10, 10]; NUM_POINTS];
        points[12] = [231, 10];
        assert!(cropper.extract(&image, &points, true, &mut rng).is_err());

        points[12] = [10, -1];
        assert!(cropper.extract(&image, &points, false, &mut rng).is_err());
        Ok(())
    }
}
