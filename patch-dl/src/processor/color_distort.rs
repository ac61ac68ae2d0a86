//! The random color distortion algorithm.

use crate::{common::*, utils::TensorExt as _};

/// The order of color operations.
///
/// Color operations do not commute. Instead of permuting the order per image,
/// each preprocessing worker uses a fixed order selected by the parity of its
/// index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorOrdering {
    /// Brightness, saturation, hue, then contrast.
    BrightnessSaturationHueContrast,
    /// Brightness, contrast, saturation, then hue.
    BrightnessContrastSaturationHue,
}

impl ColorOrdering {
    pub fn from_thread_id(thread_id: usize) -> Self {
        match thread_id % 2 {
            0 => Self::BrightnessSaturationHueContrast,
            _ => Self::BrightnessContrastSaturationHue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorDistortInit {
    /// The maximum absolute brightness delta.
    pub brightness_delta: R64,
    /// The lower and upper saturation factors.
    pub saturation_range: (R64, R64),
    /// The maximum absolute hue delta in unit of full turns.
    pub hue_delta: R64,
    /// The lower and upper contrast factors.
    pub contrast_range: (R64, R64),
}

impl Default for ColorDistortInit {
    fn default() -> Self {
        Self {
            brightness_delta: r64(32.0 / 255.0),
            saturation_range: (r64(0.5), r64(1.5)),
            hue_delta: r64(0.2),
            contrast_range: (r64(0.5), r64(1.5)),
        }
    }
}

impl ColorDistortInit {
    pub fn build(self) -> Result<ColorDistort> {
        let Self {
            brightness_delta,
            saturation_range: (saturation_lower, saturation_upper),
            hue_delta,
            contrast_range: (contrast_lower, contrast_upper),
        } = self;

        ensure!(
            brightness_delta >= 0.0,
            "brightness_delta must be non-negative"
        );
        ensure!(
            (0.0..=0.5).contains(&hue_delta.raw()),
            "hue_delta must be in range [0, 0.5]"
        );
        ensure!(
            saturation_lower >= 0.0 && saturation_lower <= saturation_upper,
            "invalid saturation range ({}, {})",
            saturation_lower,
            saturation_upper
        );
        ensure!(
            contrast_lower >= 0.0 && contrast_lower <= contrast_upper,
            "invalid contrast range ({}, {})",
            contrast_lower,
            contrast_upper
        );

        Ok(ColorDistort {
            brightness_delta: brightness_delta.raw(),
            saturation_range: (saturation_lower.raw(), saturation_upper.raw()),
            hue_delta: hue_delta.raw(),
            contrast_range: (contrast_lower.raw(), contrast_upper.raw()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ColorDistort {
    brightness_delta: f64,
    saturation_range: (f64, f64),
    hue_delta: f64,
    contrast_range: (f64, f64),
}

impl ColorDistort {
    /// Distorts the colors of a `[3, h, w]` image in `[0, 1]`.
    ///
    /// The output is clipped to `[0, 1]`.
    pub fn forward<R>(&self, rgb: &Tensor, ordering: ColorOrdering, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        rgb.f_expect_chw(3)?;

        tch::no_grad(|| -> Result<_> {
            let image = self.brightness(rgb, rng);
            let image = match ordering {
                ColorOrdering::BrightnessSaturationHueContrast => {
                    let image = self.saturation(&image, rng)?;
                    let image = self.hue(&image, rng)?;
                    self.contrast(&image, rng)
                }
                ColorOrdering::BrightnessContrastSaturationHue => {
                    let image = self.contrast(&image, rng);
                    let image = self.saturation(&image, rng)?;
                    self.hue(&image, rng)?
                }
            };

            Ok(image.clamp(0.0, 1.0))
        })
    }

    fn brightness<R>(&self, rgb: &Tensor, rng: &mut R) -> Tensor
    where
        R: Rng + ?Sized,
    {
        let delta = uniform(rng, -self.brightness_delta, self.brightness_delta);
        rgb + delta
    }

    fn saturation<R>(&self, rgb: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let (lower, upper) = self.saturation_range;
        let factor = uniform(rng, lower, upper);

        let hsv = rgb.clamp(0.0, 1.0).f_rgb_to_hsv()?;
        let saturation = (hsv.select(0, 1) * factor).clamp(0.0, 1.0);
        let hsv = Tensor::stack(&[hsv.select(0, 0), saturation, hsv.select(0, 2)], 0);
        hsv.f_hsv_to_rgb()
    }

    fn hue<R>(&self, rgb: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let delta = uniform(rng, -self.hue_delta, self.hue_delta);

        let hsv = rgb.clamp(0.0, 1.0).f_rgb_to_hsv()?;
        let hue = (hsv.select(0, 0) + delta).remainder(1.0);
        let hsv = Tensor::stack(&[hue, hsv.select(0, 1), hsv.select(0, 2)], 0);
        hsv.f_hsv_to_rgb()
    }

    fn contrast<R>(&self, rgb: &Tensor, rng: &mut R) -> Tensor
    where
        R: Rng + ?Sized,
    {
        let (lower, upper) = self.contrast_range;
        let factor = uniform(rng, lower, upper);

        let mean = rgb.mean_dim(&[1, 2], true, Kind::Float);
        (rgb - &mean) * factor + mean
    }
}

fn uniform<R>(rng: &mut R, lower: f64, upper: f64) -> f64
where
    R: Rng + ?Sized,
{
    if lower < upper {
        rng.gen_range(lower..upper)
    } else {
        lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_by_parity() {
        assert_eq!(
            ColorOrdering::from_thread_id(0),
            ColorOrdering::BrightnessSaturationHueContrast
        );
        assert_eq!(
            ColorOrdering::from_thread_id(3),
            ColorOrdering::BrightnessContrastSaturationHue
        );
        assert_eq!(
            ColorOrdering::from_thread_id(6),
            ColorOrdering::BrightnessSaturationHueContrast
        );
    }

    #[test]
    fn output_is_clipped() -> Result<()> {
        let distort = ColorDistortInit::default().build()?;
        let mut rng = StdRng::seed_from_u64(3);

        for thread_id in 0..4 {
            let image = Tensor::rand(&[3, 32, 32], FLOAT_CPU);
            let output =
                distort.forward(&image, ColorOrdering::from_thread_id(thread_id), &mut rng)?;
            assert_eq!(output.size(), vec![3, 32, 32]);
            ensure!(f64::from(output.min()) >= 0.0);
            ensure!(f64::from(output.max()) <= 1.0);
        }
        Ok(())
    }

    #[test]
    fn identity_when_ranges_collapse() -> Result<()> {
        let distort = ColorDistortInit {
            brightness_delta: r64(0.0),
            saturation_range: (r64(1.0), r64(1.0)),
            hue_delta: r64(0.0),
            contrast_range: (r64(1.0), r64(1.0)),
        }
        .build()?;
        let mut rng = StdRng::seed_from_u64(5);

        let image = Tensor::rand(&[3, 16, 16], FLOAT_CPU);
        let output = distort.forward(
            &image,
            ColorOrdering::BrightnessContrastSaturationHue,
            &mut rng,
        )?;
        let error = f64::from((output - &image).abs().max());
        ensure!(error < 1e-3, "error {} is too large", error);
        Ok(())
    }

    #[test]
    fn reject_invalid_config() {
        let init = ColorDistortInit {
            saturation_range: (r64(1.5), r64(0.5)),
            ..Default::default()
        };
        assert!(init.build().is_err());

        let image = Tensor::rand(&[1, 16, 16], FLOAT_CPU);
        let distort = ColorDistortInit::default().build().unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(distort
            .forward(&image, ColorOrdering::BrightnessSaturationHueContrast, &mut rng)
            .is_err());
    }
}
