use crate::common::*;

/// Extension methods on image tensors.
pub trait TensorExt {
    /// Converts a `[3, h, w]` RGB tensor in `[0, 1]` to HSV, all channels in `[0, 1]`.
    fn f_rgb_to_hsv(&self) -> Result<Tensor>;

    fn rgb_to_hsv(&self) -> Tensor {
        self.f_rgb_to_hsv().unwrap()
    }

    /// Converts a `[3, h, w]` HSV tensor back to RGB.
    fn f_hsv_to_rgb(&self) -> Result<Tensor>;

    fn hsv_to_rgb(&self) -> Tensor {
        self.f_hsv_to_rgb().unwrap()
    }

    /// Checks that the tensor is a `[channels, height, width]` tensor.
    fn f_expect_chw(&self, channels: i64) -> Result<(i64, i64)>;
}

impl TensorExt for Tensor {
    fn f_rgb_to_hsv(&self) -> Result<Tensor> {
        let eps = 1e-4;
        let rgb = self;
        rgb.f_expect_chw(3)?;

        let red = rgb.select(0, 0);
        let green = rgb.select(0, 1);
        let blue = rgb.select(0, 2);

        let (max, argmax) = rgb.max_dim(0, false);
        let (min, _argmin) = rgb.min_dim(0, false);
        let diff = &max - &min;

        let value = max;
        let saturation = (&diff / &value).where_self(&value.gt(eps), &value.zeros_like());

        let case1 = value.zeros_like();
        let case2 = (&green - &blue) / &diff;
        let case3 = (&blue - &red) / &diff + 2.0;
        let case4 = (&red - &green) / &diff + 4.0;

        let hue = {
            let hue = case1.where_self(
                &diff.le(eps),
                &case2.where_self(&argmax.eq(0), &case3.where_self(&argmax.eq(1), &case4)),
            );
            let hue = hue.where_self(&hue.ge(0.0), &(&hue + 6.0));
            hue / 6.0
        };

        let hsv = Tensor::stack(&[hue, saturation, value], 0);

        debug_assert!(
            !bool::from(hsv.isnan().any()),
            "NaN detected in RGB to HSV conversion"
        );

        Ok(hsv)
    }

    fn f_hsv_to_rgb(&self) -> Result<Tensor> {
        let hsv = self;
        hsv.f_expect_chw(3)?;

        let hue = hsv.select(0, 0) * 6.0;
        let saturation = hsv.select(0, 1);
        let value = hsv.select(0, 2);

        let func = |n: f64| {
            let k = (&hue + n).remainder(6.0);
            let ramp = k.minimum(&(-&k + 4.0)).clamp(0.0, 1.0);
            &value - &value * &saturation * ramp
        };

        let red = func(5.0);
        let green = func(3.0);
        let blue = func(1.0);
        let rgb = Tensor::stack(&[red, green, blue], 0);

        Ok(rgb)
    }

    fn f_expect_chw(&self, channels: i64) -> Result<(i64, i64)> {
        let (c, h, w) = self
            .size3()
            .map_err(|_| format_err!("expect a 3-dimensional tensor, but get {:?}", self.size()))?;
        ensure!(
            c == channels,
            "channel size must be {}, but get {}",
            channels,
            c
        );
        Ok((h, w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hsv_conversion_inverse() -> Result<()> {
        tch::manual_seed(7);
        let rgb = Tensor::rand(&[3, 16, 16], FLOAT_CPU);
        let hsv = rgb.f_rgb_to_hsv()?;

        let min = f64::from(hsv.min());
        let max = f64::from(hsv.max());
        ensure!(min >= 0.0 && max <= 1.0, "HSV values out of range");

        let recovered = hsv.f_hsv_to_rgb()?;
        let error = f64::from((recovered - &rgb).abs().max());
        ensure!(error < 1e-3, "round trip error {} is too large", error);
        Ok(())
    }

    #[test]
    fn primary_colors() -> Result<()> {
        let rgb = Tensor::of_slice(&[1f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
            .view([3, 1, 3]);
        let hue: Vec<f32> = Vec::from(&rgb.f_rgb_to_hsv()?.select(0, 0).view([-1]));
        let expect = [0.0, 1.0 / 3.0, 2.0 / 3.0];
        for (got, expect) in hue.into_iter().zip(expect) {
            ensure!((got - expect).abs() < 1e-5, "hue {} != {}", got, expect);
        }
        Ok(())
    }

    #[test]
    fn reject_non_rgb() {
        let gray = Tensor::zeros(&[1, 4, 4], FLOAT_CPU);
        assert!(gray.f_rgb_to_hsv().is_err());
        assert!(Tensor::zeros(&[4, 4], FLOAT_CPU).f_hsv_to_rgb().is_err());
    }
}
