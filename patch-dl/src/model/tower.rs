use crate::common::*;

/// The convolutional branch applied to one landmark patch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchTowerInit {
    pub in_c: usize,
    pub patch_size: usize,
    /// The output channels of the three 3x3 convolution stages.
    pub channels: [usize; 3],
    pub out_features: usize,
}

impl Default for PatchTowerInit {
    fn default() -> Self {
        Self {
            in_c: 3,
            patch_size: 30,
            channels: [10, 20, 30],
            out_features: 240,
        }
    }
}

impl PatchTowerInit {
    /// The spatial size after the three convolution and pooling stages.
    pub fn feature_size(&self) -> usize {
        (0..3).fold(self.patch_size, |size, _| size.saturating_sub(2) / 2)
    }

    pub fn build<'p, P>(self, path: P) -> Result<PatchTower>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let feature_size = self.feature_size();
        let Self {
            in_c,
            patch_size,
            channels: [c1, c2, c3],
            out_features,
        } = self;

        ensure!(
            feature_size > 0,
            "patch size {} is too small for three convolution stages",
            patch_size
        );
        ensure!(
            [in_c, c1, c2, c3, out_features].iter().all(|&size| size > 0),
            "layer sizes must be positive"
        );

        let conv = |name: &str, in_c: usize, out_c: usize, k: usize| {
            nn::conv2d(
                path / name,
                in_c as i64,
                out_c as i64,
                k as i64,
                nn::ConvConfig {
                    stride: 1,
                    padding: 0,
                    ..Default::default()
                },
            )
        };

        let conv1 = conv("conv1", in_c, c1, 3);
        let conv2 = conv("conv2", c1, c2, 3);
        let conv3 = conv("conv3", c2, c3, 3);
        let conv4 = conv("conv4", c3, c3, 2);

        let concat_features = 2 * c3 * feature_size * feature_size;
        let linear = nn::linear(
            path / "fc",
            concat_features as i64,
            out_features as i64,
            Default::default(),
        );

        Ok(PatchTower {
            conv1,
            conv2,
            conv3,
            conv4,
            linear,
            out_features: out_features as i64,
        })
    }
}

#[derive(Debug)]
pub struct PatchTower {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    conv3: nn::Conv2D,
    conv4: nn::Conv2D,
    linear: nn::Linear,
    out_features: i64,
}

impl PatchTower {
    pub fn out_features(&self) -> i64 {
        self.out_features
    }

    /// Maps `[b, c, h, w]` patches to `[b, out_features]` features.
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let Self {
            conv1,
            conv2,
            conv3,
            conv4,
            linear,
            ..
        } = self;
        let batch_size = xs.size()[0];

        let p1 = xs.apply(conv1).elu().max_pool2d_default(2);
        let p2 = p1.apply(conv2).elu().max_pool2d_default(2);
        let p3 = p2.apply(conv3).elu().max_pool2d_default(2);

        // 2x2 convolution with "same" padding: one extra row and column after
        let l3 = p3.constant_pad_nd(&[0, 1, 0, 1]).apply(conv4);

        let flat = Tensor::cat(
            &[p3.view([batch_size, -1]), l3.view([batch_size, -1])],
            1,
        );
        flat.apply(linear).elu()
    }
}
