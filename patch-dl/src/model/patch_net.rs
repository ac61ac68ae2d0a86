use super::{PatchTower, PatchTowerInit};
use crate::{common::*, record::NUM_POINTS};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchNetInit {
    /// The number of landmark patches per image, one tower per patch.
    pub num_points: usize,
    pub num_classes: usize,
    /// The probability to drop a fused feature in training.
    pub dropout: R64,
    pub tower: PatchTowerInit,
}

impl Default for PatchNetInit {
    fn default() -> Self {
        Self {
            num_points: NUM_POINTS,
            num_classes: 600,
            dropout: r64(0.5),
            tower: Default::default(),
        }
    }
}

impl PatchNetInit {
    pub fn build<'p, P>(self, path: P) -> Result<PatchNet>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            num_points,
            num_classes,
            dropout,
            tower,
        } = self;

        ensure!(num_points > 0, "num_points must be positive");
        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            (0.0..1.0).contains(&dropout.raw()),
            "dropout must be in range [0, 1)"
        );

        let in_c = tower.in_c as i64;
        let patch_size = tower.patch_size as i64;
        let tower_features = tower.out_features;

        let towers: Vec<_> = (0..num_points)
            .map(|index| tower.clone().build(path / format!("tower_{}", index)))
            .try_collect()?;
        let classifier = nn::linear(
            path / "classifier",
            (tower_features * num_points) as i64,
            num_classes as i64,
            Default::default(),
        );

        Ok(PatchNet {
            towers,
            classifier,
            dropout: dropout.raw(),
            in_c,
            patch_size,
            num_classes: num_classes as i64,
        })
    }
}

/// The classifier that runs one independent tower per landmark patch and
/// fuses the tower outputs.
#[derive(Debug)]
pub struct PatchNet {
    towers: Vec<PatchTower>,
    classifier: nn::Linear,
    dropout: f64,
    in_c: i64,
    patch_size: i64,
    num_classes: i64,
}

impl PatchNet {
    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    /// Maps `[b, num_points, c, h, w]` patches to `[b, num_classes]` scores.
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let num_points = self.towers.len() as i64;
        let (batch_size, n, c, h, w) = input.size5()?;
        ensure!(
            n == num_points && c == self.in_c && h == self.patch_size && w == self.patch_size,
            "expect input shape [_, {}, {}, {}, {}], but get {:?}",
            num_points,
            self.in_c,
            self.patch_size,
            self.patch_size,
            input.size()
        );

        let features: Vec<_> = self
            .towers
            .iter()
            .enumerate()
            .map(|(index, tower)| tower.forward(&input.select(1, index as i64)))
            .collect();
        let fused = Tensor::stack(&features, 1).view([batch_size, -1]);
        let fused = fused.dropout(self.dropout, train);

        // the fusion layer keeps the rectifier of a plain fully connected layer
        Ok(fused.apply(&self.classifier).relu())
    }
}
