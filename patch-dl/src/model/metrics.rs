use crate::common::*;

/// The fraction of samples whose label is among the `k` highest scores.
pub fn top_k_accuracy(logits: &Tensor, labels: &Tensor, k: i64) -> Result<f64> {
    let (batch_size, num_classes) = logits.size2()?;
    let num_labels = labels.size1()?;
    ensure!(
        batch_size == num_labels,
        "batch size mismatch: {} logits and {} labels",
        batch_size,
        num_labels
    );
    ensure!(k >= 1, "k must be positive");

    if batch_size == 0 {
        return Ok(0.0);
    }

    let k = k.min(num_classes);
    let hits = tch::no_grad(|| {
        let (_, indexes) = logits.topk(k, 1, true, true);
        indexes
            .eq_tensor(&labels.to_kind(Kind::Int64).unsqueeze(1))
            .any_dim(1, false)
            .to_kind(Kind::Float)
            .sum(Kind::Float)
    });
    Ok(f64::from(hits) / batch_size as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_hits() -> Result<()> {
        let logits = Tensor::of_slice(&[
            0.1f32, 0.7, 0.2, //
            0.5, 0.1, 0.4, //
            0.3, 0.3, 0.4, //
            0.9, 0.02, 0.08,
        ])
        .view([4, 3]);
        let labels = Tensor::of_slice(&[1i64, 2, 2, 1]);

        assert_eq!(top_k_accuracy(&logits, &labels, 1)?, 0.5);
        assert_eq!(top_k_accuracy(&logits, &labels, 2)?, 0.75);
        assert_eq!(top_k_accuracy(&logits, &labels, 5)?, 1.0);
        assert!(top_k_accuracy(&logits, &labels.narrow(0, 0, 3), 1).is_err());
        Ok(())
    }
}
