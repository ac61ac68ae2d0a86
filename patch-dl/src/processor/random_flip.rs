//! Random horizontal flip of an image and its landmark points.

use crate::{common::*, record::Points};

/// Flips a `[c, h, w]` image left-right and maps the points accordingly.
///
/// A point `(x, y)` becomes `(|width - x|, |y|)`. A coordinate whose image
/// does not fit in `i32` is an error.
pub fn flip_left_right(image: &Tensor, points: &Points) -> Result<(Tensor, Points)> {
    let (_c, _h, width) = image.size3()?;
    let width = width as i32;

    let mut new_points = *points;
    for [x, y] in new_points.iter_mut() {
        let (new_x, new_y) = width
            .checked_sub(*x)
            .and_then(i32::checked_abs)
            .zip(y.checked_abs())
            .ok_or_else(|| format_err!("cannot flip landmark point ({}, {})", x, y))?;
        *x = new_x;
        *y = new_y;
    }

    let flipped = image.flip(&[2]);
    Ok((flipped, new_points))
}

/// Flips the image and points with the given probability.
///
/// The returned flag tells whether the flip was applied.
pub fn random_flip<R>(
    image: &Tensor,
    points: &Points,
    prob: f64,
    rng: &mut R,
) -> Result<(Tensor, Points, bool)>
where
    R: Rng + ?Sized,
{
    ensure!(
        (0.0..=1.0).contains(&prob),
        "flip probability must be in range [0, 1], but get {}",
        prob
    );

    if rng.gen_bool(prob) {
        let (image, points) = flip_left_right(image, points)?;
        Ok((image, points, true))
    } else {
        Ok((image.shallow_clone(), *points, false))
    }
}
