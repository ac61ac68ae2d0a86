use crate::common::*;

/// Tiles `[n, c, h, w]` patches into one `[c, rows * h, columns * w]` image.
///
/// Missing cells of the last row are left black.
pub fn tile_patches(patches: &Tensor, columns: i64) -> Result<Tensor> {
    let (num_patches, channels, height, width) = patches.size4()?;
    ensure!(columns > 0, "columns must be positive");
    ensure!(num_patches > 0, "no patches to tile");

    let rows = (num_patches + columns - 1) / columns;
    let padding = rows * columns - num_patches;

    let grid = if padding > 0 {
        let blank = Tensor::zeros(
            &[padding, channels, height, width],
            (patches.kind(), patches.device()),
        );
        Tensor::cat(&[patches.shallow_clone(), blank], 0)
    } else {
        patches.shallow_clone()
    };

    // [rows, columns, c, h, w] -> [c, rows, h, columns, w]
    Ok(grid
        .contiguous()
        .view([rows, columns, channels, height, width])
        .permute(&[2, 0, 3, 1, 4])
        .contiguous()
        .view([channels, rows * height, columns * width]))
}

/// Maps values in `[-1, 1]` back to `[0, 1]` for display.
pub fn to_display_range(image: &Tensor) -> Tensor {
    ((image + 1.0) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_with_padding() -> Result<()> {
        let patches = Tensor::arange(5, FLOAT_CPU)
            .view([5, 1, 1, 1])
            .expand(&[5, 3, 2, 2], false);
        let grid = tile_patches(&patches, 2)?;
        assert_eq!(grid.size(), vec![3, 6, 4]);

        // the third row holds the fifth patch and a black cell
        ensure!(grid.double_value(&[0, 0, 2]) == 1.0);
        ensure!(grid.double_value(&[1, 2, 0]) == 2.0);
        ensure!(grid.double_value(&[2, 5, 1]) == 4.0);
        ensure!(grid.double_value(&[2, 5, 3]) == 0.0);
        Ok(())
    }

    #[test]
    fn display_range() {
        let image = Tensor::of_slice(&[-1.0f32, 0.0, 1.0]);
        let values: Vec<f32> = Vec::from(&to_display_range(&image));
        assert_eq!(values, vec![0.0, 0.5, 1.0]);
    }
}
