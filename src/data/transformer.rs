use crate::data::Image;
use crate::transform::{Point2, Transform};
use ndarray::Array2;

/// Tolerance for samples that land a hair outside the last pixel centre.
const EDGE_EPSILON: f64 = 1e-9;

pub struct ImageTransformer;

impl ImageTransformer {
    /// Resamples `image` through the forward transform `forward` into an
    /// `output_shape` canvas `(rows, cols)`.
    ///
    /// Each output pixel is pulled from the source through the inverse map,
    /// bilinearly interpolated; samples outside the source are 0.
    pub fn warp(
        image: &Image,
        forward: &Transform,
        output_shape: (usize, usize),
    ) -> crate::Result<Image> {
        let inverse = forward.inverse()?;
        let source = &image.data;
        let warped = Array2::from_shape_fn(output_shape, |(row, col)| {
            let p = inverse.apply(Point2::new(col as f64, row as f64));
            Self::bilinear_interpolate(source, p.x, p.y)
        });
        Ok(image.derive(warped))
    }

    /// Bilinear interpolation at continuous pixel position `(x, y)`.
    pub fn bilinear_interpolate(data: &Array2<f32>, x: f64, y: f64) -> f32 {
        let (height, width) = data.dim();
        if height == 0 || width == 0 {
            return 0.0;
        }
        let max_x = (width - 1) as f64;
        let max_y = (height - 1) as f64;
        if x < -EDGE_EPSILON || y < -EDGE_EPSILON || x > max_x + EDGE_EPSILON || y > max_y + EDGE_EPSILON {
            return 0.0;
        }
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);

        let x1 = x.floor() as usize;
        let y1 = y.floor() as usize;
        let x2 = (x1 + 1).min(width - 1);
        let y2 = (y1 + 1).min(height - 1);

        let fx = x - x1 as f64;
        let fy = y - y1 as f64;

        let p11 = data[[y1, x1]] as f64;
        let p12 = data[[y2, x1]] as f64;
        let p21 = data[[y1, x2]] as f64;
        let p22 = data[[y2, x2]] as f64;

        let interpolated = p11 * (1.0 - fx) * (1.0 - fy)
            + p21 * fx * (1.0 - fy)
            + p12 * (1.0 - fx) * fy
            + p22 * fx * fy;

        interpolated as f32
    }
}
