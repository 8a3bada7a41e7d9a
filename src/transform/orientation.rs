use super::{Point2, Transform, TransformKind};
use nalgebra::Matrix3;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

/// Explicit flip/transpose/rotate state of one modality.
///
/// Operations apply in a fixed order: transpose, clockwise quarter turn,
/// horizontal flip, vertical flip. Coordinates follow pixel indices, so a
/// point on pixel `(x, y)` lands exactly on the re-oriented pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub transpose: bool,
    pub rotate_90: bool,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl Orientation {
    pub fn is_identity(&self) -> bool {
        !(self.transpose || self.rotate_90 || self.flip_horizontal || self.flip_vertical)
    }

    /// Shape `(rows, cols)` after re-orienting an image of shape `shape`.
    pub fn oriented_shape(&self, shape: (usize, usize)) -> (usize, usize) {
        let (rows, cols) = shape;
        if self.transpose ^ self.rotate_90 {
            (cols, rows)
        } else {
            (rows, cols)
        }
    }

    /// Point map from the original image of `shape` into the re-oriented one.
    pub fn matrix(&self, shape: (usize, usize)) -> Transform {
        let (mut height, mut width) = (shape.0 as f64, shape.1 as f64);
        let mut m = Matrix3::identity();

        if self.transpose {
            m = Matrix3::new(0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0) * m;
            std::mem::swap(&mut width, &mut height);
        }
        if self.rotate_90 {
            // (x, y) -> (h - 1 - y, x)
            m = Matrix3::new(0.0, -1.0, height - 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0) * m;
            std::mem::swap(&mut width, &mut height);
        }
        if self.flip_horizontal {
            m = Matrix3::new(-1.0, 0.0, width - 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0) * m;
        }
        if self.flip_vertical {
            m = Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, height - 1.0, 0.0, 0.0, 1.0) * m;
        }

        Transform::new(m, TransformKind::Orientation)
    }

    pub fn apply_to_points(&self, points: &[Point2], shape: (usize, usize)) -> Vec<Point2> {
        self.matrix(shape).apply_all(points)
    }

    pub fn apply_to_image(&self, image: &Array2<f32>) -> Array2<f32> {
        let mut out = image.clone();
        if self.transpose {
            out = out.t().to_owned();
        }
        if self.rotate_90 {
            let (h, w) = out.dim();
            let src = out;
            out = Array2::from_shape_fn((w, h), |(r, c)| src[[h - 1 - c, r]]);
        }
        if self.flip_horizontal {
            out = out.slice(s![.., ..;-1]).to_owned();
        }
        if self.flip_vertical {
            out = out.slice(s![..;-1, ..]).to_owned();
        }
        out
    }
}
