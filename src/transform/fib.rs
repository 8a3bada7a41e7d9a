use super::{Point2, Transform};
use nalgebra::{Matrix3x4, Matrix4, Vector4};
use serde::{Deserialize, Serialize};

pub const DEFAULT_FIB_TILT_DEGREES: f64 = 52.0;

/// Geometry of the ion-beam view used to build a [`FibProjection`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FibGeometry {
    /// Stage tilt between electron and ion beam, in degrees.
    pub tilt_degrees: f64,
    /// Ratio of z-step to in-plane pixel size of the z-stack.
    pub z_scale: f64,
    /// Slice index the grid square was defined on.
    pub z_origin: f64,
}

impl Default for FibGeometry {
    fn default() -> Self {
        Self {
            tilt_degrees: DEFAULT_FIB_TILT_DEGREES,
            z_scale: 1.0,
            z_origin: 0.0,
        }
    }
}

/// Maps `(x, y, z)` into the 2-D pixel space of a FIB slice.
///
/// The in-plane transform (which already carries the `cos(tilt)`
/// foreshortening of the grid square) is applied first. Depth is then lifted
/// into the slice's own vertical axis as a displacement of
/// `(z - z_origin) * z_scale * tan(tilt)`, converted into target pixels.
/// Points on the reference slice map exactly like the 2-D grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FibProjection {
    #[serde(with = "matrix3x4_rows")]
    pub matrix: Matrix3x4<f64>,
}

impl FibProjection {
    /// `pixel_ratio` is the source pixel size over the target pixel size; it
    /// brings the z-step, given in source pixels, into target pixels.
    pub fn new(in_plane: &Transform, geometry: &FibGeometry, pixel_ratio: f64) -> Self {
        let k = geometry.z_scale * pixel_ratio * geometry.tilt_degrees.to_radians().tan();
        let t = &in_plane.matrix;
        // (x, y, z, 1) -> (x', y', z, w)
        let embedded = Matrix4::new(
            t[(0, 0)], t[(0, 1)], 0.0, t[(0, 2)], //
            t[(1, 0)], t[(1, 1)], 0.0, t[(1, 2)], //
            0.0, 0.0, 1.0, 0.0, //
            t[(2, 0)], t[(2, 1)], 0.0, t[(2, 2)],
        );
        let lift = Matrix3x4::new(
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, k, -k * geometry.z_origin, //
            0.0, 0.0, 0.0, 1.0,
        );
        Self {
            matrix: lift * embedded,
        }
    }

    pub fn from_rows(rows: [[f64; 4]; 3]) -> Self {
        Self {
            matrix: Matrix3x4::from_fn(|r, c| rows[r][c]),
        }
    }

    pub fn apply(&self, point: Point2, z: f64) -> Point2 {
        let v = self.matrix * Vector4::new(point.x, point.y, z, 1.0);
        let w = if v.z.abs() > f64::EPSILON { v.z } else { 1.0 };
        Point2::new(v.x / w, v.y / w)
    }
}

mod matrix3x4_rows {
    use nalgebra::Matrix3x4;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(m: &Matrix3x4<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        let rows: [[f64; 4]; 3] = std::array::from_fn(|r| std::array::from_fn(|c| m[(r, c)]));
        rows.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Matrix3x4<f64>, D::Error> {
        let rows = <[[f64; 4]; 3]>::deserialize(deserializer)?;
        Ok(Matrix3x4::from_fn(|r, c| rows[r][c]))
    }
}
