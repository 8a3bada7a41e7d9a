//! Homogeneous 2-D transforms and the least-squares estimators behind every
//! registration stage.
//!
//! Points use image conventions: `x` is the column, `y` the row, both in
//! pixels of whatever image the point belongs to.

pub mod chain;
pub mod fib;
pub mod orientation;

pub use chain::*;
pub use fib::*;
pub use orientation::*;

use crate::error::RegistrationError;
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Relative singular-value floor below which a design matrix counts as rank deficient.
const RANK_TOLERANCE: f64 = 1e-10;

/// Determinant floor below which a 3x3 transform is treated as singular.
const SINGULAR_TOLERANCE: f64 = 1e-12;

/// Minimum number of correspondences accepted by [`estimate_affine`].
pub const MIN_AFFINE_POINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn to_homogeneous(self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, 1.0)
    }
}

impl From<(f64, f64)> for Point2 {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for Point2 {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

/// Which estimator or bookkeeping step produced a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformKind {
    Identity,
    Translation,
    Affine,
    Similarity,
    Orientation,
    Refinement,
    Combined,
}

/// A 3x3 homogeneous transform mapping one image's pixel space into another's.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(with = "matrix3_rows")]
    pub matrix: Matrix3<f64>,
    pub kind: TransformKind,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn new(matrix: Matrix3<f64>, kind: TransformKind) -> Self {
        Self { matrix, kind }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity(), TransformKind::Identity)
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self::new(
            Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0),
            TransformKind::Translation,
        )
    }

    pub fn from_rows(rows: [[f64; 3]; 3], kind: TransformKind) -> Self {
        Self::new(Matrix3::from_fn(|r, c| rows[r][c]), kind)
    }

    pub fn to_rows(&self) -> [[f64; 3]; 3] {
        let m = &self.matrix;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }

    pub fn apply(&self, point: Point2) -> Point2 {
        let v = self.matrix * point.to_homogeneous();
        // Affine transforms keep w == 1; divide anyway so composed chains stay exact.
        let w = if v.z.abs() > f64::EPSILON { v.z } else { 1.0 };
        Point2::new(v.x / w, v.y / w)
    }

    pub fn apply_all(&self, points: &[Point2]) -> Vec<Point2> {
        points.iter().map(|p| self.apply(*p)).collect()
    }

    pub fn determinant(&self) -> f64 {
        self.matrix.determinant()
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        (self.matrix - Matrix3::identity()).abs().max() <= tolerance
    }

    /// Translation column `(tx, ty)`.
    pub fn translation_part(&self) -> (f64, f64) {
        (self.matrix[(0, 2)], self.matrix[(1, 2)])
    }

    /// The same transform with `(dx, dy)` added to its translation.
    pub fn shifted(&self, dx: f64, dy: f64) -> Self {
        let mut matrix = self.matrix;
        matrix[(0, 2)] += dx;
        matrix[(1, 2)] += dy;
        Self::new(matrix, self.kind)
    }

    pub fn inverse(&self) -> crate::Result<Self> {
        invert(self)
    }
}

/// Sorts a point set along the fixed sweep direction `cos(60°)·x + y`.
///
/// The two point sets of a grid square are paired purely by this order, so
/// both must already share the same handedness (see [`Orientation`]).
pub fn canonical_order(points: &[Point2]) -> Vec<Point2> {
    let sweep = 60f64.to_radians().cos();
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| (sweep * a.x + a.y).total_cmp(&(sweep * b.x + b.y)));
    sorted
}

/// Multiplies transforms left to right: `compose(&[a, b])` applies `b` first.
pub fn compose(transforms: &[Transform]) -> Transform {
    match transforms {
        [] => Transform::identity(),
        [single] => *single,
        _ => {
            let matrix = transforms
                .iter()
                .fold(Matrix3::identity(), |acc, t| acc * t.matrix);
            Transform::new(matrix, TransformKind::Combined)
        }
    }
}

pub fn invert(transform: &Transform) -> crate::Result<Transform> {
    let determinant = transform.determinant();
    if !determinant.is_finite() || determinant.abs() < SINGULAR_TOLERANCE {
        return Err(RegistrationError::SingularTransform { determinant });
    }
    let inverse = transform
        .matrix
        .try_inverse()
        .ok_or(RegistrationError::SingularTransform { determinant })?;
    Ok(Transform::new(inverse, transform.kind))
}

/// Least-squares affine transform mapping `src` onto `dst`.
///
/// Needs at least four correspondences; more are solved in the
/// over-determined least-squares sense.
pub fn estimate_affine(src: &[Point2], dst: &[Point2]) -> crate::Result<Transform> {
    check_pairs(src, dst, MIN_AFFINE_POINTS)?;

    let norm = Normalization::from_points(src);
    let n = src.len();
    let mut design = DMatrix::<f64>::zeros(n, 3);
    for (i, p) in src.iter().enumerate() {
        let q = norm.apply(*p);
        design[(i, 0)] = q.x;
        design[(i, 1)] = q.y;
        design[(i, 2)] = 1.0;
    }
    check_rank(&design, "source points are collinear or coincident")?;

    let svd = design.svd(true, true);
    let bx = DVector::from_iterator(n, dst.iter().map(|p| p.x));
    let by = DVector::from_iterator(n, dst.iter().map(|p| p.y));
    let row_x = svd
        .solve(&bx, RANK_TOLERANCE)
        .map_err(|e| RegistrationError::DegenerateGeometry(e.to_string()))?;
    let row_y = svd
        .solve(&by, RANK_TOLERANCE)
        .map_err(|e| RegistrationError::DegenerateGeometry(e.to_string()))?;

    let normalized = Matrix3::new(
        row_x[0], row_x[1], row_x[2], row_y[0], row_y[1], row_y[2], 0.0, 0.0, 1.0,
    );
    Ok(Transform::new(
        normalized * norm.matrix(),
        TransformKind::Affine,
    ))
}

/// Least-squares rotation + uniform scale + translation (no shear).
pub fn estimate_similarity(src: &[Point2], dst: &[Point2]) -> crate::Result<Transform> {
    check_pairs(src, dst, 2)?;

    let norm = Normalization::from_points(src);
    let n = src.len();
    // Unknowns [a, b, tx, ty] with x' = a·x − b·y + tx, y' = b·x + a·y + ty.
    let mut design = DMatrix::<f64>::zeros(2 * n, 4);
    let mut rhs = DVector::<f64>::zeros(2 * n);
    for (i, (p, d)) in src.iter().zip(dst).enumerate() {
        let q = norm.apply(*p);
        design[(2 * i, 0)] = q.x;
        design[(2 * i, 1)] = -q.y;
        design[(2 * i, 2)] = 1.0;
        design[(2 * i + 1, 0)] = q.y;
        design[(2 * i + 1, 1)] = q.x;
        design[(2 * i + 1, 3)] = 1.0;
        rhs[2 * i] = d.x;
        rhs[2 * i + 1] = d.y;
    }
    check_rank(&design, "source points are coincident")?;

    let params = design
        .svd(true, true)
        .solve(&rhs, RANK_TOLERANCE)
        .map_err(|e| RegistrationError::DegenerateGeometry(e.to_string()))?;
    let (a, b, tx, ty) = (params[0], params[1], params[2], params[3]);
    let normalized = Matrix3::new(a, -b, tx, b, a, ty, 0.0, 0.0, 1.0);
    Ok(Transform::new(
        normalized * norm.matrix(),
        TransformKind::Similarity,
    ))
}

fn check_pairs(src: &[Point2], dst: &[Point2], required: usize) -> crate::Result<()> {
    if src.len() != dst.len() {
        return Err(RegistrationError::InvalidInput(format!(
            "point sets differ in length ({} vs {})",
            src.len(),
            dst.len()
        )));
    }
    if src.len() < required {
        return Err(RegistrationError::insufficient(required, src.len()));
    }
    if src
        .iter()
        .chain(dst)
        .any(|p| !p.x.is_finite() || !p.y.is_finite())
    {
        return Err(RegistrationError::InvalidInput(
            "point coordinates must be finite".to_string(),
        ));
    }
    Ok(())
}

fn check_rank(design: &DMatrix<f64>, reason: &str) -> crate::Result<()> {
    let singular = design.singular_values();
    let max = singular.max();
    let min = singular.min();
    if max <= 0.0 || min / max < RANK_TOLERANCE {
        return Err(RegistrationError::DegenerateGeometry(reason.to_string()));
    }
    Ok(())
}

/// Centre-and-scale conditioning of the source coordinates.
struct Normalization {
    cx: f64,
    cy: f64,
    scale: f64,
}

impl Normalization {
    fn from_points(points: &[Point2]) -> Self {
        let n = points.len().max(1) as f64;
        let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
        let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
        let mean_dist = points
            .iter()
            .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
            .sum::<f64>()
            / n;
        let scale = if mean_dist > f64::EPSILON {
            1.0 / mean_dist
        } else {
            1.0
        };
        Self { cx, cy, scale }
    }

    fn apply(&self, p: Point2) -> Point2 {
        Point2::new((p.x - self.cx) * self.scale, (p.y - self.cy) * self.scale)
    }

    fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.scale,
            0.0,
            -self.cx * self.scale,
            0.0,
            self.scale,
            -self.cy * self.scale,
            0.0,
            0.0,
            1.0,
        )
    }
}

/// Serialises a `Matrix3` as three plain rows.
pub(crate) mod matrix3_rows {
    use nalgebra::Matrix3;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(m: &Matrix3<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        let rows: [[f64; 3]; 3] = std::array::from_fn(|r| std::array::from_fn(|c| m[(r, c)]));
        rows.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Matrix3<f64>, D::Error> {
        let rows = <[[f64; 3]; 3]>::deserialize(deserializer)?;
        Ok(Matrix3::from_fn(|r, c| rows[r][c]))
    }
}
