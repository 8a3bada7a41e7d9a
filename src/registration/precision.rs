//! Residual statistics of a registration and their convergence with point count.

use super::MatchedPointPair;
use crate::transform::{estimate_affine, Point2, TransformChain, MIN_AFFINE_POINTS};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// RMS residual of a correction refitted on the first `points` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergencePoint {
    pub points: usize,
    pub rms: f64,
}

/// Residuals in physical units (target pixel size times pixels).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrecisionEstimate {
    /// `observed - mapped` per pair.
    pub residuals: Vec<Point2>,
    /// Sample covariance of the residuals, `[[xx, xy], [yx, yy]]`.
    pub covariance: [[f64; 2]; 2],
    /// Square roots of the covariance diagonal.
    pub std: (f64, f64),
    pub distances: Vec<f64>,
    pub rms: f64,
    /// Empty unless enough pairs were available.
    pub convergence: Vec<ConvergencePoint>,
}

impl PrecisionEstimate {
    pub fn from_residuals(residuals: Vec<Point2>) -> Self {
        let n = residuals.len();
        let distances: Vec<f64> = residuals
            .iter()
            .map(|r| (r.x * r.x + r.y * r.y).sqrt())
            .collect();
        let rms = rms(&residuals);

        let mut covariance = [[0.0; 2]; 2];
        if n > 1 {
            let mean_x = residuals.iter().map(|r| r.x).sum::<f64>() / n as f64;
            let mean_y = residuals.iter().map(|r| r.y).sum::<f64>() / n as f64;
            for r in &residuals {
                let (dx, dy) = (r.x - mean_x, r.y - mean_y);
                covariance[0][0] += dx * dx;
                covariance[0][1] += dx * dy;
                covariance[1][1] += dy * dy;
            }
            for v in covariance.iter_mut().flatten() {
                *v /= (n - 1) as f64;
            }
            covariance[1][0] = covariance[0][1];
        }
        let std = (covariance[0][0].sqrt(), covariance[1][1].sqrt());

        Self {
            residuals,
            covariance,
            std,
            distances,
            rms,
            convergence: Vec::new(),
        }
    }
}

fn rms(residuals: &[Point2]) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    (residuals.iter().map(|r| r.x * r.x + r.y * r.y).sum::<f64>() / residuals.len() as f64).sqrt()
}

/// Residuals of every pair after mapping its source through `chain`.
pub fn estimate_precision(
    chain: &TransformChain,
    pairs: &[MatchedPointPair],
    pixel_size: f64,
) -> crate::Result<PrecisionEstimate> {
    let residuals = pairs
        .iter()
        .map(|pair| {
            let mapped = chain.apply(pair.source, pair.z)?;
            Ok(Point2::new(
                (pair.target.x - mapped.x) * pixel_size,
                (pair.target.y - mapped.y) * pixel_size,
            ))
        })
        .collect::<crate::Result<Vec<_>>>()?;
    Ok(PrecisionEstimate::from_residuals(residuals))
}

/// RMS over all pairs of corrections refitted on growing prefixes of the pairs.
///
/// `pre_refinement` are the pair sources mapped through the chain before the
/// correction. Nothing is computed below `min_points` pairs; otherwise the
/// prefixes run from `max(4, min_points - 4)` to all pairs. Prefixes whose
/// points are degenerate are left out of the curve.
pub fn convergence(
    pre_refinement: &[Point2],
    observed: &[Point2],
    min_points: usize,
    pixel_size: f64,
) -> Vec<ConvergencePoint> {
    let n = pre_refinement.len().min(observed.len());
    if n < min_points || n < MIN_AFFINE_POINTS {
        return Vec::new();
    }

    let first = MIN_AFFINE_POINTS.max(min_points.saturating_sub(MIN_AFFINE_POINTS));
    (first..=n)
        .filter_map(|k| {
            let correction = match estimate_affine(&pre_refinement[..k], &observed[..k]) {
                Ok(t) => t,
                Err(e) => {
                    debug!(points = k, error = %e, "Skipping convergence step");
                    return None;
                }
            };
            let residuals: Vec<Point2> = pre_refinement[..n]
                .iter()
                .zip(&observed[..n])
                .map(|(p, o)| {
                    let q = correction.apply(*p);
                    Point2::new((o.x - q.x) * pixel_size, (o.y - q.y) * pixel_size)
                })
                .collect();
            Some(ConvergencePoint {
                points: k,
                rms: rms(&residuals),
            })
        })
        .collect()
}
