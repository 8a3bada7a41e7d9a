use crate::data::{Image, ImageTransformer};
use crate::error::RegistrationError;
use crate::transform::{estimate_affine, estimate_similarity, Point2, Transform};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const GRID_CORNERS: usize = 4;

/// Estimator used to map the clicked grid square onto an ideal square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GridMode {
    #[default]
    Affine,
    /// Rotation, uniform scale and translation only.
    RotationOnly,
}

/// A grid square and the transform that makes it square.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridDefinition {
    /// Corners in the order they were given, raw image pixels.
    pub corners: Vec<Point2>,
    /// Mean edge length including the closing edge.
    pub side_length: f64,
    /// Standard deviation of the four edge lengths.
    pub side_std: f64,
    pub mode: GridMode,
    /// Raw image pixels into the transformed canvas, bounding box at the origin.
    pub transform: Transform,
    /// `(rows, cols)` of the transformed canvas.
    pub output_shape: (usize, usize),
    /// `corners` in transformed canvas pixels.
    pub transformed_points: Vec<Point2>,
}

/// Edge lengths of the closed polygon through `corners`.
fn edge_lengths(corners: &[Point2]) -> Vec<f64> {
    corners
        .iter()
        .zip(corners.iter().cycle().skip(1))
        .map(|(a, b)| a.distance(b))
        .collect()
}

/// Maps four clicked corners onto a square of the same mean side length.
///
/// The square is axis aligned, centred on the corners' centroid, and visits
/// its corners in the order `(0,0), (s,0), (s,s), (0,s)` relative to its
/// top-left, matching the order of `corners`. The estimated transform is then
/// shifted so the transformed image of shape `image_shape` starts at the origin.
pub fn define_grid(
    corners: &[Point2],
    image_shape: (usize, usize),
    mode: GridMode,
) -> crate::Result<GridDefinition> {
    if corners.len() != GRID_CORNERS {
        return Err(RegistrationError::insufficient(GRID_CORNERS, corners.len()));
    }

    let edges = edge_lengths(corners);
    let side_length = edges.iter().sum::<f64>() / edges.len() as f64;
    let side_std = (edges.iter().map(|e| (e - side_length).powi(2)).sum::<f64>()
        / edges.len() as f64)
        .sqrt();
    if side_length <= f64::EPSILON {
        return Err(RegistrationError::DegenerateGeometry(
            "grid corners coincide".to_string(),
        ));
    }

    let n = corners.len() as f64;
    let centre_x = corners.iter().map(|p| p.x).sum::<f64>() / n;
    let centre_y = corners.iter().map(|p| p.y).sum::<f64>() / n;
    let (ox, oy) = (centre_x - side_length / 2.0, centre_y - side_length / 2.0);
    let square = [
        Point2::new(ox, oy),
        Point2::new(ox + side_length, oy),
        Point2::new(ox + side_length, oy + side_length),
        Point2::new(ox, oy + side_length),
    ];

    let estimate = match mode {
        GridMode::Affine => estimate_affine(corners, &square)?,
        GridMode::RotationOnly => estimate_similarity(corners, &square)?,
    };

    let (rows, cols) = (image_shape.0 as f64, image_shape.1 as f64);
    let frame = estimate.apply_all(&[
        Point2::new(0.0, 0.0),
        Point2::new(cols, 0.0),
        Point2::new(cols, rows),
        Point2::new(0.0, rows),
    ]);
    let min_x = frame.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let min_y = frame.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_x = frame.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let max_y = frame.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);

    let transform = estimate.shifted(-min_x, -min_y);
    let output_shape = (
        extent(max_y - min_y),
        extent(max_x - min_x),
    );
    let transformed_points = transform.apply_all(corners);

    info!(
        side_length = format!("{:.3}", side_length),
        side_std = format!("{:.3}", side_std),
        rows = output_shape.0,
        cols = output_shape.1,
        ?mode,
        "Grid square defined"
    );

    Ok(GridDefinition {
        corners: corners.to_vec(),
        side_length,
        side_std,
        mode,
        transform,
        output_shape,
        transformed_points,
    })
}

/// Pixel count covering `span`; spans within rounding noise of an integer are not bumped.
fn extent(span: f64) -> usize {
    let rounded = span.round();
    if (span - rounded).abs() < 1e-9 {
        rounded as usize
    } else {
        span.ceil() as usize
    }
}

/// Resamples `image` into the grid's transformed canvas.
pub fn apply_transform(image: &Image, grid: &GridDefinition) -> crate::Result<Image> {
    ImageTransformer::warp(image, &grid.transform, grid.output_shape)
}
