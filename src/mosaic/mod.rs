//! Montage reassembly for tiled EM acquisitions.
//!
//! Tiles are pixel-aligned through integer stage offsets, so overlaps are
//! resolved by count-normalised averaging without any spatial index.

use crate::data::Image;
use crate::error::RegistrationError;
use crate::transform::Point2;
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Overlapping tiles with their integer pixel offsets `(x, y)` and stage heights.
#[derive(Debug, Clone, PartialEq)]
pub struct TileStack {
    tiles: Array3<f32>,
    offsets: Vec<(i64, i64)>,
    heights: Vec<f64>,
    pixel_size: f64,
}

impl TileStack {
    pub fn new(
        tiles: Array3<f32>,
        offsets: Vec<(i64, i64)>,
        heights: Vec<f64>,
        pixel_size: f64,
    ) -> crate::Result<Self> {
        let count = tiles.len_of(Axis(0));
        if offsets.len() != count || heights.len() != count {
            return Err(RegistrationError::InvalidInput(format!(
                "{} tiles but {} offsets and {} heights",
                count,
                offsets.len(),
                heights.len()
            )));
        }
        if let Some(&(x, y)) = offsets.iter().find(|(x, y)| *x < 0 || *y < 0) {
            return Err(RegistrationError::InvalidInput(format!(
                "tile offset ({x}, {y}) is negative"
            )));
        }
        Ok(Self {
            tiles,
            offsets,
            heights,
            pixel_size,
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// `(rows, cols)` of a single tile.
    pub fn tile_shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.tiles.dim();
        (rows, cols)
    }

    pub fn offsets(&self) -> &[(i64, i64)] {
        &self.offsets
    }

    pub fn heights(&self) -> &[f64] {
        &self.heights
    }

    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    pub fn tile(&self, index: usize) -> ArrayView2<'_, f32> {
        self.tiles.index_axis(Axis(0), index)
    }

    /// Subsamples every tile by `stride` and divides offsets by the same stride.
    pub fn downsample(&self, stride: usize) -> Self {
        let stride = stride.max(1);
        if stride == 1 {
            return self.clone();
        }
        let step = stride as isize;
        let tiles = self.tiles.slice(s![.., ..;step, ..;step]).to_owned();
        let offsets = self
            .offsets
            .iter()
            .map(|&(x, y)| (x / stride as i64, y / stride as i64))
            .collect();
        Self {
            tiles,
            offsets,
            heights: self.heights.clone(),
            pixel_size: self.pixel_size * stride as f64,
        }
    }
}

/// Raw input of an EM acquisition: already one plane, or a montage to merge.
#[derive(Debug, Clone, PartialEq)]
pub enum Montage {
    Single(Image),
    Tiled(TileStack),
}

/// Canvas-space rectangle covered by one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileFootprint {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl TileFootprint {
    pub fn contains(&self, point: Point2) -> bool {
        point.x >= self.x as f64
            && point.y >= self.y as f64
            && point.x < (self.x + self.width) as f64
            && point.y < (self.y + self.height) as f64
    }

    pub fn center(&self) -> Point2 {
        Point2::new(
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

/// Assembled canvas with per-pixel coverage counts and tile footprints.
#[derive(Debug, Clone, PartialEq)]
pub struct Mosaic {
    pub image: Image,
    pub counts: Array2<u32>,
    pub footprints: Vec<TileFootprint>,
}

impl Mosaic {
    /// Index of the tile owning a canvas point.
    ///
    /// Points in an overlap go to the tile whose centre is nearest; a tie
    /// between equally near tiles is ambiguous.
    pub fn tile_at(&self, point: Point2) -> crate::Result<usize> {
        let candidates: Vec<usize> = self
            .footprints
            .iter()
            .enumerate()
            .filter(|(_, f)| f.contains(point))
            .map(|(i, _)| i)
            .collect();

        match candidates.as_slice() {
            [] => Err(RegistrationError::InvalidInput(format!(
                "point ({:.1}, {:.1}) lies outside every tile",
                point.x, point.y
            ))),
            [single] => Ok(*single),
            _ => {
                let distances: Vec<(usize, f64)> = candidates
                    .iter()
                    .map(|&i| (i, self.footprints[i].center().distance(&point)))
                    .collect();
                let best = distances
                    .iter()
                    .map(|(_, d)| *d)
                    .fold(f64::INFINITY, f64::min);
                let nearest: Vec<usize> = distances
                    .iter()
                    .filter(|(_, d)| (d - best).abs() < 1e-9)
                    .map(|(i, _)| *i)
                    .collect();
                if nearest.len() == 1 {
                    Ok(nearest[0])
                } else {
                    Err(RegistrationError::IndexAmbiguity {
                        x: point.x,
                        y: point.y,
                        candidates: nearest,
                    })
                }
            }
        }
    }

    /// Canvas crop covered by tile `index` and its canvas offset.
    pub fn tile_region(&self, index: usize) -> crate::Result<(Point2, Image)> {
        let f = self.footprints.get(index).ok_or_else(|| {
            RegistrationError::InvalidInput(format!(
                "tile index {index} out of range ({} tiles)",
                self.footprints.len()
            ))
        })?;
        let crop = self
            .image
            .data
            .slice(s![f.y..f.y + f.height, f.x..f.x + f.width])
            .to_owned();
        Ok((
            Point2::new(f.x as f64, f.y as f64),
            self.image.derive(crop),
        ))
    }
}

/// Merges a montage into one continuous image.
///
/// Every tile's values are summed into the canvas at its offset while a
/// parallel count buffer records coverage; covered pixels are then divided by
/// their count and uncovered pixels stay 0. Single planes pass through.
pub fn assemble_mosaic(montage: &Montage) -> Mosaic {
    let stack = match montage {
        Montage::Single(image) => {
            let (rows, cols) = image.shape();
            return Mosaic {
                image: image.clone(),
                counts: Array2::ones((rows, cols)),
                footprints: vec![TileFootprint {
                    x: 0,
                    y: 0,
                    width: cols,
                    height: rows,
                }],
            };
        }
        Montage::Tiled(stack) => stack,
    };

    let (tile_rows, tile_cols) = stack.tile_shape();
    let max_x = stack.offsets.iter().map(|o| o.0).max().unwrap_or(0) as usize;
    let max_y = stack.offsets.iter().map(|o| o.1).max().unwrap_or(0) as usize;
    let canvas_shape = (max_y + tile_rows, max_x + tile_cols);
    info!(
        tiles = stack.len(),
        canvas_rows = canvas_shape.0,
        canvas_cols = canvas_shape.1,
        "Assembling montage"
    );

    let mut sum = Array2::<f64>::zeros(canvas_shape);
    let mut counts = Array2::<u32>::zeros(canvas_shape);
    let mut footprints = Vec::with_capacity(stack.len());

    for (i, &(x, y)) in stack.offsets.iter().enumerate() {
        let (x, y) = (x as usize, y as usize);
        let region = s![y..y + tile_rows, x..x + tile_cols];
        sum.slice_mut(region)
            .zip_mut_with(&stack.tile(i), |acc, &v| *acc += v as f64);
        counts.slice_mut(region).mapv_inplace(|c| c + 1);
        footprints.push(TileFootprint {
            x,
            y,
            width: tile_cols,
            height: tile_rows,
        });
        debug!(tile = i, x, y, "Merged tile");
    }

    let mut merged = Array2::<f32>::zeros(canvas_shape);
    ndarray::Zip::from(&mut merged)
        .and(&sum)
        .and(&counts)
        .for_each(|out, &s, &c| {
            if c > 0 {
                *out = (s / c as f64) as f32;
            }
        });

    Mosaic {
        image: Image::new(merged, stack.pixel_size),
        counts,
        footprints,
    }
}
