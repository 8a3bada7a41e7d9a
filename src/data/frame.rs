use ndarray::{Array2, Array3, Axis};

/// Single-plane intensity image with its physical pixel size.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub data: Array2<f32>,
    /// Physical units per pixel (nm for the instruments this crate targets).
    pub pixel_size: f64,
}

impl Image {
    pub fn new(data: Array2<f32>, pixel_size: f64) -> Self {
        Self { data, pixel_size }
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// Derived image sharing this image's pixel size.
    pub fn derive(&self, data: Array2<f32>) -> Self {
        Self::new(data, self.pixel_size)
    }
}

/// Slice-major z-stack `(z, rows, cols)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ZStack {
    pub data: Array3<f32>,
    pub pixel_size: f64,
    /// Physical distance between consecutive slices.
    pub z_step: f64,
}

impl ZStack {
    pub fn new(data: Array3<f32>, pixel_size: f64, z_step: f64) -> Self {
        Self {
            data,
            pixel_size,
            z_step,
        }
    }

    pub fn num_slices(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn slice(&self, z: usize) -> Image {
        Image::new(self.data.index_axis(Axis(0), z).to_owned(), self.pixel_size)
    }

    pub fn max_projection(&self) -> Image {
        let projection = self
            .data
            .fold_axis(Axis(0), f32::NEG_INFINITY, |acc, &v| acc.max(v));
        Image::new(projection, self.pixel_size)
    }

    /// Intensity along z at pixel `(row, col)`.
    pub fn profile(&self, row: usize, col: usize) -> Vec<f64> {
        self.data
            .index_axis(Axis(2), col)
            .index_axis(Axis(1), row)
            .iter()
            .map(|&v| v as f64)
            .collect()
    }

    /// Ratio of slice spacing to in-plane pixel size.
    pub fn z_scale(&self) -> f64 {
        if self.pixel_size > 0.0 {
            self.z_step / self.pixel_size
        } else {
            1.0
        }
    }
}
