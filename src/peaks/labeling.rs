//! Connected-component labelling of thresholded intensity images.
//!
//! Two-pass scan with a union-find equivalence table. Labels are consecutive
//! from 1 in raster order of each component's first pixel; 0 is background.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Pixel adjacency used when grouping foreground pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    /// Horizontal and vertical neighbours only.
    #[default]
    Four,
    /// Diagonal neighbours as well.
    Eight,
}

/// Inclusive pixel bounding box of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min_row: usize,
    pub min_col: usize,
    pub max_row: usize,
    pub max_col: usize,
}

impl BoundingBox {
    fn at(row: usize, col: usize) -> Self {
        Self {
            min_row: row,
            min_col: col,
            max_row: row,
            max_col: col,
        }
    }

    fn expand_to_include(&mut self, row: usize, col: usize) {
        self.min_row = self.min_row.min(row);
        self.min_col = self.min_col.min(col);
        self.max_row = self.max_row.max(row);
        self.max_col = self.max_col.max(col);
    }

    pub fn rows(&self) -> usize {
        self.max_row - self.min_row + 1
    }

    pub fn cols(&self) -> usize {
        self.max_col - self.min_col + 1
    }
}

/// Per-component measurements over the intensity image.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub label: usize,
    pub pixel_count: usize,
    pub bbox: BoundingBox,
    /// Intensity-weighted centroid `(row, col)`.
    pub centroid: (f64, f64),
    pub max_intensity: f32,
}

fn find_root(parents: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parents[current] {
        parents[current] = parents[parents[current]];
        current = parents[current];
    }
    current
}

fn union_labels(parents: &mut [usize], a: usize, b: usize) {
    let root_a = find_root(parents, a);
    let root_b = find_root(parents, b);
    if root_a < root_b {
        parents[root_b] = root_a;
    } else if root_b < root_a {
        parents[root_a] = root_b;
    }
}

/// Labels every pixel with value `> 0`. Returns the label image and the label count.
pub fn label_components(image: &ArrayView2<f32>, connectivity: Connectivity) -> (Array2<usize>, usize) {
    let (height, width) = image.dim();
    let mut labels = Array2::<usize>::zeros((height, width));
    let mut parents = vec![0usize];
    let mut neighbours = Vec::with_capacity(4);

    for i in 0..height {
        for j in 0..width {
            if image[[i, j]] <= 0.0 {
                continue;
            }

            neighbours.clear();
            if i > 0 && labels[[i - 1, j]] > 0 {
                neighbours.push(labels[[i - 1, j]]);
            }
            if j > 0 && labels[[i, j - 1]] > 0 {
                neighbours.push(labels[[i, j - 1]]);
            }
            if connectivity == Connectivity::Eight && i > 0 {
                if j > 0 && labels[[i - 1, j - 1]] > 0 {
                    neighbours.push(labels[[i - 1, j - 1]]);
                }
                if j + 1 < width && labels[[i - 1, j + 1]] > 0 {
                    neighbours.push(labels[[i - 1, j + 1]]);
                }
            }

            match neighbours.iter().copied().min() {
                None => {
                    let label = parents.len();
                    parents.push(label);
                    labels[[i, j]] = label;
                }
                Some(min_label) => {
                    labels[[i, j]] = min_label;
                    for &other in &neighbours {
                        if other != min_label {
                            union_labels(&mut parents, min_label, other);
                        }
                    }
                }
            }
        }
    }

    let mut relabel = vec![0usize; parents.len()];
    let mut next_label = 0;
    for i in 1..parents.len() {
        let root = find_root(&mut parents, i);
        if relabel[root] == 0 {
            next_label += 1;
            relabel[root] = next_label;
        }
        relabel[i] = relabel[root];
    }

    labels.mapv_inplace(|l| relabel[l]);
    (labels, next_label)
}

/// Pixel count, bounding box and weighted centroid of labels `1..=count`.
///
/// Index `i` of the result describes label `i + 1`.
pub fn measure_components(
    image: &ArrayView2<f32>,
    labels: &ArrayView2<usize>,
    count: usize,
) -> Vec<Component> {
    let mut sizes = vec![0usize; count + 1];
    let mut boxes: Vec<Option<BoundingBox>> = vec![None; count + 1];
    let mut weights = vec![0.0f64; count + 1];
    let mut row_moments = vec![0.0f64; count + 1];
    let mut col_moments = vec![0.0f64; count + 1];
    let mut maxima = vec![f32::NEG_INFINITY; count + 1];

    for ((row, col), &label) in labels.indexed_iter() {
        if label == 0 || label > count {
            continue;
        }
        let value = image[[row, col]];
        sizes[label] += 1;
        match boxes[label].as_mut() {
            Some(bbox) => bbox.expand_to_include(row, col),
            None => boxes[label] = Some(BoundingBox::at(row, col)),
        }
        weights[label] += value as f64;
        row_moments[label] += value as f64 * row as f64;
        col_moments[label] += value as f64 * col as f64;
        maxima[label] = maxima[label].max(value);
    }

    (1..=count)
        .filter_map(|label| {
            let bbox = boxes[label]?;
            let centroid = if weights[label] > 0.0 {
                (row_moments[label] / weights[label], col_moments[label] / weights[label])
            } else {
                (
                    (bbox.min_row + bbox.max_row) as f64 / 2.0,
                    (bbox.min_col + bbox.max_col) as f64 / 2.0,
                )
            };
            Some(Component {
                label,
                pixel_count: sizes[label],
                bbox,
                centroid,
                max_intensity: maxima[label],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_diagonal_pixels_depend_on_connectivity() {
        let image = array![[1.0f32, 0.0], [0.0, 1.0]];

        let (_, four) = label_components(&image.view(), Connectivity::Four);
        let (_, eight) = label_components(&image.view(), Connectivity::Eight);

        assert_eq!(four, 2);
        assert_eq!(eight, 1);
    }

    #[test]
    fn test_u_shape_merges_into_one_label() {
        let image = array![
            [1.0f32, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
        ];

        let (labels, count) = label_components(&image.view(), Connectivity::Four);
        assert_eq!(count, 1);
        assert_eq!(labels[[0, 0]], labels[[0, 2]]);
    }

    #[test]
    fn test_weighted_centroid_and_bbox() {
        let image = array![
            [0.0f32, 0.0, 0.0, 0.0],
            [0.0, 1.0, 3.0, 0.0],
            [0.0, 0.0, 0.0, 0.0],
        ];

        let (labels, count) = label_components(&image.view(), Connectivity::Four);
        let components = measure_components(&image.view(), &labels.view(), count);

        assert_eq!(components.len(), 1);
        let c = &components[0];
        assert_eq!(c.pixel_count, 2);
        assert_eq!(c.bbox.cols(), 2);
        assert!((c.centroid.0 - 1.0).abs() < 1e-12);
        assert!((c.centroid.1 - 1.75).abs() < 1e-12);
        assert_eq!(c.max_intensity, 3.0);
    }
}
