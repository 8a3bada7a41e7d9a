//! Fiducial detection in fluorescence images.
//!
//! Beads show up as bright blobs. `find_peaks` thresholds the image, labels
//! connected blobs and classifies them by pixel count: too small is noise, a
//! mid-sized blob is one bead, and an oversized blob is split by raising the
//! threshold step by step until it falls apart into bead-sized pieces.

pub mod labeling;
pub mod lm;
pub mod z_fit;

pub use labeling::{label_components, measure_components, BoundingBox, Component, Connectivity};
pub use z_fit::{find_z_position, fit_peaks_z, z_profiles};

use crate::config::{PeakFindingConfig, ZFitConfig};
use crate::data::{Image, ZStack};
use crate::transform::Point2;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A detected fiducial with sub-pixel position and optional z.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub row: f64,
    pub col: f64,
    /// Slice-index position fitted from the z-profile.
    pub z: Option<f64>,
    /// Set when the position was changed by hand.
    pub moved: bool,
    original: (f64, f64),
}

impl Peak {
    pub fn new(row: f64, col: f64) -> Self {
        Self {
            row,
            col,
            z: None,
            moved: false,
            original: (row, col),
        }
    }

    pub fn from_point(point: Point2) -> Self {
        Self::new(point.y, point.x)
    }

    /// Position as `x = col`, `y = row`.
    pub fn position(&self) -> Point2 {
        Point2::new(self.col, self.row)
    }

    pub fn original(&self) -> (f64, f64) {
        self.original
    }

    pub fn move_to(&mut self, row: f64, col: f64) {
        self.row = row;
        self.col = col;
        self.moved = true;
    }

    /// Back to the detected position.
    pub fn reset(&mut self) {
        (self.row, self.col) = self.original;
        self.moved = false;
    }

    /// Makes the current position the new reference, e.g. after a refinement.
    pub fn accept_position(&mut self) {
        self.original = (self.row, self.col);
        self.moved = false;
    }
}

/// What to emit for a merged blob that could not be split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Leave the blob out.
    Skip,
    /// One position at the blob centroid.
    #[default]
    Centroid,
    /// The centroid once per estimated bead.
    Duplicate,
}

/// Classification of one connected component that passed the size filter.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentOutcome {
    Single(Point2),
    Resolved {
        positions: Vec<Point2>,
    },
    UnresolvedOverlap {
        centroid: Point2,
        estimated_count: usize,
        pixel_count: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeakDetection {
    /// Intensity threshold actually applied.
    pub threshold: f64,
    pub outcomes: Vec<ComponentOutcome>,
}

impl PeakDetection {
    pub fn positions(&self, policy: OverlapPolicy) -> Vec<Point2> {
        let mut positions = Vec::new();
        for outcome in &self.outcomes {
            match outcome {
                ComponentOutcome::Single(p) => positions.push(*p),
                ComponentOutcome::Resolved { positions: split } => positions.extend(split),
                ComponentOutcome::UnresolvedOverlap {
                    centroid,
                    estimated_count,
                    ..
                } => match policy {
                    OverlapPolicy::Skip => {}
                    OverlapPolicy::Centroid => positions.push(*centroid),
                    OverlapPolicy::Duplicate => {
                        positions.extend(std::iter::repeat(*centroid).take(*estimated_count))
                    }
                },
            }
        }
        positions
    }

    pub fn peaks(&self, policy: OverlapPolicy) -> Vec<Peak> {
        self.positions(policy).into_iter().map(Peak::from_point).collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ComponentOutcome::UnresolvedOverlap { .. }))
            .count()
    }
}

/// `fraction` of the mean of the `count` brightest pixels (all pixels when fewer).
pub fn automatic_threshold(data: &Array2<f32>, count: usize, fraction: f64) -> f64 {
    let mut values: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(|a, b| b.total_cmp(a));
    let top = &values[..count.clamp(1, values.len())];
    let mean = top.iter().map(|&v| v as f64).sum::<f64>() / top.len() as f64;
    fraction * mean
}

pub fn find_peaks(image: &Image, config: &PeakFindingConfig) -> PeakDetection {
    let threshold = config.threshold.unwrap_or_else(|| {
        automatic_threshold(&image.data, config.brightest_pixels, config.threshold_fraction)
    });

    let masked = image
        .data
        .mapv(|v| if (v as f64) < threshold { 0.0 } else { v });
    let (labels, count) = label_components(&masked.view(), config.connectivity);
    let components = measure_components(&masked.view(), &labels.view(), count);
    debug!(threshold, components = count, "Labelled thresholded image");

    let mut outcomes = Vec::new();
    for component in &components {
        if component.pixel_count < config.pixel_lower {
            continue;
        }
        let outcome = if component.pixel_count < config.pixel_upper {
            ComponentOutcome::Single(Point2::new(component.centroid.1, component.centroid.0))
        } else {
            separate_component(&masked, &labels, component, threshold, config)
        };
        outcomes.push(outcome);
    }

    let detection = PeakDetection { threshold, outcomes };
    info!(
        threshold = format!("{:.2}", threshold),
        peaks = detection.positions(config.overlap_policy).len(),
        unresolved = detection.unresolved_count(),
        "Peak detection finished"
    );
    detection
}

/// Detects peaks on the stack's maximum projection and fits z for each.
///
/// Peaks whose fit fails keep `z = None`; the per-peak results come back
/// alongside the detection.
pub fn find_stack_peaks(
    stack: &ZStack,
    config: &PeakFindingConfig,
    z_config: &ZFitConfig,
) -> crate::Result<(PeakDetection, Vec<Peak>, Vec<crate::Result<f64>>)> {
    let detection = find_peaks(&stack.max_projection(), config);
    let mut peaks = detection.peaks(config.overlap_policy);
    if peaks.is_empty() {
        return Ok((detection, peaks, Vec::new()));
    }
    let fits = fit_peaks_z(stack, &mut peaks, z_config)?;
    Ok((detection, peaks, fits))
}

/// Raises the threshold inside an oversized component until it splits into
/// pieces that are each at most `pixel_upper` large.
fn separate_component(
    masked: &Array2<f32>,
    labels: &Array2<usize>,
    component: &Component,
    threshold: f64,
    config: &PeakFindingConfig,
) -> ComponentOutcome {
    let unresolved = ComponentOutcome::UnresolvedOverlap {
        centroid: Point2::new(component.centroid.1, component.centroid.0),
        estimated_count: 2,
        pixel_count: component.pixel_count,
    };

    let bbox = component.bbox;
    let region = s![bbox.min_row..=bbox.max_row, bbox.min_col..=bbox.max_col];
    let mut roi = masked.slice(region).to_owned();
    ndarray::Zip::from(&mut roi)
        .and(&labels.slice(region))
        .for_each(|v, &l| {
            if l != component.label {
                *v = 0.0;
            }
        });

    let ceiling = config.flood_ceiling * component.max_intensity as f64;
    let step = (ceiling - threshold) / config.flood_steps.max(1) as f64;
    if step <= 0.0 {
        return unresolved;
    }

    for k in 1..=config.flood_steps {
        let level = threshold + k as f64 * step;
        roi.mapv_inplace(|v| if (v as f64) < level { 0.0 } else { v });

        let (sub_labels, n) = label_components(&roi.view(), config.connectivity);
        if n < 2 {
            continue;
        }
        let pieces = measure_components(&roi.view(), &sub_labels.view(), n);
        if pieces.iter().any(|p| p.pixel_count > config.pixel_upper) {
            continue;
        }
        if pieces.len() == 2 && pieces.iter().any(|p| p.pixel_count < config.roi_min_size) {
            debug!(
                label = component.label,
                step = k,
                "Split leaves a fragment below roi_min_size, keeping blob whole"
            );
            break;
        }

        let positions = pieces
            .iter()
            .map(|p| {
                Point2::new(
                    p.centroid.1 + bbox.min_col as f64,
                    p.centroid.0 + bbox.min_row as f64,
                )
            })
            .collect();
        debug!(label = component.label, step = k, pieces = n, "Resolved merged blob");
        return ComponentOutcome::Resolved { positions };
    }

    unresolved
}
