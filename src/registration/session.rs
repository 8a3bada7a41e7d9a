//! Per-pair correlation state: two modalities, their grids and the refinement history.
//!
//! The session owns only data; a user interface reads and changes it through
//! these methods. All composition of stage transforms goes through
//! [`TransformChain`].

use super::grid::{apply_transform, define_grid, GridDefinition, GridMode};
use super::precision::PrecisionEstimate;
use super::refinement::{refine, undo_refine, MatchedPointPair, RefinementHistory, RefinementRound};
use crate::config::RegistrationConfig;
use crate::data::{Image, ImageTransformer};
use crate::error::RegistrationError;
use crate::logging::OperationSpan;
use crate::peaks::Peak;
use crate::transform::{
    canonical_order, estimate_affine, FibGeometry, FibProjection, Orientation, Point2, StageKind,
    StageOp, Transform, TransformChain,
};
use ndarray::{stack, Array3, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modality {
    Fluorescence,
    Sem,
    Fib,
    Tem,
}

impl Modality {
    pub fn is_volume_slice(&self) -> bool {
        matches!(self, Modality::Fib)
    }
}

/// Progress of a session, derived from its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegistrationState {
    Undefined,
    GridDefined,
    Transformed,
    PointsSelected,
    Refined,
}

/// Image and registration inputs of one modality.
#[derive(Debug, Clone, PartialEq)]
pub struct ModalityState {
    pub modality: Modality,
    pub image: Image,
    pub orientation: Orientation,
    pub grid: Option<GridDefinition>,
    pub transformed: Option<Image>,
    /// Per-channel alignment applied before anything else.
    pub color_matrix: Option<Transform>,
    pub peaks: Vec<Peak>,
}

impl ModalityState {
    pub fn new(modality: Modality, image: Image) -> Self {
        Self {
            modality,
            image,
            orientation: Orientation::default(),
            grid: None,
            transformed: None,
            color_matrix: None,
            peaks: Vec::new(),
        }
    }

    pub fn with_peaks(mut self, peaks: Vec<Peak>) -> Self {
        self.peaks = peaks;
        self
    }
}

/// Source warped into the transformed target canvas, stacked with the target.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedImage {
    /// `(channel, row, col)`; channel 0 is the source, channel 1 the target.
    pub channels: Array3<f32>,
    pub pixel_size: f64,
}

impl MergedImage {
    pub fn num_channels(&self) -> usize {
        self.channels.len_of(Axis(0))
    }

    pub fn channel(&self, index: usize) -> Image {
        Image::new(self.channels.index_axis(Axis(0), index).to_owned(), self.pixel_size)
    }

    /// Per-pixel maximum over all channels.
    pub fn overlay(&self) -> Image {
        let overlay = self
            .channels
            .fold_axis(Axis(0), f32::NEG_INFINITY, |acc, &v| acc.max(v));
        Image::new(overlay, self.pixel_size)
    }
}

/// Correlates a source modality (usually fluorescence) with a target (SEM, FIB or TEM).
#[derive(Debug, Clone)]
pub struct CorrelationSession {
    id: Uuid,
    source: ModalityState,
    target: ModalityState,
    correspondence: Option<Transform>,
    fib_geometry: Option<FibGeometry>,
    pairs: Vec<MatchedPointPair>,
    history: RefinementHistory,
    merged: Option<MergedImage>,
    config: RegistrationConfig,
}

impl CorrelationSession {
    pub fn new(source: ModalityState, target: ModalityState) -> Self {
        Self::with_config(source, target, RegistrationConfig::default())
    }

    pub fn with_config(source: ModalityState, target: ModalityState, config: RegistrationConfig) -> Self {
        let id = Uuid::new_v4();
        debug!(session_id = %id, source = ?source.modality, target = ?target.modality, "Session created");
        Self {
            id,
            source,
            target,
            correspondence: None,
            fib_geometry: None,
            pairs: Vec::new(),
            history: RefinementHistory::new(),
            merged: None,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &ModalityState {
        &self.source
    }

    pub fn target(&self) -> &ModalityState {
        &self.target
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    pub fn pairs(&self) -> &[MatchedPointPair] {
        &self.pairs
    }

    pub fn history(&self) -> &RefinementHistory {
        &self.history
    }

    pub fn correspondence(&self) -> Option<&Transform> {
        self.correspondence.as_ref()
    }

    pub fn fib_geometry(&self) -> Option<&FibGeometry> {
        self.fib_geometry.as_ref()
    }

    pub fn state(&self) -> RegistrationState {
        if self.target.grid.is_none() {
            RegistrationState::Undefined
        } else if self.target.transformed.is_none() {
            RegistrationState::GridDefined
        } else if !self.pairs.is_empty() {
            RegistrationState::PointsSelected
        } else if !self.history.is_empty() {
            RegistrationState::Refined
        } else {
            RegistrationState::Transformed
        }
    }

    /// False after any change that alters the mapped output.
    pub fn merged_cache_valid(&self) -> bool {
        self.merged.is_some()
    }

    pub fn merged(&self) -> Option<&MergedImage> {
        self.merged.as_ref()
    }

    fn invalidate(&mut self) {
        self.merged = None;
    }

    fn default_mode(&self) -> GridMode {
        if self.config.rotation_only {
            GridMode::RotationOnly
        } else {
            GridMode::Affine
        }
    }

    /// Defines the source grid square on the source image's raw pixels.
    pub fn define_source_grid(&mut self, corners: &[Point2], mode: Option<GridMode>) -> crate::Result<&GridDefinition> {
        self.ensure_unrefined("redefine the source grid")?;
        let span = OperationSpan::new("define_source_grid", Some(self.id));
        let mode = mode.unwrap_or_else(|| self.default_mode());
        let grid = span.finish(define_grid(corners, self.source.image.shape(), mode))?;
        self.source.grid = Some(grid);
        self.update_correspondence()?;
        self.invalidate();
        self.source
            .grid
            .as_ref()
            .ok_or_else(|| RegistrationError::InvalidState("source grid missing".to_string()))
    }

    /// Defines the target grid square; the transformed target image is dropped until recomputed.
    pub fn define_target_grid(&mut self, corners: &[Point2], mode: Option<GridMode>) -> crate::Result<&GridDefinition> {
        self.ensure_unrefined("redefine the target grid")?;
        let span = OperationSpan::new("define_target_grid", Some(self.id));
        span.record_points(corners.len());
        let mode = mode.unwrap_or_else(|| self.default_mode());
        let grid = span.finish(define_grid(corners, self.target.image.shape(), mode))?;
        self.target.grid = Some(grid);
        self.target.transformed = None;
        self.pairs.clear();
        self.update_correspondence()?;
        self.invalidate();
        self.target
            .grid
            .as_ref()
            .ok_or_else(|| RegistrationError::InvalidState("target grid missing".to_string()))
    }

    /// Resamples the target image into its grid's transformed canvas.
    pub fn transform_target_image(&mut self) -> crate::Result<&Image> {
        let grid = self
            .target
            .grid
            .as_ref()
            .ok_or_else(|| RegistrationError::InvalidState("target grid is not defined".to_string()))?;
        let span = OperationSpan::new("transform_target_image", Some(self.id));
        let transformed = span.finish(apply_transform(&self.target.image, grid))?;
        self.invalidate();
        Ok(self.target.transformed.insert(transformed))
    }

    /// Changes how the source is flipped or rotated; locked once a refinement exists.
    pub fn set_source_orientation(&mut self, orientation: Orientation) -> crate::Result<()> {
        self.ensure_unrefined("change the source orientation")?;
        self.source.orientation = orientation;
        self.update_correspondence()?;
        self.invalidate();
        Ok(())
    }

    pub fn set_color_matrix(&mut self, matrix: Option<Transform>) -> crate::Result<()> {
        if let Some(m) = &matrix {
            m.inverse()?;
        }
        self.source.color_matrix = matrix;
        self.invalidate();
        Ok(())
    }

    /// Enables 3-D mapping into FIB slices.
    pub fn set_fib_projection(&mut self, geometry: FibGeometry) -> crate::Result<()> {
        if !self.target.modality.is_volume_slice() {
            return Err(RegistrationError::InvalidState(format!(
                "target modality {:?} has no FIB geometry",
                self.target.modality
            )));
        }
        self.ensure_unrefined("change the FIB geometry")?;
        self.fib_geometry = Some(geometry);
        self.invalidate();
        Ok(())
    }

    /// Adds a matched pair; `target` is in the transformed target canvas.
    pub fn add_pair(&mut self, source: Point2, z: Option<f64>, target: Point2) -> crate::Result<usize> {
        if self.state() < RegistrationState::Transformed {
            return Err(RegistrationError::InvalidState(
                "transform the target image before selecting points".to_string(),
            ));
        }
        if self.correspondence.is_none() {
            return Err(RegistrationError::InvalidState(
                "both grid squares are needed before selecting points".to_string(),
            ));
        }
        if self.fib_geometry.is_some() && z.is_none() {
            return Err(RegistrationError::InvalidInput(
                "points mapped into a FIB slice need a z position".to_string(),
            ));
        }
        self.pairs.push(MatchedPointPair { source, z, target });
        Ok(self.pairs.len() - 1)
    }

    pub fn clear_pairs(&mut self) {
        self.pairs.clear();
    }

    /// Refines the chain with the selected pairs and clears the selection.
    ///
    /// Without a selection, every target peak moved by hand is paired with the
    /// source peak at the same index.
    pub fn refine_selected(&mut self) -> crate::Result<&PrecisionEstimate> {
        let span = OperationSpan::new("refine", Some(self.id));
        let _enter = span.enter();

        let pairs = if self.pairs.is_empty() {
            self.moved_peak_pairs()?
        } else {
            self.pairs.clone()
        };
        span.record_points(pairs.len());

        let base = self.base_chain()?;
        let pixel_size = self.target.image.pixel_size;
        let round = span.finish(refine(&base, &mut self.history, &pairs, pixel_size, &self.config))?;
        span.record_precision(round.precision.rms, round.precision.std);

        self.pairs.clear();
        for peak in &mut self.target.peaks {
            peak.accept_position();
        }
        self.invalidate();
        self.history
            .precision()
            .ok_or_else(|| RegistrationError::InvalidState("refinement produced no estimate".to_string()))
    }

    /// Pairs built from target peaks moved onto their true position.
    fn moved_peak_pairs(&self) -> crate::Result<Vec<MatchedPointPair>> {
        let needs_z = self.fib_geometry.is_some();
        self.target
            .peaks
            .iter()
            .enumerate()
            .filter(|(_, peak)| peak.moved)
            .map(|(i, moved)| {
                let source = self.source.peaks.get(i).ok_or_else(|| {
                    RegistrationError::InvalidInput(format!("moved target peak {i} has no source peak"))
                })?;
                if needs_z && source.z.is_none() {
                    return Err(RegistrationError::InvalidInput(format!(
                        "source peak {i} has no z position for the FIB slice"
                    )));
                }
                Ok(MatchedPointPair {
                    source: source.position(),
                    z: source.z,
                    target: moved.position(),
                })
            })
            .collect()
    }

    /// Drops the latest refinement and puts its pairs back into the selection.
    pub fn undo_refine(&mut self) -> crate::Result<RefinementRound> {
        let span = OperationSpan::new("undo_refine", Some(self.id));
        let round = span.finish(undo_refine(&mut self.history))?;
        self.pairs = round.pairs.clone();
        self.invalidate();
        Ok(round)
    }

    /// Precision of the latest refinement round.
    pub fn precision(&self) -> Option<&PrecisionEstimate> {
        self.history.precision()
    }

    /// Chain into the transformed target canvas, without refinement.
    pub fn base_chain(&self) -> crate::Result<TransformChain> {
        let correspondence = self.correspondence.ok_or_else(|| {
            RegistrationError::InvalidState("both grid squares must be defined".to_string())
        })?;

        let mut chain = TransformChain::new();
        if let Some(color) = self.source.color_matrix {
            chain.set_planar(StageKind::ColorChannel, color);
        }
        if !self.source.orientation.is_identity() {
            chain.set_planar(
                StageKind::Orientation,
                self.source.orientation.matrix(self.source.image.shape()),
            );
        }
        match &self.fib_geometry {
            Some(geometry) => chain.set(
                StageKind::Fib,
                StageOp::Fib(FibProjection::new(&correspondence, geometry, self.pixel_ratio())),
            ),
            None => chain.set_planar(StageKind::Correspondence, correspondence),
        }
        Ok(chain)
    }

    /// Source pixel size over target pixel size.
    fn pixel_ratio(&self) -> f64 {
        let target = self.target.image.pixel_size;
        if target > 0.0 {
            self.source.image.pixel_size / target
        } else {
            1.0
        }
    }

    /// Full chain into the transformed target canvas.
    pub fn chain(&self) -> crate::Result<TransformChain> {
        Ok(self.history.chain(&self.base_chain()?))
    }

    /// Full chain into the target's raw, untransformed pixels.
    pub fn raw_target_chain(&self) -> crate::Result<TransformChain> {
        let grid = self
            .target
            .grid
            .as_ref()
            .ok_or_else(|| RegistrationError::InvalidState("target grid is not defined".to_string()))?;
        let mut chain = self.chain()?;
        chain.set_planar(StageKind::TargetFrame, grid.transform.inverse()?);
        Ok(chain)
    }

    /// Maps a raw source pixel into the transformed target canvas.
    pub fn map_point(&self, point: Point2, z: Option<f64>) -> crate::Result<Point2> {
        self.chain()?.apply(point, z)
    }

    /// Maps a raw source pixel into the target's raw pixels.
    pub fn map_point_raw(&self, point: Point2, z: Option<f64>) -> crate::Result<Point2> {
        self.raw_target_chain()?.apply(point, z)
    }

    /// Maps every source peak; each peak fails on its own (e.g. missing z).
    pub fn map_peaks(&self) -> crate::Result<Vec<crate::Result<Point2>>> {
        let chain = self.chain()?;
        Ok(self
            .source
            .peaks
            .iter()
            .map(|peak| chain.apply(peak.position(), peak.z))
            .collect())
    }

    /// Warps the source through the full chain into the transformed target
    /// canvas and stacks it with the target. The result is cached until the
    /// next change to the mapping.
    pub fn merge(&mut self) -> crate::Result<&MergedImage> {
        if self.history.is_empty() {
            return Err(RegistrationError::InvalidState(
                "refine at least once before merging".to_string(),
            ));
        }
        if self.fib_geometry.is_some() {
            return Err(RegistrationError::InvalidState(
                "merging into a FIB slice needs a z position per pixel".to_string(),
            ));
        }
        if self.merged.is_none() {
            let merged = self.build_merge()?;
            self.merged = Some(merged);
        } else {
            debug!(session_id = %self.id, "Using cached merge");
        }
        self.merged
            .as_ref()
            .ok_or_else(|| RegistrationError::InvalidState("merge produced no image".to_string()))
    }

    fn build_merge(&self) -> crate::Result<MergedImage> {
        let span = OperationSpan::new("merge", Some(self.id));
        let _enter = span.enter();
        let target = self
            .target
            .transformed
            .as_ref()
            .ok_or_else(|| RegistrationError::InvalidState("target image is not transformed".to_string()))?;
        let forward = self.chain()?.planar_matrix()?;
        let warped = span.finish(ImageTransformer::warp(&self.source.image, &forward, target.shape()))?;
        let channels = stack(Axis(0), &[warped.data.view(), target.data.view()])
            .map_err(|e| RegistrationError::InvalidInput(format!("cannot stack merged channels: {e}")))?;

        info!(session_id = %self.id, rows = target.height(), cols = target.width(), "Merged source into target");
        Ok(MergedImage {
            channels,
            pixel_size: target.pixel_size,
        })
    }

    pub fn set_source_peaks(&mut self, peaks: Vec<Peak>) {
        self.source.peaks = peaks;
    }

    pub fn set_target_peaks(&mut self, peaks: Vec<Peak>) {
        self.target.peaks = peaks;
    }

    fn ensure_unrefined(&self, action: &str) -> crate::Result<()> {
        if self.history.is_empty() {
            Ok(())
        } else {
            Err(RegistrationError::InvalidState(format!(
                "cannot {action} after refinement; undo all refinements first"
            )))
        }
    }

    /// Source grid (oriented) onto the target's transformed grid, paired by canonical order.
    fn update_correspondence(&mut self) -> crate::Result<()> {
        let (Some(source), Some(target)) = (&self.source.grid, &self.target.grid) else {
            self.correspondence = None;
            return Ok(());
        };
        let oriented = self
            .source
            .orientation
            .apply_to_points(&source.corners, self.source.image.shape());
        let correspondence = estimate_affine(
            &canonical_order(&oriented),
            &canonical_order(&target.transformed_points),
        )?;
        self.correspondence = Some(correspondence);
        Ok(())
    }

    pub(crate) fn from_parts(
        id: Uuid,
        source: ModalityState,
        target: ModalityState,
        fib_geometry: Option<FibGeometry>,
        pairs: Vec<MatchedPointPair>,
        history: RefinementHistory,
        config: RegistrationConfig,
    ) -> crate::Result<Self> {
        let mut session = Self {
            id,
            source,
            target,
            correspondence: None,
            fib_geometry,
            pairs,
            history,
            merged: None,
            config,
        };
        session.update_correspondence()?;
        Ok(session)
    }
}
